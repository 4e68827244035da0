//! Crate configuration.
//!
//! Configuration *file* loading is out of scope (see spec §1) — this struct
//! is the seam an out-of-tree front end populates, either by hand or by
//! deserializing it from whatever format that front end prefers (it derives
//! `serde::Deserialize`, so `serde_json`/`toml`/etc. all work unmodified).
//! Library code never reads a file or an environment variable on its own.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-priority sub-queue sizing for a [`crate::executor::PriorityExecutor`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorityQueueConfig {
    pub priority: i32,
    pub min_running: usize,
    pub max_running: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    pub pool_size: usize,
    pub default_priority: i32,
    pub queues: Vec<PriorityQueueConfig>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            pool_size: num_cpus::get().max(4),
            default_priority: 100,
            queues: vec![
                PriorityQueueConfig { priority: 0, min_running: 1, max_running: 4 },
                PriorityQueueConfig { priority: 1, min_running: 1, max_running: 8 },
                PriorityQueueConfig { priority: 100, min_running: 0, max_running: 4 },
            ],
        }
    }
}

/// Tunables for [`crate::request::Request`]'s adaptive tracking timer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingConfig {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// Per-scan-rating runtime limits used by the worker scheduler's booting
/// inspector (spec §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub interactive_min_running: usize,
    pub interactive_max_running: usize,
    pub scan_max_running: usize,
    pub snail_max_running: usize,
    pub runtime_limit_fastest: Duration,
    pub runtime_limit_fast: Duration,
    pub runtime_limit_medium: Duration,
    pub runtime_limit_slow: Duration,
    pub runtime_limit_slowest: Duration,
    pub max_boots_per_query: u32,
    pub boot_inspection_period: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interactive_min_running: 1,
            interactive_max_running: 20,
            scan_max_running: 8,
            snail_max_running: 2,
            runtime_limit_fastest: Duration::from_secs(60),
            runtime_limit_fast: Duration::from_secs(120),
            runtime_limit_medium: Duration::from_secs(300),
            runtime_limit_slow: Duration::from_secs(600),
            runtime_limit_slowest: Duration::from_secs(1200),
            max_boots_per_query: 3,
            boot_inspection_period: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergerConfig {
    pub result_limit_bytes: u64,
}

impl Default for MergerConfig {
    fn default() -> Self {
        Self { result_limit_bytes: 1024 * 1024 * 1024 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectorIndexConfig {
    pub max_in_flight_per_worker: usize,
    pub use_local_infile: bool,
}

impl Default for DirectorIndexConfig {
    fn default() -> Self {
        Self { max_in_flight_per_worker: 2, use_local_infile: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LargeResultConfig {
    pub running_count_max: usize,
}

impl Default for LargeResultConfig {
    fn default() -> Self {
        Self { running_count_max: 8 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CoreConfig {
    pub executor: ExecutorConfig,
    pub tracking: TrackingConfig,
    pub scheduler: SchedulerConfig,
    pub merger: MergerConfig,
    pub director_index: DirectorIndexConfig,
    pub large_result: LargeResultConfig,
}

impl CoreConfig {
    /// Overlay a handful of tunables from environment variables, for the
    /// demonstration binary only. Library callers should just build a
    /// `CoreConfig` directly.
    pub fn from_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var("QSERV_CORE_POOL_SIZE") {
            if let Ok(n) = v.parse() {
                self.executor.pool_size = n;
            }
        }
        if let Ok(v) = std::env::var("QSERV_CORE_RESULT_LIMIT_BYTES") {
            if let Ok(n) = v.parse() {
                self.merger.result_limit_bytes = n;
            }
        }
        self
    }
}
