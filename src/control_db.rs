//! `ControlDb` is the narrow interface the core talks to an external
//! relational database through, standing in for the "config" / "QMetadata"
//! / "QStatsTmp" / "memLock" tables described in spec §6. The core never
//! embeds a SQL client; a real deployment supplies its own `ControlDb`
//! backed by a MySQL/Postgres connection pool.

use crate::error::Result;
use crate::ids::{JobId, QueryId, RequestId, WorkerId};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

/// One row of the `config_worker` table family.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub name: WorkerId,
    pub is_enabled: bool,
    pub is_read_only: bool,
    pub svc_host: String,
    pub svc_port: u16,
    pub data_dir: String,
}

/// A persisted Request state transition, recorded before the user callback
/// fires (spec §4.3 invariant b).
#[derive(Debug, Clone)]
pub struct RequestTransition {
    pub request_id: RequestId,
    pub worker: WorkerId,
    pub state: String,
    pub extended_state: String,
}

/// A `QProgress` row: `(queryId, totalChunks, completedChunks, ...)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryProgress {
    pub total_chunks: u64,
    pub completed_chunks: u64,
}

#[async_trait]
pub trait ControlDb: Send + Sync {
    /// Schema version sentinel check; a mismatch is fatal at startup.
    async fn check_schema_version(&self, expected: u32) -> Result<()>;

    async fn worker_config(&self, worker: &WorkerId) -> Result<Option<WorkerConfig>>;

    async fn all_worker_configs(&self) -> Result<Vec<WorkerConfig>>;

    /// Persist a Request state transition. Per invariant (b) this must
    /// complete (or at least be attempted) before the owning state machine
    /// invokes its user callback.
    async fn persist_request_transition(&self, transition: RequestTransition) -> Result<()>;

    async fn record_progress(&self, query_id: QueryId, job_id: JobId, progress: QueryProgress)
        -> Result<()>;

    async fn read_progress(&self, query_id: QueryId) -> Result<Option<QueryProgress>>;

    /// Read the single-row `memLock` ownership table for a worker.
    async fn read_mem_lock(&self, worker: &WorkerId) -> Result<Option<u64>>;

    /// Unconditionally (re)write the `memLock` row, claiming ownership.
    async fn write_mem_lock(&self, worker: &WorkerId, uid: u64) -> Result<()>;

    async fn clear_mem_lock(&self, worker: &WorkerId) -> Result<()>;
}

/// In-memory `ControlDb` used by tests and as a usable embedded default.
#[derive(Default)]
pub struct MemoryControlDb {
    workers: Mutex<HashMap<WorkerId, WorkerConfig>>,
    transitions: Mutex<Vec<RequestTransition>>,
    progress: Mutex<HashMap<QueryId, QueryProgress>>,
    mem_locks: Mutex<HashMap<WorkerId, u64>>,
    schema_version: u32,
}

impl MemoryControlDb {
    pub fn new(schema_version: u32) -> Self {
        Self { schema_version, ..Default::default() }
    }

    pub fn register_worker(&self, config: WorkerConfig) {
        self.workers.lock().unwrap().insert(config.name.clone(), config);
    }

    /// Test/diagnostic accessor: all transitions recorded so far.
    pub fn transitions(&self) -> Vec<RequestTransition> {
        self.transitions.lock().unwrap().clone()
    }
}

#[async_trait]
impl ControlDb for MemoryControlDb {
    async fn check_schema_version(&self, expected: u32) -> Result<()> {
        if expected != self.schema_version {
            return Err(crate::error::CoreError::SchemaVersionMismatch {
                expected,
                found: self.schema_version,
            });
        }
        Ok(())
    }

    async fn worker_config(&self, worker: &WorkerId) -> Result<Option<WorkerConfig>> {
        Ok(self.workers.lock().unwrap().get(worker).cloned())
    }

    async fn all_worker_configs(&self) -> Result<Vec<WorkerConfig>> {
        Ok(self.workers.lock().unwrap().values().cloned().collect())
    }

    async fn persist_request_transition(&self, transition: RequestTransition) -> Result<()> {
        self.transitions.lock().unwrap().push(transition);
        Ok(())
    }

    async fn record_progress(
        &self,
        query_id: QueryId,
        _job_id: JobId,
        progress: QueryProgress,
    ) -> Result<()> {
        self.progress.lock().unwrap().insert(query_id, progress);
        Ok(())
    }

    async fn read_progress(&self, query_id: QueryId) -> Result<Option<QueryProgress>> {
        Ok(self.progress.lock().unwrap().get(&query_id).copied())
    }

    async fn read_mem_lock(&self, worker: &WorkerId) -> Result<Option<u64>> {
        Ok(self.mem_locks.lock().unwrap().get(worker).copied())
    }

    async fn write_mem_lock(&self, worker: &WorkerId, uid: u64) -> Result<()> {
        self.mem_locks.lock().unwrap().insert(worker.clone(), uid);
        Ok(())
    }

    async fn clear_mem_lock(&self, worker: &WorkerId) -> Result<()> {
        self.mem_locks.lock().unwrap().remove(worker);
        Ok(())
    }
}
