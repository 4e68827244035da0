//! Worker-side `Task` and its execution machinery (spec §3, §4.7):
//! fragments of a rewritten per-chunk SQL query, a `SqlExecutor` seam
//! standing in for the MySQL client library, and a `SendChannel` seam
//! standing in for the framed transmit-back-to-czar path. Grounded on the
//! donor codebase's `clustering::query_execution` dispatch style for the
//! Task/fragment shape and `networking::pool::channel` for the streaming
//! send abstraction.

use crate::chunk_resource::{ChunkResourceKey, ChunkResourceManager, MlockSerializer};
use crate::error::{CoreError, Result};
use crate::ids::{ChunkId, JobId, QueryId, SubChunkId};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ScanRating {
    Fastest,
    Fast,
    Medium,
    Slow,
    Slowest,
}

#[derive(Debug, Clone)]
pub struct ScanTable {
    pub database: String,
    pub table: String,
    pub lock_in_memory: bool,
    pub rating: ScanRating,
}

/// Sorted so the slowest scanned table comes first (spec §3); that table
/// decides which shared-scan queue admits the Task.
#[derive(Debug, Clone)]
pub struct ScanInfo {
    pub tables: Vec<ScanTable>,
}

impl ScanInfo {
    pub fn new(mut tables: Vec<ScanTable>) -> Self {
        tables.sort_by(|a, b| b.rating.cmp(&a.rating));
        Self { tables }
    }

    pub fn slowest_rating(&self) -> Option<ScanRating> {
        self.tables.first().map(|t| t.rating)
    }
}

#[derive(Debug, Clone)]
pub struct SubChunkSelector {
    pub database: String,
    pub tables: Vec<String>,
    pub ids: Vec<SubChunkId>,
}

#[derive(Debug, Clone)]
pub struct Fragment {
    pub sql_queries: Vec<String>,
    pub result_table: String,
    pub sub_chunks: Option<SubChunkSelector>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Created,
    Queued,
    Running,
    Finished,
}

/// A worker-side unit of execution: one chunk fragment of one query.
pub struct Task {
    pub query_id: QueryId,
    pub job_id: JobId,
    pub chunk_id: ChunkId,
    pub database: String,
    pub fragments: Vec<Fragment>,
    pub user: String,
    pub scan_info: ScanInfo,
    pub interactive: bool,
    state: Mutex<TaskState>,
    pub queue_time: Mutex<Option<Instant>>,
    pub start_time: Mutex<Option<Instant>>,
    pub finish_time: Mutex<Option<Instant>>,
    cancelled: AtomicBool,
    boots: AtomicU64,
}

impl Task {
    pub fn new(
        query_id: QueryId,
        job_id: JobId,
        chunk_id: ChunkId,
        database: impl Into<String>,
        fragments: Vec<Fragment>,
        user: impl Into<String>,
        scan_info: ScanInfo,
        interactive: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            query_id,
            job_id,
            chunk_id,
            database: database.into(),
            fragments,
            user: user.into(),
            scan_info,
            interactive,
            state: Mutex::new(TaskState::Created),
            queue_time: Mutex::new(None),
            start_time: Mutex::new(None),
            finish_time: Mutex::new(None),
            cancelled: AtomicBool::new(false),
            boots: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> crate::ids::TaskId {
        crate::ids::TaskId::new(self.query_id, self.job_id, self.chunk_id)
    }

    pub fn state(&self) -> TaskState {
        *self.state.lock()
    }

    pub fn mark_queued(&self) {
        *self.state.lock() = TaskState::Queued;
        *self.queue_time.lock() = Some(Instant::now());
    }

    pub fn mark_running(&self) {
        *self.state.lock() = TaskState::Running;
        *self.start_time.lock() = Some(Instant::now());
    }

    pub fn mark_finished(&self) {
        *self.state.lock() = TaskState::Finished;
        *self.finish_time.lock() = Some(Instant::now());
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn boot(&self) -> u64 {
        self.boots.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn boots(&self) -> u64 {
        self.boots.load(Ordering::SeqCst)
    }

    pub fn duration(&self) -> Option<std::time::Duration> {
        let start = (*self.start_time.lock())?;
        let finish_opt: Option<Instant> = *self.finish_time.lock();
        let finish = finish_opt.unwrap_or_else(Instant::now);
        Some(finish.saturating_duration_since(start))
    }
}

/// Receives rows streamed back from a Task, partitioned into framed
/// "bucket" messages plus a final terminator (spec §4.7).
#[async_trait]
pub trait SendChannel: Send + Sync {
    async fn send_bucket(&self, rows: Vec<u8>) -> Result<()>;
    async fn send_terminator(&self) -> Result<()>;
}

/// In-memory `SendChannel` used by tests and the demo binary.
#[derive(Default)]
pub struct CollectingSendChannel {
    pub buckets: Mutex<Vec<Vec<u8>>>,
    pub terminated: AtomicBool,
}

#[async_trait]
impl SendChannel for CollectingSendChannel {
    async fn send_bucket(&self, rows: Vec<u8>) -> Result<()> {
        self.buckets.lock().push(rows);
        Ok(())
    }

    async fn send_terminator(&self) -> Result<()> {
        self.terminated.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Abstracts the MySQL client library the worker executes fragments
/// against (spec §1 Non-goals: "we assume a thread-safe client library").
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    /// Execute one statement, returning its result rows as opaque bytes
    /// (a real implementation hands back iterable row sets; this crate
    /// only needs to move bytes to the `SendChannel`).
    async fn execute(&self, sql: &str) -> Result<Vec<u8>>;

    /// Kill whatever statement is associated with `connection_id`,
    /// supporting cooperative Task cancellation.
    async fn cancel(&self, connection_id: u64) -> Result<()>;

    fn connection_id(&self) -> u64;
}

/// Canned-response `SqlExecutor` for tests: records every statement it
/// was asked to run and returns a fixed payload.
pub struct MockSqlExecutor {
    pub connection_id: u64,
    pub executed: Mutex<Vec<String>>,
    pub response: Vec<u8>,
    pub fail_on: Option<String>,
}

impl MockSqlExecutor {
    pub fn new(connection_id: u64, response: Vec<u8>) -> Self {
        Self { connection_id, executed: Mutex::new(Vec::new()), response, fail_on: None }
    }
}

#[async_trait]
impl SqlExecutor for MockSqlExecutor {
    async fn execute(&self, sql: &str) -> Result<Vec<u8>> {
        self.executed.lock().push(sql.to_string());
        if let Some(needle) = &self.fail_on {
            if sql.contains(needle.as_str()) {
                return Err(CoreError::WorkerResource(format!("simulated failure executing: {sql}")));
            }
        }
        Ok(self.response.clone())
    }

    async fn cancel(&self, _connection_id: u64) -> Result<()> {
        Ok(())
    }

    fn connection_id(&self) -> u64 {
        self.connection_id
    }
}

/// Drives one Task's fragments through `waitForMemMan`, the SQL executor,
/// and the `SendChannel` (spec §4.7 steps 1-4).
pub struct TaskQueryRunner {
    sql_executor: Arc<dyn SqlExecutor>,
    mlock: Arc<MlockSerializer>,
    resources: Arc<ChunkResourceManager>,
}

impl TaskQueryRunner {
    pub fn new(sql_executor: Arc<dyn SqlExecutor>, mlock: Arc<MlockSerializer>, resources: Arc<ChunkResourceManager>) -> Self {
        Self { sql_executor, mlock, resources }
    }

    pub async fn run(&self, task: &Task, channel: &dyn SendChannel) -> Result<()> {
        task.mark_running();

        for table in &task.scan_info.tables {
            if table.lock_in_memory {
                self.mlock.wait_for_mem_man(format!("{}.{}", table.database, table.table)).await?;
            }
        }

        for fragment in &task.fragments {
            if task.is_cancelled() {
                self.sql_executor.cancel(self.sql_executor.connection_id()).await?;
                return Err(CoreError::Cancelled(task.id().to_string()));
            }

            let _handle = if let Some(selector) = &fragment.sub_chunks {
                let keys: Vec<ChunkResourceKey> = selector
                    .tables
                    .iter()
                    .flat_map(|t| selector.ids.iter().map(move |id| ChunkResourceKey::new(selector.database.as_str(), t.as_str(), task.chunk_id, *id)))
                    .collect();
                Some(self.resources.acquire(keys).await?)
            } else {
                None
            };

            for sql in &fragment.sql_queries {
                let rows = self.sql_executor.execute(sql).await?;
                channel.send_bucket(rows).await?;
            }
        }

        channel.send_terminator().await?;
        task.mark_finished();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_db::MemoryControlDb;
    use crate::ids::WorkerId;

    fn sample_task() -> Arc<Task> {
        let scan_info = ScanInfo::new(vec![ScanTable {
            database: "LSST".to_string(),
            table: "Object".to_string(),
            lock_in_memory: false,
            rating: ScanRating::Medium,
        }]);
        Task::new(
            1,
            1,
            10,
            "LSST",
            vec![Fragment { sql_queries: vec!["SELECT 1".to_string()], result_table: "r".to_string(), sub_chunks: None }],
            "alice",
            scan_info,
            false,
        )
    }

    #[tokio::test]
    async fn runner_streams_rows_and_terminates() {
        let control_db: Arc<dyn crate::control_db::ControlDb> = Arc::new(MemoryControlDb::new(1));
        let resources = ChunkResourceManager::start(control_db, WorkerId::from("w1")).await.unwrap();
        let mlock = MlockSerializer::start();
        let executor = Arc::new(MockSqlExecutor::new(1, b"row-data".to_vec()));
        let runner = TaskQueryRunner::new(executor, mlock, resources);
        let channel = CollectingSendChannel::default();
        let task = sample_task();

        runner.run(&task, &channel).await.unwrap();

        assert_eq!(channel.buckets.lock().len(), 1);
        assert!(channel.terminated.load(Ordering::SeqCst));
        assert_eq!(task.state(), TaskState::Finished);
    }

    #[tokio::test]
    async fn cancelled_task_does_not_execute_remaining_fragments() {
        let control_db: Arc<dyn crate::control_db::ControlDb> = Arc::new(MemoryControlDb::new(1));
        let resources = ChunkResourceManager::start(control_db, WorkerId::from("w1")).await.unwrap();
        let mlock = MlockSerializer::start();
        let executor = Arc::new(MockSqlExecutor::new(1, b"row-data".to_vec()));
        let runner = TaskQueryRunner::new(executor, mlock, resources);
        let channel = CollectingSendChannel::default();
        let task = sample_task();
        task.cancel();

        let result = runner.run(&task, &channel).await;
        assert!(matches!(result, Err(CoreError::Cancelled(_))));
        assert!(channel.buckets.lock().is_empty());
    }

    #[test]
    fn scan_info_sorts_slowest_first() {
        let scan_info = ScanInfo::new(vec![
            ScanTable { database: "d".into(), table: "fast".into(), lock_in_memory: false, rating: ScanRating::Fast },
            ScanTable { database: "d".into(), table: "slowest".into(), lock_in_memory: false, rating: ScanRating::Slowest },
        ]);
        assert_eq!(scan_info.slowest_rating(), Some(ScanRating::Slowest));
    }
}
