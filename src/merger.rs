//! `ResultMerger` — the czar-side import of per-chunk result dumps into a
//! single merge table, plus post-merge aggregation/order/limit (spec
//! §4.8). Grounded on the original implementation's
//! `rproc::InfileMerger`/`TableMerger` for the create-first-time-then-
//! insert protocol and on the donor codebase's `analytics::query_cache`
//! style for the size-bounded admission gate.

use crate::error::{CoreError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Abstracts the MySQL client the czar runs merge DDL/DML through (spec
/// §1 Non-goals: the wire protocol itself is out of scope).
#[async_trait]
pub trait MergeSqlExecutor: Send + Sync {
    async fn execute(&self, sql: &str) -> Result<()>;
}

/// Records every statement it was asked to run; used by tests and the
/// demo binary in place of a real MySQL connection.
#[derive(Default)]
pub struct RecordingMergeExecutor {
    pub statements: Mutex<Vec<String>>,
}

#[async_trait]
impl MergeSqlExecutor for RecordingMergeExecutor {
    async fn execute(&self, sql: &str) -> Result<()> {
        self.statements.lock().push(sql.to_string());
        Ok(())
    }
}

/// What the original user query requires after every chunk has been
/// imported into the merge table: re-aggregation, an ORDER BY, a LIMIT,
/// or some combination, expressed as the literal SQL fragments to splice
/// into the `finalize()` statement (spec §4.8 "fixup-select"/"orderByLimit").
#[derive(Debug, Clone, Default)]
pub struct FinalizeSpec {
    pub fixup_select: Option<String>,
    pub order_by_limit: Option<String>,
}

impl FinalizeSpec {
    pub fn is_noop(&self) -> bool {
        self.fixup_select.is_none() && self.order_by_limit.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MergerState {
    Empty,
    Merging,
    Squashed,
}

struct Inner {
    state: MergerState,
    total_size: u64,
    chunks_merged: u64,
}

/// Imports per-chunk dump tables into `<target_db>.result_<id>` and
/// applies a post-merge finalize step (spec §4.8).
pub struct ResultMerger {
    target_db: String,
    merge_id: String,
    result_limit_bytes: u64,
    executor: Arc<dyn MergeSqlExecutor>,
    inner: Mutex<Inner>,
    create_lock: tokio::sync::Mutex<()>,
    squashed: AtomicBool,
    squash_callback: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
    squash_fired: AtomicU64,
}

impl ResultMerger {
    pub fn new(target_db: impl Into<String>, merge_id: impl Into<String>, result_limit_bytes: u64, executor: Arc<dyn MergeSqlExecutor>) -> Arc<Self> {
        Arc::new(Self {
            target_db: target_db.into(),
            merge_id: merge_id.into(),
            result_limit_bytes,
            executor,
            inner: Mutex::new(Inner { state: MergerState::Empty, total_size: 0, chunks_merged: 0 }),
            create_lock: tokio::sync::Mutex::new(()),
            squashed: AtomicBool::new(false),
            squash_callback: Mutex::new(None),
            squash_fired: AtomicU64::new(0),
        })
    }

    /// Callback invoked at most once, the moment `resultLimit` is exceeded
    /// (spec §4.8 "squashRemaining"): a real deployment wires this to
    /// `AsyncQueryManager::squashRemaining`, cancelling outstanding
    /// per-chunk requests.
    pub fn on_squash(&self, callback: impl Fn() + Send + Sync + 'static) {
        *self.squash_callback.lock() = Some(Box::new(callback));
    }

    pub fn merge_table_name(&self) -> String {
        format!("{}.result_{}", self.target_db, self.merge_id)
    }

    pub fn total_size(&self) -> u64 {
        self.inner.lock().total_size
    }

    pub fn is_squashed(&self) -> bool {
        self.squashed.load(Ordering::SeqCst)
    }

    /// Import one chunk's dump into the merge table. The first successful
    /// call creates the merge table (serialized under `create_lock` per
    /// spec invariant: "the first chunk import happens-before every
    /// subsequent import"); subsequent calls run an `INSERT ... SELECT`
    /// that may execute concurrently with other chunks' imports.
    pub async fn merge(&self, dump_table: &str, dump_size_bytes: u64) -> Result<()> {
        if self.is_squashed() {
            return Err(CoreError::Merge("merger is squashed, no further merges accepted".to_string()));
        }

        {
            let _guard = self.create_lock.lock().await;
            let mut inner = self.inner.lock();
            let needs_create = inner.state == MergerState::Empty;
            if needs_create {
                inner.state = MergerState::Merging;
            }
            drop(inner);
            if needs_create {
                let sql = format!("CREATE TABLE {} AS SELECT * FROM {} LIMIT 0", self.merge_table_name(), dump_table);
                self.executor.execute(&sql).await?;
            }
        };

        let sql = format!("INSERT INTO {} SELECT * FROM {}", self.merge_table_name(), dump_table);
        self.executor.execute(&sql).await?;

        let drop_sql = format!("DROP TABLE {}", dump_table);
        self.executor.execute(&drop_sql).await?;

        let mut inner = self.inner.lock();
        inner.total_size += dump_size_bytes;
        inner.chunks_merged += 1;
        let total_size = inner.total_size;
        drop(inner);

        if total_size > self.result_limit_bytes {
            self.squash();
        }
        Ok(())
    }

    /// Cancels all further merges and fires the squash callback exactly
    /// once.
    fn squash(&self) {
        if self.squashed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.squash_fired.fetch_add(1, Ordering::SeqCst);
        self.inner.lock().state = MergerState::Squashed;
        warn!(merge_table = %self.merge_table_name(), total_size = self.total_size(), "result limit exceeded, squashing remaining requests");
        if let Some(cb) = self.squash_callback.lock().as_ref() {
            cb();
        }
    }

    pub fn squash_count(&self) -> u64 {
        self.squash_fired.load(Ordering::SeqCst)
    }

    /// `finalize()` (spec §4.8): if the original query needs aggregation,
    /// ordering, or a limit, builds `<target_db>.result_<id>_m` from the
    /// merge table and drops the intermediate. A no-op `FinalizeSpec`
    /// leaves the merge table as the final result.
    pub async fn finalize(&self, spec: &FinalizeSpec) -> Result<String> {
        if self.is_squashed() {
            return Err(CoreError::Merge("cannot finalize a squashed merger".to_string()));
        }
        if spec.is_noop() {
            return Ok(self.merge_table_name());
        }
        let select = spec.fixup_select.as_deref().unwrap_or("*");
        let order_by_limit = spec.order_by_limit.as_deref().unwrap_or("");
        let final_table = format!("{}.result_{}_m", self.target_db, self.merge_id);
        let sql = format!("CREATE TABLE {} AS SELECT {} FROM {} {}", final_table, select, self.merge_table_name(), order_by_limit);
        self.executor.execute(&sql).await?;
        let drop_sql = format!("DROP TABLE {}", self.merge_table_name());
        self.executor.execute(&drop_sql).await?;
        info!(final_table = %final_table, "merge finalized");
        Ok(final_table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn first_merge_creates_table_subsequent_insert_s3() {
        let executor = Arc::new(RecordingMergeExecutor::default());
        let merger = ResultMerger::new("qservResult", "q1", 10 * 1024 * 1024, executor.clone());
        merger.merge("dump_1", 1024).await.unwrap();
        merger.merge("dump_2", 1024).await.unwrap();
        let statements = executor.statements.lock();
        assert!(statements[0].starts_with("CREATE TABLE"));
        assert!(statements.iter().any(|s| s.starts_with("INSERT INTO")));
    }

    #[tokio::test]
    async fn squashes_after_result_limit_exceeded_s3() {
        let executor = Arc::new(RecordingMergeExecutor::default());
        let merger = ResultMerger::new("qservResult", "q1", 10 * 1024 * 1024, executor);
        let squash_calls = Arc::new(AtomicUsize::new(0));
        let squash_calls2 = squash_calls.clone();
        merger.on_squash(move || {
            squash_calls2.fetch_add(1, Ordering::SeqCst);
        });

        let three_mb = 3 * 1024 * 1024;
        for i in 0..4 {
            merger.merge(&format!("dump_{i}"), three_mb).await.unwrap();
        }
        assert!(merger.is_squashed(), "12MB > 10MB limit must squash");
        assert_eq!(squash_calls.load(Ordering::SeqCst), 1);

        let result = merger.merge("dump_4", three_mb).await;
        assert!(result.is_err(), "fifth dump must not be merged once squashed");
        assert_eq!(squash_calls.load(Ordering::SeqCst), 1, "squash fires exactly once");
    }

    #[tokio::test]
    async fn finalize_is_noop_passthrough_without_spec() {
        let executor = Arc::new(RecordingMergeExecutor::default());
        let merger = ResultMerger::new("qservResult", "q1", 10 * 1024 * 1024, executor.clone());
        merger.merge("dump_1", 10).await.unwrap();
        let final_table = merger.finalize(&FinalizeSpec::default()).await.unwrap();
        assert_eq!(final_table, merger.merge_table_name());
        assert!(executor.statements.lock().iter().all(|s| !s.contains("result_q1_m")));
    }

    #[tokio::test]
    async fn finalize_applies_fixup_and_order_by_limit() {
        let executor = Arc::new(RecordingMergeExecutor::default());
        let merger = ResultMerger::new("qservResult", "q1", 10 * 1024 * 1024, executor.clone());
        merger.merge("dump_1", 10).await.unwrap();
        let spec = FinalizeSpec { fixup_select: Some("objectId, SUM(flux)".to_string()), order_by_limit: Some("ORDER BY objectId LIMIT 10".to_string()) };
        let final_table = merger.finalize(&spec).await.unwrap();
        assert_eq!(final_table, "qservResult.result_q1_m");
        let statements = executor.statements.lock();
        assert!(statements.iter().any(|s| s.contains("SUM(flux)") && s.contains("ORDER BY objectId LIMIT 10")));
        assert!(statements.iter().any(|s| s.starts_with("DROP TABLE qservResult.result_q1")));
    }
}
