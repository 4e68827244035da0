//! Cross-module scenario tests exercising the properties in spec §8 that
//! span more than one component: a full worker-side Task lifecycle
//! through the scheduler, resource manager, and executor; a replica-side
//! job sweeping several workers; and the memory-lock takeover detection
//! in §8 S6.

use qserv_core::chunk_resource::ChunkResourceManager;
use qserv_core::config::SchedulerConfig;
use qserv_core::control_db::{ControlDb, MemoryControlDb};
use qserv_core::ids::WorkerId;
use qserv_core::job;
use qserv_core::messenger::{LoopbackTransport, Messenger};
use qserv_core::scheduler::BlendScheduler;
use qserv_core::stats::QueryStatistics;
use qserv_core::task::{CollectingSendChannel, Fragment, MockSqlExecutor, ScanInfo, ScanRating, ScanTable, Task, TaskQueryRunner};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn full_task_lifecycle_through_scheduler_and_resources() {
    let control_db: Arc<dyn ControlDb> = Arc::new(MemoryControlDb::new(1));
    let worker = WorkerId::from("worker1");
    let resources = ChunkResourceManager::start(control_db, worker).await.unwrap();
    let mlock = qserv_core::chunk_resource::MlockSerializer::start();
    let stats = Arc::new(QueryStatistics::new());
    let scheduler = BlendScheduler::new(SchedulerConfig::default(), stats.clone());

    let scan_info = ScanInfo::new(vec![ScanTable {
        database: "LSST".to_string(),
        table: "Object".to_string(),
        lock_in_memory: true,
        rating: ScanRating::Fast,
    }]);
    let task = Task::new(
        42,
        7,
        10,
        "LSST",
        vec![Fragment {
            sql_queries: vec!["SELECT * FROM Object_10_3".to_string()],
            result_table: "dump_10".to_string(),
            sub_chunks: Some(qserv_core::task::SubChunkSelector {
                database: "LSST".to_string(),
                tables: vec!["Object".to_string()],
                ids: vec![3],
            }),
        }],
        "alice",
        scan_info,
        false,
    );

    scheduler.submit(task.clone(), false);
    assert_eq!(scheduler.total_queued(), 1);

    let dispatched = scheduler.next_task().unwrap();
    assert_eq!(dispatched.id(), task.id());
    assert_eq!(scheduler.total_running(), 1);

    let executor = Arc::new(MockSqlExecutor::new(1, b"row".to_vec()));
    let runner = TaskQueryRunner::new(executor, mlock, resources.clone());
    let channel = CollectingSendChannel::default();
    runner.run(&dispatched, &channel).await.unwrap();

    scheduler.command_finish(dispatched.id());
    stats.record_task_finish(42, 10, "Object", dispatched.duration().unwrap(), false);

    assert!(channel.terminated.load(std::sync::atomic::Ordering::SeqCst));
    assert_eq!(scheduler.total_running(), 0);
    assert_eq!(scheduler.total_queued(), 0);
    assert!(resources.is_empty(), "sub-chunk handle must release on drop");
    assert_eq!(stats.query_stats(42).unwrap().task_count, 1);
}

#[tokio::test]
async fn sql_broadcast_job_aggregates_per_worker_outcomes() {
    let messenger = Messenger::new(Arc::new(LoopbackTransport::echo()), Duration::from_secs(5));
    let control_db: Arc<dyn ControlDb> = Arc::new(MemoryControlDb::new(1));
    let workers = vec![WorkerId::from("w1"), WorkerId::from("w2")];
    let (tx, rx) = tokio::sync::oneshot::channel();
    let _job = job::spawn_sql_broadcast_job(messenger, control_db, workers.clone(), "FLUSH TABLES".to_string(), move |snapshot| {
        let _ = tx.send(snapshot);
    });
    let snapshot = tokio::time::timeout(Duration::from_secs(2), rx).await.unwrap().unwrap();
    assert!(matches!(snapshot.extended_state, job::JobExtendedState::Success));
    assert_eq!(snapshot.outcomes.len(), workers.len());
}

/// S6: a second process taking over the memory-table lock row must cause
/// the first process's next sub-chunk DDL to fail `requireOwnership`.
#[tokio::test]
async fn memory_lock_takeover_is_detected_s6() {
    let control_db: Arc<dyn ControlDb> = Arc::new(MemoryControlDb::new(1));
    let worker = WorkerId::from("worker1");
    let process_a = ChunkResourceManager::start(control_db.clone(), worker.clone()).await.unwrap();

    // A second worker process starts against the same data directory and
    // claims the lock row.
    let uid_b = 987_654_321u64;
    control_db.write_mem_lock(&worker, uid_b).await.unwrap();

    let key = qserv_core::chunk_resource::ChunkResourceKey::new("LSST", "Object", 10, 1);
    let result = process_a.acquire(vec![key]).await;
    assert!(matches!(result, Err(qserv_core::CoreError::MemoryLockViolation { .. })));
}
