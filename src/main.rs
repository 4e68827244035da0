// Demonstration binary: wires the czar and worker sides of the core
// together against in-memory/loopback collaborators and runs one query
// through dispatch, scheduling, execution, and merge.
//
// Configuration-file loading, a real MySQL client, and the XRootD/SSI
// transport are out of scope (spec §1); this binary substitutes the
// in-memory `ControlDb`, `LoopbackTransport`, `MockSqlExecutor`, and
// `RecordingMergeExecutor` this crate ships for tests.

use qserv_core::chunk_resource::ChunkResourceManager;
use qserv_core::config::CoreConfig;
use qserv_core::control_db::{ControlDb, MemoryControlDb, WorkerConfig};
use qserv_core::ids::WorkerId;
use qserv_core::job;
use qserv_core::merger::{FinalizeSpec, RecordingMergeExecutor, ResultMerger};
use qserv_core::messenger::{LoopbackTransport, Messenger};
use qserv_core::scheduler::BlendScheduler;
use qserv_core::stats::QueryStatistics;
use qserv_core::task::{CollectingSendChannel, Fragment, MockSqlExecutor, ScanInfo, ScanRating, ScanTable, Task, TaskQueryRunner};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> qserv_core::Result<()> {
    tracing_subscriber::fmt().with_target(false).with_level(true).init();

    println!("qserv-core demo: czar dispatch + worker scheduling + replica control plane");

    let config = CoreConfig::default().from_env_overrides();
    let workers = vec![WorkerId::from("worker1"), WorkerId::from("worker2")];

    let memory_db = MemoryControlDb::new(1);
    for worker in &workers {
        memory_db.register_worker(WorkerConfig {
            name: worker.clone(),
            is_enabled: true,
            is_read_only: false,
            svc_host: "localhost".to_string(),
            svc_port: 25000,
            data_dir: "/data/qserv".to_string(),
        });
    }
    let control_db: Arc<dyn ControlDb> = Arc::new(memory_db);
    control_db.check_schema_version(1).await?;

    tracing::info!("replica control plane: sweeping cluster health");
    let messenger = Messenger::new(Arc::new(LoopbackTransport::echo()), Duration::from_secs(5));
    let (tx, rx) = tokio::sync::oneshot::channel();
    let _job = job::spawn_cluster_health_job(messenger.clone(), control_db.clone(), workers.clone(), move |health| {
        let _ = tx.send(health);
    });
    let health = rx.await.unwrap();
    tracing::info!(good = health.good(), "cluster health sweep complete");

    tracing::info!("worker side: admitting a Task through the BlendScheduler");
    let stats = Arc::new(QueryStatistics::new());
    let scheduler = BlendScheduler::new(config.scheduler.clone(), stats);
    let scan_info = ScanInfo::new(vec![ScanTable {
        database: "LSST".to_string(),
        table: "Object".to_string(),
        lock_in_memory: false,
        rating: ScanRating::Medium,
    }]);
    let task = Task::new(
        1,
        1,
        10,
        "LSST",
        vec![Fragment { sql_queries: vec!["SELECT objectId, flux FROM Object_10".to_string()], result_table: "dump_10".to_string(), sub_chunks: None }],
        "demo_user",
        scan_info,
        false,
    );
    scheduler.submit(task.clone(), false);
    let dispatched = scheduler.next_task().expect("scheduler must hand back the only queued task");

    let resources = ChunkResourceManager::start(control_db.clone(), workers[0].clone()).await?;
    let mlock = qserv_core::chunk_resource::MlockSerializer::start();
    let executor = Arc::new(MockSqlExecutor::new(1, b"objectId,flux\n12345,3.2\n".to_vec()));
    let runner = TaskQueryRunner::new(executor, mlock, resources);
    let channel = CollectingSendChannel::default();
    runner.run(&dispatched, &channel).await?;
    scheduler.command_finish(dispatched.id());
    tracing::info!(buckets = channel.buckets.lock().len(), "task execution streamed rows back");

    tracing::info!("czar side: merging the chunk's dump into the result table");
    let merge_executor = Arc::new(RecordingMergeExecutor::default());
    let merger = ResultMerger::new("qservResult", "demo1", config.merger.result_limit_bytes, merge_executor);
    merger.merge("dump_10", 2048).await?;
    let final_table = merger.finalize(&FinalizeSpec::default()).await?;
    tracing::info!(final_table = %final_table, total_size = merger.total_size(), "query complete");

    Ok(())
}
