//! `RequestStateMachine` — the lifecycle shared by every long-running
//! remote operation (spec §4.3): `CREATED -> IN_PROGRESS -> FINISHED`, with
//! an adaptive-backoff status-probe timer for servers that reply "still
//! working" and an expiration timer. Grounded in the donor codebase's
//! `error.rs` error-taxonomy style for the outcome enum and in
//! `networking::pool::channel`'s oneshot-per-request pattern for the
//! single-notify callback.

use crate::control_db::{ControlDb, RequestTransition};
use crate::config::TrackingConfig;
use crate::ids::{JobId, RequestId, WorkerId};
use crate::wire::RequestKind;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Created,
    InProgress,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtendedState {
    None,
    Success,
    ClientError,
    ServerBad,
    ServerError,
    ServerQueued,
    ServerInProgress,
    ServerIsCancelling,
    ServerCancelled,
    Expired,
    Cancelled,
    TimeoutExpired,
}

impl ExtendedState {
    fn as_str(self) -> &'static str {
        match self {
            ExtendedState::None => "NONE",
            ExtendedState::Success => "SUCCESS",
            ExtendedState::ClientError => "CLIENT_ERROR",
            ExtendedState::ServerBad => "SERVER_BAD",
            ExtendedState::ServerError => "SERVER_ERROR",
            ExtendedState::ServerQueued => "SERVER_QUEUED",
            ExtendedState::ServerInProgress => "SERVER_IN_PROGRESS",
            ExtendedState::ServerIsCancelling => "SERVER_IS_CANCELLING",
            ExtendedState::ServerCancelled => "SERVER_CANCELLED",
            ExtendedState::Expired => "EXPIRED",
            ExtendedState::Cancelled => "CANCELLED",
            ExtendedState::TimeoutExpired => "TIMEOUT_EXPIRED",
        }
    }
}

/// What a transport round-trip resolved to, as reported by the owning
/// [`RequestBehavior`]. `ServerQueued`/`ServerInProgress`/`ServerIsCancelling`
/// are non-terminal when `keepTracking` is set: they arm the retry timer
/// instead of finishing the request.
#[derive(Debug, Clone)]
pub enum ReplyOutcome {
    Success,
    ServerBad,
    ServerError(String),
    ServerQueued,
    ServerInProgress,
    ServerIsCancelling,
    ServerCancelled,
    ClientError(String),
}

/// Per-request timestamps, mirroring the `performance` struct in spec §3.
#[derive(Debug, Clone, Copy, Default)]
pub struct Performance {
    pub enqueue: Option<Instant>,
    pub start_transmit: Option<Instant>,
    pub finish_transmit: Option<Instant>,
    pub update_at: Option<Instant>,
}

/// Snapshot handed to the user callback exactly once, after the request
/// reaches `FINISHED` and its transition has been persisted.
#[derive(Debug, Clone)]
pub struct FinishedRequest {
    pub id: RequestId,
    pub worker: WorkerId,
    pub kind: RequestKind,
    pub extended_state: ExtendedState,
    pub performance: Performance,
    pub parent_job_id: Option<JobId>,
}

/// The subclass-specific behavior a concrete Request type supplies: how to
/// perform the initial send and, for `keepTracking` requests, how to probe
/// for status. Corresponds to `startImpl` in spec §4.3.
#[async_trait]
pub trait RequestBehavior: Send + Sync {
    async fn send_initial(&self) -> ReplyOutcome;
    async fn send_probe(&self) -> ReplyOutcome {
        // Default: behaviors that never set keep_tracking need not implement this.
        ReplyOutcome::ClientError("send_probe not implemented".to_string())
    }
}

struct Inner {
    state: RequestState,
    extended_state: ExtendedState,
    performance: Performance,
    cancelled: bool,
    callback: Option<Box<dyn FnOnce(FinishedRequest) + Send>>,
    expiration_task: Option<JoinHandle<()>>,
    retry_task: Option<JoinHandle<()>>,
    /// Self-reference held while a send is outstanding (spec §9 "cyclic
    /// ownership"); dropped on finish to break the cycle.
    keep_alive: Option<Arc<Request>>,
    next_backoff: Duration,
}

/// A single outstanding remote operation. Construct with [`Request::new`],
/// then call [`Request::start`] exactly once.
pub struct Request {
    pub id: RequestId,
    pub kind: RequestKind,
    pub worker: WorkerId,
    pub priority: i32,
    pub keep_tracking: bool,
    pub parent_job_id: Option<JobId>,
    behavior: Arc<dyn RequestBehavior>,
    control_db: Arc<dyn ControlDb>,
    tracking: TrackingConfig,
    inner: Mutex<Inner>,
}

impl Request {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kind: RequestKind,
        worker: WorkerId,
        priority: i32,
        keep_tracking: bool,
        parent_job_id: Option<JobId>,
        behavior: Arc<dyn RequestBehavior>,
        control_db: Arc<dyn ControlDb>,
        tracking: TrackingConfig,
    ) -> Arc<Self> {
        let initial_backoff = tracking.initial_backoff;
        Arc::new(Self {
            id: RequestId::new(),
            kind,
            worker,
            priority,
            keep_tracking,
            parent_job_id,
            behavior,
            control_db,
            tracking,
            inner: Mutex::new(Inner {
                state: RequestState::Created,
                extended_state: ExtendedState::None,
                performance: Performance::default(),
                cancelled: false,
                callback: None,
                expiration_task: None,
                retry_task: None,
                keep_alive: None,
                next_backoff: initial_backoff,
            }),
        })
    }

    pub fn state(&self) -> RequestState {
        self.inner.lock().state
    }

    pub fn extended_state(&self) -> ExtendedState {
        self.inner.lock().extended_state
    }

    pub fn performance(&self) -> Performance {
        self.inner.lock().performance
    }

    /// `CREATED -> IN_PROGRESS`. Arms the expiration timer if
    /// `expiration` is `Some`, registers `on_finish` to fire exactly once,
    /// then dispatches the initial send on a background task.
    pub fn start(
        self: &Arc<Self>,
        expiration: Option<Duration>,
        on_finish: impl FnOnce(FinishedRequest) + Send + 'static,
    ) -> Result<(), crate::error::CoreError> {
        {
            let mut inner = self.inner.lock();
            if inner.state != RequestState::Created {
                return Err(crate::error::CoreError::InvalidState(format!(
                    "start() called on request {} in state {:?}",
                    self.id, inner.state
                )));
            }
            inner.state = RequestState::InProgress;
            inner.performance.enqueue = Some(Instant::now());
            inner.callback = Some(Box::new(on_finish));
            inner.keep_alive = Some(self.clone());

            if let Some(deadline) = expiration {
                let this = self.clone();
                inner.expiration_task = Some(tokio::spawn(async move {
                    tokio::time::sleep(deadline).await;
                    this.expire();
                }));
            }
        }

        let this = self.clone();
        tokio::spawn(async move {
            let outcome = this.behavior.send_initial().await;
            this.handle_reply(outcome);
        });
        Ok(())
    }

    fn expire(self: &Arc<Self>) {
        let mut inner = self.inner.lock();
        if inner.state == RequestState::Finished {
            return;
        }
        inner.state = RequestState::Finished;
        inner.extended_state = ExtendedState::Expired;
        self.finish_locked(inner);
    }

    /// Idempotent: a second `cancel()` on an already-finished request is a
    /// no-op, matching the round-trip law `cancel(); cancel();` ==
    /// `cancel();`.
    pub fn cancel(self: &Arc<Self>) {
        let mut inner = self.inner.lock();
        if inner.state == RequestState::Finished {
            return;
        }
        inner.cancelled = true;
        inner.extended_state = ExtendedState::Cancelled;
        inner.state = RequestState::Finished;
        self.finish_locked(inner);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.lock().cancelled
    }

    fn handle_reply(self: &Arc<Self>, outcome: ReplyOutcome) {
        if self.is_cancelled() {
            return;
        }
        match outcome {
            ReplyOutcome::Success => self.finish_with(ExtendedState::Success),
            ReplyOutcome::ServerBad => self.finish_with(ExtendedState::ServerBad),
            ReplyOutcome::ServerError(msg) => {
                warn!(request = %self.id, worker = %self.worker, %msg, "server error");
                self.finish_with(ExtendedState::ServerError);
            }
            ReplyOutcome::ServerCancelled => self.finish_with(ExtendedState::ServerCancelled),
            ReplyOutcome::ClientError(msg) => {
                warn!(request = %self.id, %msg, "client error");
                self.finish_with(ExtendedState::ClientError);
            }
            ReplyOutcome::ServerQueued | ReplyOutcome::ServerInProgress | ReplyOutcome::ServerIsCancelling => {
                if self.keep_tracking {
                    self.arm_retry();
                } else {
                    let state = match outcome {
                        ReplyOutcome::ServerQueued => ExtendedState::ServerQueued,
                        ReplyOutcome::ServerInProgress => ExtendedState::ServerInProgress,
                        _ => ExtendedState::ServerIsCancelling,
                    };
                    self.finish_with(state);
                }
            }
        }
    }

    fn arm_retry(self: &Arc<Self>) {
        let backoff = {
            let mut inner = self.inner.lock();
            if inner.state == RequestState::Finished {
                return;
            }
            let current = inner.next_backoff;
            inner.next_backoff = (current * 2).min(self.tracking.max_backoff);
            current
        };
        let this = self.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(backoff).await;
            if this.is_cancelled() || this.state() == RequestState::Finished {
                return;
            }
            let outcome = this.behavior.send_probe().await;
            this.handle_reply(outcome);
        });
        self.inner.lock().retry_task = Some(task);
    }

    fn finish_with(self: &Arc<Self>, extended: ExtendedState) {
        let mut inner = self.inner.lock();
        if inner.state == RequestState::Finished {
            return;
        }
        inner.state = RequestState::Finished;
        inner.extended_state = extended;
        self.finish_locked(inner);
    }

    /// Shared tail of every path to FINISHED: cancel timers, snapshot the
    /// callback and keep-alive, release the lock, persist, then notify.
    /// `inner` is consumed (dropped) before the callback runs so the
    /// callback never observes this request's own mutex held.
    fn finish_locked(self: &Arc<Self>, mut inner: parking_lot::MutexGuard<'_, Inner>) {
        inner.performance.finish_transmit = Some(Instant::now());
        if let Some(task) = inner.expiration_task.take() {
            task.abort();
        }
        if let Some(task) = inner.retry_task.take() {
            task.abort();
        }
        let callback = inner.callback.take();
        inner.keep_alive = None;
        let snapshot = FinishedRequest {
            id: self.id.clone(),
            worker: self.worker.clone(),
            kind: self.kind,
            extended_state: inner.extended_state,
            performance: inner.performance,
            parent_job_id: self.parent_job_id,
        };
        drop(inner);

        let this = self.clone();
        tokio::spawn(async move {
            let transition = RequestTransition {
                request_id: this.id.clone(),
                worker: this.worker.clone(),
                state: "FINISHED".to_string(),
                extended_state: snapshot.extended_state.as_str().to_string(),
            };
            if let Err(e) = this.control_db.persist_request_transition(transition).await {
                error!(request = %this.id, error = %e, "failed to persist request transition");
            }
            if let Some(cb) = callback {
                cb(snapshot);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_db::MemoryControlDb;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    struct AlwaysSucceeds;
    #[async_trait]
    impl RequestBehavior for AlwaysSucceeds {
        async fn send_initial(&self) -> ReplyOutcome {
            ReplyOutcome::Success
        }
    }

    struct NeverReplies;
    #[async_trait]
    impl RequestBehavior for NeverReplies {
        async fn send_initial(&self) -> ReplyOutcome {
            std::future::pending::<()>().await;
            unreachable!()
        }
    }

    #[tokio::test]
    async fn single_notify_on_success() {
        let control_db = Arc::new(MemoryControlDb::new(1));
        let request = Request::new(
            RequestKind::Echo,
            WorkerId::from("w1"),
            0,
            false,
            None,
            Arc::new(AlwaysSucceeds),
            control_db,
            TrackingConfig::default(),
        );
        let (tx, rx) = oneshot::channel();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        request
            .start(None, move |finished| {
                count2.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send(finished);
            })
            .unwrap();
        let finished = rx.await.unwrap();
        assert_eq!(finished.extended_state as u8, ExtendedState::Success as u8);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expiration_fires_once() {
        let control_db = Arc::new(MemoryControlDb::new(1));
        let request = Request::new(
            RequestKind::Echo,
            WorkerId::from("w1"),
            0,
            false,
            None,
            Arc::new(NeverReplies),
            control_db,
            TrackingConfig::default(),
        );
        let (tx, rx) = oneshot::channel();
        request.start(Some(Duration::from_millis(30)), move |finished| {
            let _ = tx.send(finished);
        }).unwrap();
        let finished = tokio::time::timeout(Duration::from_secs(2), rx).await.unwrap().unwrap();
        matches!(finished.extended_state, ExtendedState::Expired);
    }

    #[tokio::test]
    async fn double_cancel_is_idempotent() {
        let control_db = Arc::new(MemoryControlDb::new(1));
        let request = Request::new(
            RequestKind::Echo,
            WorkerId::from("w1"),
            0,
            false,
            None,
            Arc::new(NeverReplies),
            control_db,
            TrackingConfig::default(),
        );
        request.start(None, |_| {}).unwrap();
        request.cancel();
        request.cancel();
        assert_eq!(request.state(), RequestState::Finished);
        matches!(request.extended_state(), ExtendedState::Cancelled);
    }

    #[tokio::test]
    async fn starting_twice_is_an_error() {
        let control_db = Arc::new(MemoryControlDb::new(1));
        let request = Request::new(
            RequestKind::Echo,
            WorkerId::from("w1"),
            0,
            false,
            None,
            Arc::new(AlwaysSucceeds),
            control_db,
            TrackingConfig::default(),
        );
        request.start(None, |_| {}).unwrap();
        let err = request.start(None, |_| {});
        assert!(err.is_err());
    }
}
