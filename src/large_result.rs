//! `LargeResultMgr` — admission control for oversize result streams on the
//! czar (spec §4.10). The SSI transport keeps a semaphore-like counter of
//! how many "big" response streams may be active at once; this manager
//! mirrors that counter locally and calls the transport's "restart"
//! primitive to release queued work as capacity frees up. Grounded on the
//! donor codebase's single-mutex counter style used throughout
//! `resource_manager` for admission gates.

use parking_lot::Mutex;
use tracing::debug;

/// Abstracts the XRootD/SSI transport's restart primitive (spec §1
/// Non-goals: the transport itself is out of scope). `restart()` asks the
/// transport to release up to `want` queued large-result streams and
/// reports how many it actually released.
pub trait LargeResultTransport: Send + Sync {
    fn restart(&self, want: usize) -> usize;
    fn has_queued_work(&self) -> bool;
}

struct Inner {
    running_count: usize,
}

/// Bounds how many large result streams may be in flight at once so a
/// flood of big chunk results can't exhaust czar memory while small
/// queries stall (spec §4.10).
pub struct LargeResultMgr {
    running_count_max: usize,
    inner: Mutex<Inner>,
}

impl LargeResultMgr {
    pub fn new(running_count_max: usize) -> Self {
        Self { running_count_max, inner: Mutex::new(Inner { running_count: 0 }) }
    }

    pub fn running_count(&self) -> usize {
        self.inner.lock().running_count
    }

    /// One large result stream started transmitting.
    pub fn start_block(&self) {
        let mut inner = self.inner.lock();
        inner.running_count += 1;
        debug!(running_count = inner.running_count, "large result block started");
    }

    /// One large result stream finished; releases queued work on the
    /// transport up to the freed capacity.
    pub fn finish_block(&self, transport: &dyn LargeResultTransport) {
        {
            let mut inner = self.inner.lock();
            inner.running_count = inner.running_count.saturating_sub(1);
        }
        self.try_release(transport);
    }

    /// While under `running_count_max` and the transport reports queued
    /// work, ask it to release more responses; `running_count` is
    /// incremented by however many it actually released (spec §4.10).
    pub fn try_release(&self, transport: &dyn LargeResultTransport) {
        let mut inner = self.inner.lock();
        while inner.running_count < self.running_count_max && transport.has_queued_work() {
            let want = self.running_count_max - inner.running_count;
            let released = transport.restart(want);
            if released == 0 {
                break;
            }
            inner.running_count += released;
            debug!(released, running_count = inner.running_count, "released queued large result blocks");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeTransport {
        queued: AtomicUsize,
    }

    impl LargeResultTransport for FakeTransport {
        fn restart(&self, want: usize) -> usize {
            let queued = self.queued.load(Ordering::SeqCst);
            let released = want.min(queued);
            self.queued.fetch_sub(released, Ordering::SeqCst);
            released
        }

        fn has_queued_work(&self) -> bool {
            self.queued.load(Ordering::SeqCst) > 0
        }
    }

    #[test]
    fn releases_up_to_max_and_stops() {
        let transport = FakeTransport { queued: AtomicUsize::new(20) };
        let mgr = LargeResultMgr::new(4);
        mgr.try_release(&transport);
        assert_eq!(mgr.running_count(), 4);
        assert_eq!(transport.queued.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn finish_block_frees_capacity_for_more_releases() {
        let transport = FakeTransport { queued: AtomicUsize::new(10) };
        let mgr = LargeResultMgr::new(2);
        mgr.try_release(&transport);
        assert_eq!(mgr.running_count(), 2);
        mgr.finish_block(&transport);
        assert_eq!(mgr.running_count(), 2, "one finished, one released to replace it");
        assert_eq!(transport.queued.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn does_not_release_when_nothing_queued() {
        let transport = FakeTransport { queued: AtomicUsize::new(0) };
        let mgr = LargeResultMgr::new(4);
        mgr.try_release(&transport);
        assert_eq!(mgr.running_count(), 0);
    }

    #[test]
    fn start_block_increments_without_transport() {
        let mgr = LargeResultMgr::new(4);
        mgr.start_block();
        mgr.start_block();
        assert_eq!(mgr.running_count(), 2);
    }
}
