//! `PriorityExecutor` — a fixed-size pool of OS threads sharing a set of
//! FIFO sub-queues keyed by integer priority (smaller integer = higher
//! priority). Used by both the czar and the worker for all background work
//! (spec §4.1), grounded on the donor codebase's per-core/priority
//! scheduling style (`resource_manager::cpu_scheduler`) and on the original
//! implementation's `qdisp::QdispPool`/`PriorityQueue`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use tracing::{debug, warn};

/// A unit of work submitted to the executor. Boxed so heterogeneous
/// closures can share one queue.
pub type Command = Box<dyn FnOnce() + Send + 'static>;

struct SubQueue {
    priority: i32,
    min_running: usize,
    max_running: usize,
    running: AtomicUsize,
    fifo: Mutex<VecDeque<Command>>,
}

impl SubQueue {
    fn new(priority: i32, min_running: usize, max_running: usize) -> Self {
        Self { priority, min_running, max_running, running: AtomicUsize::new(0), fifo: Mutex::new(VecDeque::new()) }
    }

    fn len(&self) -> usize {
        self.fifo.lock().unwrap().len()
    }
}

struct Inner {
    /// Sub-queues ordered ascending by priority (index 0 = highest priority).
    queues: Vec<SubQueue>,
    default_index: usize,
    shutting_down: AtomicBool,
}

/// Snapshot of one sub-queue's occupancy, for diagnostics and tests.
#[derive(Debug, Clone, Copy)]
pub struct QueueStats {
    pub priority: i32,
    pub queued: usize,
    pub running: usize,
}

/// A fixed pool of threads dispatching from priority-keyed FIFO sub-queues.
pub struct PriorityExecutor {
    inner: Arc<Inner>,
    cv: Arc<Condvar>,
    mutex: Arc<Mutex<()>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl PriorityExecutor {
    /// `queues` is `(priority, min_running, max_running)` triples.
    /// `default_priority` must name one of `queues`' priorities; submissions
    /// to an unknown priority fall back to it with a warning.
    pub fn new(pool_size: usize, default_priority: i32, queues: &[(i32, usize, usize)]) -> Arc<Self> {
        let mut sub_queues: Vec<SubQueue> =
            queues.iter().map(|&(p, min, max)| SubQueue::new(p, min, max)).collect();
        sub_queues.sort_by_key(|q| q.priority);

        let default_index = sub_queues
            .iter()
            .position(|q| q.priority == default_priority)
            .unwrap_or_else(|| {
                sub_queues.push(SubQueue::new(default_priority, 0, pool_size.max(1)));
                sub_queues.len() - 1
            });

        let inner = Arc::new(Inner { queues: sub_queues, default_index, shutting_down: AtomicBool::new(false) });
        let cv = Arc::new(Condvar::new());
        let mutex = Arc::new(Mutex::new(()));

        let executor = Arc::new(Self { inner: inner.clone(), cv: cv.clone(), mutex: mutex.clone(), threads: Mutex::new(Vec::new()) });

        let mut handles = Vec::with_capacity(pool_size.max(1));
        for worker_index in 0..pool_size.max(1) {
            let inner = inner.clone();
            let cv = cv.clone();
            let mutex = mutex.clone();
            handles.push(std::thread::Builder::new()
                .name(format!("priority-executor-{worker_index}"))
                .spawn(move || Self::run_worker(inner, cv, mutex))
                .expect("failed to spawn priority executor thread"));
        }
        *executor.threads.lock().unwrap() = handles;
        executor
    }

    /// Enqueue `command` at priority `priority`. Unknown priorities fall
    /// back to the default sub-queue.
    pub fn submit(&self, command: Command, priority: i32) {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            warn!(priority, "submit() after shutdown ignored");
            return;
        }
        let index = self.inner.queues.iter().position(|q| q.priority == priority).unwrap_or_else(|| {
            warn!(priority, "unknown priority, using default sub-queue");
            self.inner.default_index
        });
        {
            let _guard = self.mutex.lock().unwrap();
            self.inner.queues[index].fifo.lock().unwrap().push_back(command);
        }
        self.cv.notify_all();
    }

    pub fn submit_default(&self, command: Command) {
        let priority = self.inner.queues[self.inner.default_index].priority;
        self.submit(command, priority);
    }

    /// Refuse further submissions and wait for all in-flight threads to
    /// finish draining the queues. Idempotent and safe to call concurrently.
    pub fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cv.notify_all();
        let handles = std::mem::take(&mut *self.threads.lock().unwrap());
        for h in handles {
            let _ = h.join();
        }
    }

    pub fn stats(&self) -> Vec<QueueStats> {
        self.inner
            .queues
            .iter()
            .map(|q| QueueStats { priority: q.priority, queued: q.len(), running: q.running.load(Ordering::SeqCst) })
            .collect()
    }

    fn run_worker(inner: Arc<Inner>, cv: Arc<Condvar>, mutex: Arc<Mutex<()>>) {
        loop {
            let popped = {
                let mut guard = mutex.lock().unwrap();
                loop {
                    if let Some(found) = Self::try_pop(&inner) {
                        break Some(found);
                    }
                    if inner.shutting_down.load(Ordering::SeqCst) && Self::all_empty(&inner) {
                        break None;
                    }
                    guard = cv.wait(guard).unwrap();
                    let _ = &guard;
                }
            };

            let Some((index, command)) = popped else { return };
            command();
            inner.queues[index].running.fetch_sub(1, Ordering::SeqCst);
            cv.notify_all();
        }
    }

    /// First pass: satisfy every sub-queue's `minRunning` before anything
    /// else starts a second command (prevents high-priority floods from
    /// starving lower priorities). Second pass: fill remaining capacity up
    /// to `maxRunning`, highest priority first.
    fn try_pop(inner: &Inner) -> Option<(usize, Command)> {
        for (index, queue) in inner.queues.iter().enumerate() {
            if queue.running.load(Ordering::SeqCst) < queue.min_running {
                if let Some(cmd) = queue.fifo.lock().unwrap().pop_front() {
                    queue.running.fetch_add(1, Ordering::SeqCst);
                    return Some((index, cmd));
                }
            }
        }
        for (index, queue) in inner.queues.iter().enumerate() {
            if queue.running.load(Ordering::SeqCst) < queue.max_running {
                if let Some(cmd) = queue.fifo.lock().unwrap().pop_front() {
                    queue.running.fetch_add(1, Ordering::SeqCst);
                    return Some((index, cmd));
                }
            }
        }
        None
    }

    fn all_empty(inner: &Inner) -> bool {
        inner.queues.iter().all(|q| q.len() == 0 && q.running.load(Ordering::SeqCst) == 0)
    }
}

impl Drop for PriorityExecutor {
    fn drop(&mut self) {
        debug!("dropping PriorityExecutor");
        self.shutdown();
    }
}
