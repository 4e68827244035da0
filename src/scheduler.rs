//! `BlendScheduler` — the worker-side blended priority / shared-scan task
//! scheduler (spec §4.5), the hardest component in the system. Composes an
//! interactive queue, one `ScanScheduler` per scan rating, and a snail
//! queue behind a uniform `SubScheduler` interface (spec §9 "Scheduler
//! polymorphism": a tagged/trait-object variant, not inheritance), and
//! dispatches with the same two-pass min/max-running algorithm
//! [`crate::executor::PriorityExecutor`] uses on the czar side. Grounded on
//! the donor codebase's `resource_manager::cpu_scheduler` priority-queue
//! dispatch for the two-pass algorithm, adapted here to the five-tier
//! interactive/scan/snail hierarchy, and on the original implementation's
//! `wsched::BlendScheduler`/`ScanScheduler`/`GroupScheduler` for the
//! shared-scan chunk-ordering discipline.

use crate::config::SchedulerConfig;
use crate::ids::{ChunkId, QueryId, TaskId};
use crate::stats::QueryStatistics;
use crate::task::{ScanRating, Task};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Uniform interface every sub-scheduler exposes to the `BlendScheduler`
/// (spec §9): `queue` admits a Task, `get_cmd` hands the next one out,
/// `command_start`/`command_finish` track the running count, `remove`
/// supports cancellation and boot-driven relocation.
trait SubScheduler: Send + Sync {
    fn name(&self) -> &'static str;
    fn queue(&self, task: Arc<Task>);
    fn get_cmd(&self) -> Option<Arc<Task>>;
    fn remove(&self, task_id: TaskId) -> Option<Arc<Task>>;
    fn len(&self) -> usize;
    fn running(&self) -> usize;
    fn min_running(&self) -> usize;
    fn max_running(&self) -> usize;
    /// Directly account one more running slot without popping from this
    /// sub-scheduler's own queue (used when the boot inspector re-homes an
    /// already-running Task's accounting onto `snail`).
    fn command_start(&self);
    fn command_finish(&self);
}

/// FIFO sub-scheduler used for `interactive` and `snail`.
struct FifoScheduler {
    name: &'static str,
    min_running: usize,
    max_running: usize,
    running: AtomicUsize,
    fifo: Mutex<VecDeque<Arc<Task>>>,
}

impl FifoScheduler {
    fn new(name: &'static str, min_running: usize, max_running: usize) -> Self {
        Self { name, min_running, max_running, running: AtomicUsize::new(0), fifo: Mutex::new(VecDeque::new()) }
    }
}

impl SubScheduler for FifoScheduler {
    fn name(&self) -> &'static str {
        self.name
    }

    fn queue(&self, task: Arc<Task>) {
        self.fifo.lock().push_back(task);
    }

    fn get_cmd(&self) -> Option<Arc<Task>> {
        let task = self.fifo.lock().pop_front()?;
        self.running.fetch_add(1, Ordering::SeqCst);
        Some(task)
    }

    fn remove(&self, task_id: TaskId) -> Option<Arc<Task>> {
        let mut fifo = self.fifo.lock();
        let index = fifo.iter().position(|t| t.id() == task_id)?;
        fifo.remove(index)
    }

    fn len(&self) -> usize {
        self.fifo.lock().len()
    }

    fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    fn min_running(&self) -> usize {
        self.min_running
    }

    fn max_running(&self) -> usize {
        self.max_running
    }

    fn command_start(&self) {
        self.running.fetch_add(1, Ordering::SeqCst);
    }

    fn command_finish(&self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
    }
}

/// One table's Tasks, grouped by chunk id so concurrent queries over the
/// same table share I/O order (spec §4.5 "shared-scan ordering").
#[derive(Default)]
struct TableBucket {
    by_chunk: BTreeMap<ChunkId, VecDeque<Arc<Task>>>,
    cursor: Option<ChunkId>,
}

impl TableBucket {
    fn push(&mut self, task: Arc<Task>) {
        self.by_chunk.entry(task.chunk_id).or_default().push_back(task);
    }

    fn is_empty(&self) -> bool {
        self.by_chunk.is_empty()
    }

    fn len(&self) -> usize {
        self.by_chunk.values().map(|q| q.len()).sum()
    }

    fn remove(&mut self, task_id: TaskId) -> Option<Arc<Task>> {
        for queue in self.by_chunk.values_mut() {
            if let Some(index) = queue.iter().position(|t| t.id() == task_id) {
                return queue.remove(index);
            }
        }
        None
    }

    /// Drains the bucket's current chunk id before advancing the cursor to
    /// the next occupied chunk id in ascending order, wrapping at the top.
    fn pop_next(&mut self) -> Option<Arc<Task>> {
        if let Some(cur) = self.cursor {
            if let Some(queue) = self.by_chunk.get_mut(&cur) {
                if let Some(task) = queue.pop_front() {
                    if queue.is_empty() {
                        self.by_chunk.remove(&cur);
                    }
                    return Some(task);
                }
            }
        }
        let next_key = self
            .by_chunk
            .keys()
            .find(|&&k| self.cursor.map_or(true, |c| k > c))
            .or_else(|| self.by_chunk.keys().next())
            .copied()?;
        self.cursor = Some(next_key);
        let queue = self.by_chunk.get_mut(&next_key)?;
        let task = queue.pop_front();
        if queue.is_empty() {
            self.by_chunk.remove(&next_key);
        }
        task
    }
}

/// Shared-scan scheduler for one [`ScanRating`]: tasks are bucketed by
/// their slowest scanned table, and buckets are served round-robin.
struct ScanScheduler {
    rating: ScanRating,
    min_running: usize,
    max_running: usize,
    running: AtomicUsize,
    buckets: Mutex<HashMap<String, TableBucket>>,
    rotation: Mutex<VecDeque<String>>,
}

impl ScanScheduler {
    fn new(rating: ScanRating, min_running: usize, max_running: usize) -> Self {
        Self {
            rating,
            min_running,
            max_running,
            running: AtomicUsize::new(0),
            buckets: Mutex::new(HashMap::new()),
            rotation: Mutex::new(VecDeque::new()),
        }
    }

    fn table_key(task: &Task) -> String {
        task.scan_info
            .tables
            .first()
            .map(|t| format!("{}.{}", t.database, t.table))
            .unwrap_or_else(|| "<none>".to_string())
    }
}

impl SubScheduler for ScanScheduler {
    fn name(&self) -> &'static str {
        match self.rating {
            ScanRating::Fastest => "scan:fastest",
            ScanRating::Fast => "scan:fast",
            ScanRating::Medium => "scan:medium",
            ScanRating::Slow => "scan:slow",
            ScanRating::Slowest => "scan:slowest",
        }
    }

    fn queue(&self, task: Arc<Task>) {
        let key = Self::table_key(&task);
        let mut buckets = self.buckets.lock();
        let is_new = !buckets.contains_key(&key);
        buckets.entry(key.clone()).or_default().push(task);
        drop(buckets);
        if is_new {
            self.rotation.lock().push_back(key);
        }
    }

    fn get_cmd(&self) -> Option<Arc<Task>> {
        let mut rotation = self.rotation.lock();
        let rounds = rotation.len();
        for _ in 0..rounds {
            let key = rotation.pop_front()?;
            let mut buckets = self.buckets.lock();
            let Some(bucket) = buckets.get_mut(&key) else { continue };
            let popped = bucket.pop_next();
            let exhausted = bucket.is_empty();
            if exhausted {
                buckets.remove(&key);
            }
            drop(buckets);
            if let Some(task) = popped {
                if !exhausted {
                    rotation.push_back(key);
                }
                self.running.fetch_add(1, Ordering::SeqCst);
                return Some(task);
            }
            // bucket existed but yielded nothing; drop it and keep scanning
        }
        None
    }

    fn remove(&self, task_id: TaskId) -> Option<Arc<Task>> {
        let mut buckets = self.buckets.lock();
        for (key, bucket) in buckets.iter_mut() {
            if let Some(task) = bucket.remove(task_id) {
                if bucket.is_empty() {
                    let key = key.clone();
                    drop(buckets);
                    self.rotation.lock().retain(|k| k != &key);
                    self.buckets.lock().remove(&key);
                }
                return Some(task);
            }
        }
        None
    }

    fn len(&self) -> usize {
        self.buckets.lock().values().map(|b| b.len()).sum()
    }

    fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    fn min_running(&self) -> usize {
        self.min_running
    }

    fn max_running(&self) -> usize {
        self.max_running
    }

    fn command_start(&self) {
        self.running.fetch_add(1, Ordering::SeqCst);
    }

    fn command_finish(&self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
    }
}

const INTERACTIVE: usize = 0;
const SCAN_FASTEST: usize = 1;
const SCAN_FAST: usize = 2;
const SCAN_MEDIUM: usize = 3;
const SCAN_SLOW: usize = 4;
const SNAIL: usize = 5;

/// Bookkeeping the `BlendScheduler` keeps per task so `taskCancelled` and
/// the boot inspector can find it again without scanning every sub-queue.
#[derive(Debug, Clone, Copy)]
struct TaskLocation {
    sub_index: usize,
    query_id: QueryId,
    dispatched: bool,
}

/// The worker's blended scheduler: interactive, one `ScanScheduler` per
/// rating in `{FASTEST, FAST, MEDIUM, SLOW}`, and snail (spec §4.5).
/// `SLOWEST`-rated and oversize Tasks are admitted directly to snail.
pub struct BlendScheduler {
    subs: Vec<Box<dyn SubScheduler>>,
    locations: Mutex<HashMap<TaskId, TaskLocation>>,
    stats: Arc<QueryStatistics>,
    config: SchedulerConfig,
}

impl BlendScheduler {
    pub fn new(config: SchedulerConfig, stats: Arc<QueryStatistics>) -> Arc<Self> {
        let subs: Vec<Box<dyn SubScheduler>> = vec![
            Box::new(FifoScheduler::new("interactive", config.interactive_min_running, config.interactive_max_running)),
            Box::new(ScanScheduler::new(ScanRating::Fastest, 1, config.scan_max_running)),
            Box::new(ScanScheduler::new(ScanRating::Fast, 1, config.scan_max_running)),
            Box::new(ScanScheduler::new(ScanRating::Medium, 1, config.scan_max_running)),
            Box::new(ScanScheduler::new(ScanRating::Slow, 1, config.scan_max_running)),
            Box::new(FifoScheduler::new("snail", 0, config.snail_max_running)),
        ];
        Arc::new(Self { subs, locations: Mutex::new(HashMap::new()), stats, config })
    }

    fn rating_index(rating: ScanRating) -> usize {
        match rating {
            ScanRating::Fastest => SCAN_FASTEST,
            ScanRating::Fast => SCAN_FAST,
            ScanRating::Medium => SCAN_MEDIUM,
            ScanRating::Slow | ScanRating::Slowest => SCAN_SLOW,
        }
    }

    /// Admit a Task (spec §4.5 "Admission"). `oversize` routes straight to
    /// `snail` regardless of scan rating.
    pub fn submit(self: &Arc<Self>, task: Arc<Task>, oversize: bool) {
        let query_id = task.query_id;
        let sub_index = if oversize {
            SNAIL
        } else if task.interactive {
            INTERACTIVE
        } else {
            match task.scan_info.slowest_rating() {
                Some(ScanRating::Slowest) => SNAIL,
                Some(rating) => Self::rating_index(rating),
                None => SNAIL,
            }
        };
        self.locations.lock().insert(task.id(), TaskLocation { sub_index, query_id, dispatched: false });
        task.mark_queued();
        self.subs[sub_index].queue(task);
    }

    /// One dispatch tick, called once per idle executor thread (spec §4.5
    /// "Dispatch"): first pass guarantees every sub-scheduler's
    /// `minRunning`, highest priority first; second pass fills remaining
    /// capacity up to `maxRunning`. Mirrors
    /// [`crate::executor::PriorityExecutor`]'s two-pass algorithm.
    pub fn next_task(self: &Arc<Self>) -> Option<Arc<Task>> {
        for sub in &self.subs {
            if sub.running() < sub.min_running() && sub.len() > 0 {
                if let Some(task) = sub.get_cmd() {
                    self.mark_dispatched(&task);
                    return Some(task);
                }
            }
        }
        for sub in &self.subs {
            if sub.running() < sub.max_running() && sub.len() > 0 {
                if let Some(task) = sub.get_cmd() {
                    self.mark_dispatched(&task);
                    return Some(task);
                }
            }
        }
        None
    }

    fn mark_dispatched(&self, task: &Arc<Task>) {
        task.mark_running();
        if let Some(loc) = self.locations.lock().get_mut(&task.id()) {
            loc.dispatched = true;
        }
    }

    /// Release the running slot a dispatched Task held. Must be called
    /// exactly once per Task returned by [`Self::next_task`].
    pub fn command_finish(&self, task_id: TaskId) {
        if let Some(loc) = self.locations.lock().remove(&task_id) {
            self.subs[loc.sub_index].command_finish();
        }
    }

    /// `taskCancelled` (spec §4.5): remove the Task from whichever queue
    /// holds it. If it has already been dispatched, only the cancelled
    /// flag is meaningful; the caller (`TaskQueryRunner`) is responsible
    /// for asking the SQL executor to kill the running statement.
    pub fn task_cancelled(&self, task: &Arc<Task>) {
        task.cancel();
        let loc = self.locations.lock().get(&task.id()).copied();
        if let Some(loc) = loc {
            if !loc.dispatched {
                self.subs[loc.sub_index].remove(task.id());
                self.locations.lock().remove(&task.id());
            }
        }
    }

    fn runtime_limit(&self, rating: ScanRating) -> Duration {
        match rating {
            ScanRating::Fastest => self.config.runtime_limit_fastest,
            ScanRating::Fast => self.config.runtime_limit_fast,
            ScanRating::Medium => self.config.runtime_limit_medium,
            ScanRating::Slow => self.config.runtime_limit_slow,
            ScanRating::Slowest => self.config.runtime_limit_slowest,
        }
    }

    /// Boot inspection sweep (spec §4.5 "Booting"), intended to be driven
    /// periodically by a dedicated inspector thread/task at
    /// `config.boot_inspection_period`. Examines every *dispatched*
    /// (running) Task; any that has overrun its rating's runtime limit and
    /// whose query has room left under `maxBootsPerQuery` is re-accounted
    /// under `snail` without interrupting its execution.
    pub fn inspect_boots(&self, running_tasks: &[Arc<Task>]) {
        for task in running_tasks {
            let Some(rating) = task.scan_info.slowest_rating() else { continue };
            if rating == ScanRating::Slowest {
                continue;
            }
            let Some(duration) = task.duration() else { continue };
            if duration <= self.runtime_limit(rating) {
                continue;
            }
            let task_id = task.id();
            let mut locations = self.locations.lock();
            let Some(loc) = locations.get_mut(&task_id) else { continue };
            if loc.sub_index == SNAIL || !loc.dispatched {
                continue;
            }
            let boots_so_far = self.stats.boots_for(loc.query_id);
            if boots_so_far >= self.config.max_boots_per_query {
                continue;
            }
            let old_index = loc.sub_index;
            loc.sub_index = SNAIL;
            let query_id = loc.query_id;
            drop(locations);

            self.subs[old_index].command_finish();
            self.subs[SNAIL].command_start();
            task.boot();
            let boots_now = self.stats.record_boot(query_id);
            info!(task = %task_id, boots = boots_now, "booted task to snail");

            if boots_now > self.config.max_boots_per_query {
                self.move_remaining_queued_to_snail(query_id);
            }
        }
    }

    /// Relocates every still-queued (not yet dispatched) Task belonging to
    /// `query_id` onto `snail`. Runs when a query has accumulated more
    /// bootings than `maxBootsPerQuery` (spec §4.5).
    fn move_remaining_queued_to_snail(&self, query_id: QueryId) {
        let to_move: Vec<TaskId> = self
            .locations
            .lock()
            .iter()
            .filter(|(_, loc)| loc.query_id == query_id && !loc.dispatched && loc.sub_index != SNAIL)
            .map(|(id, _)| *id)
            .collect();
        for task_id in to_move {
            let sub_index = self.locations.lock().get(&task_id).map(|l| l.sub_index);
            let Some(sub_index) = sub_index else { continue };
            if let Some(task) = self.subs[sub_index].remove(task_id) {
                debug!(task = %task_id, "relocating remaining queued task to snail");
                self.locations.lock().insert(task_id, TaskLocation { sub_index: SNAIL, query_id, dispatched: false });
                self.subs[SNAIL].queue(task);
            }
        }
    }

    /// Total Tasks currently running across every sub-scheduler (spec
    /// invariant ii).
    pub fn total_running(&self) -> usize {
        self.subs.iter().map(|s| s.running()).sum()
    }

    pub fn total_queued(&self) -> usize {
        self.subs.iter().map(|s| s.len()).sum()
    }
}
