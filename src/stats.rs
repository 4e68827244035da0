//! `QueryStatistics` — per-query and per-(chunk, table) rolling statistics
//! (spec §2, §4.5 booting, §4.7) used by the worker scheduler to detect
//! pathological queries and by operators to observe the system. Grounded
//! on the donor codebase's `analytics::query_statistics` tracker: a
//! `parking_lot::RwLock`-guarded map of rolling aggregates, updated on
//! every completed unit of work.

use crate::ids::{ChunkId, QueryId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Duration;

/// Rolling aggregate for one query's Tasks across all chunks.
#[derive(Debug, Clone, Default)]
pub struct QueryStats {
    pub task_count: u64,
    pub cancelled_count: u64,
    pub total_duration: Duration,
    pub min_duration: Option<Duration>,
    pub max_duration: Option<Duration>,
    pub boots: u32,
}

impl QueryStats {
    pub fn avg_duration(&self) -> Duration {
        if self.task_count == 0 {
            Duration::ZERO
        } else {
            self.total_duration / self.task_count as u32
        }
    }

    fn record(&mut self, duration: Duration, cancelled: bool) {
        self.task_count += 1;
        if cancelled {
            self.cancelled_count += 1;
        }
        self.total_duration += duration;
        self.min_duration = Some(self.min_duration.map_or(duration, |m| m.min(duration)));
        self.max_duration = Some(self.max_duration.map_or(duration, |m| m.max(duration)));
    }
}

/// Rolling aggregate for one `(chunk, table)` pair, used by the shared-scan
/// scheduler to estimate how expensive the next chunk in a scan will be.
#[derive(Debug, Clone, Default)]
pub struct ChunkTableStats {
    pub sample_count: u64,
    pub total_duration: Duration,
}

impl ChunkTableStats {
    pub fn average(&self) -> Duration {
        if self.sample_count == 0 {
            Duration::ZERO
        } else {
            self.total_duration / self.sample_count as u32
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ChunkTableKey {
    chunk_id: ChunkId,
    table: String,
}

/// Thread-safe collector of per-query and per-(chunk,table) statistics.
#[derive(Default)]
pub struct QueryStatistics {
    queries: RwLock<HashMap<QueryId, QueryStats>>,
    chunk_tables: RwLock<HashMap<ChunkTableKey, ChunkTableStats>>,
}

impl QueryStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that one Task of `query_id` against `(chunk_id, table)`
    /// finished, taking `duration`.
    pub fn record_task_finish(&self, query_id: QueryId, chunk_id: ChunkId, table: &str, duration: Duration, cancelled: bool) {
        self.queries.write().entry(query_id).or_default().record(duration, cancelled);
        let key = ChunkTableKey { chunk_id, table: table.to_string() };
        let mut chunk_tables = self.chunk_tables.write();
        let entry = chunk_tables.entry(key).or_default();
        entry.sample_count += 1;
        entry.total_duration += duration;
    }

    /// Record that a Task belonging to `query_id` was booted to `snail`
    /// (spec §4.5). Returns the query's boot count after this increment so
    /// the scheduler can compare against `maxBootsPerQuery` inline.
    pub fn record_boot(&self, query_id: QueryId) -> u32 {
        let mut queries = self.queries.write();
        let entry = queries.entry(query_id).or_default();
        entry.boots += 1;
        entry.boots
    }

    pub fn boots_for(&self, query_id: QueryId) -> u32 {
        self.queries.read().get(&query_id).map(|q| q.boots).unwrap_or(0)
    }

    pub fn query_stats(&self, query_id: QueryId) -> Option<QueryStats> {
        self.queries.read().get(&query_id).cloned()
    }

    pub fn chunk_table_average(&self, chunk_id: ChunkId, table: &str) -> Duration {
        let key = ChunkTableKey { chunk_id, table: table.to_string() };
        self.chunk_tables.read().get(&key).map(|s| s.average()).unwrap_or_default()
    }

    pub fn forget_query(&self, query_id: QueryId) {
        self.queries.write().remove(&query_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rolling_min_max_average() {
        let stats = QueryStatistics::new();
        stats.record_task_finish(1, 10, "Object", Duration::from_millis(100), false);
        stats.record_task_finish(1, 11, "Object", Duration::from_millis(300), false);
        stats.record_task_finish(1, 12, "Object", Duration::from_millis(200), true);

        let q = stats.query_stats(1).unwrap();
        assert_eq!(q.task_count, 3);
        assert_eq!(q.cancelled_count, 1);
        assert_eq!(q.min_duration, Some(Duration::from_millis(100)));
        assert_eq!(q.max_duration, Some(Duration::from_millis(300)));
        assert_eq!(q.avg_duration(), Duration::from_millis(200));
    }

    #[test]
    fn boots_increment_and_are_queryable() {
        let stats = QueryStatistics::new();
        assert_eq!(stats.boots_for(1), 0);
        assert_eq!(stats.record_boot(1), 1);
        assert_eq!(stats.record_boot(1), 2);
        assert_eq!(stats.boots_for(1), 2);
    }

    #[test]
    fn chunk_table_average_tracks_per_table() {
        let stats = QueryStatistics::new();
        stats.record_task_finish(1, 5, "Source", Duration::from_millis(100), false);
        stats.record_task_finish(2, 5, "Source", Duration::from_millis(300), false);
        assert_eq!(stats.chunk_table_average(5, "Source"), Duration::from_millis(200));
        assert_eq!(stats.chunk_table_average(5, "Object"), Duration::ZERO);
    }
}
