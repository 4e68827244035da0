//! Identifier types shared across the czar and worker components.

use serde::{Deserialize, Serialize};
use std::fmt;

pub type QueryId = u64;
pub type JobId = u64;
pub type ChunkId = u32;
pub type SubChunkId = u32;

/// Chunk id `0` is the reserved "dummy" chunk used for non-partitioned joins.
pub const DUMMY_CHUNK_ID: ChunkId = 0;

/// `(QueryId, JobId, ChunkId)` uniquely identifies a worker-side Task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId {
    pub query_id: QueryId,
    pub job_id: JobId,
    pub chunk_id: ChunkId,
}

impl TaskId {
    pub fn new(query_id: QueryId, job_id: JobId, chunk_id: ChunkId) -> Self {
        Self { query_id, job_id, chunk_id }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.query_id, self.job_id, self.chunk_id)
    }
}

/// Globally unique string identifier for a replica-side Request. Never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Name of a worker node, used as the key into Messenger's connector map.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(pub String);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for WorkerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for WorkerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}
