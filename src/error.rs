//! Crate-wide error taxonomy.
//!
//! Mirrors the failure classes enumerated in the error-handling design:
//! configuration, transport, server-reported, timeout/expiration,
//! cancellation, worker-resource, merge, and memory-lock violations.

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("schema version mismatch: expected {expected}, found {found}")]
    SchemaVersionMismatch { expected: u32, found: u32 },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("server error from worker {worker}: {message}")]
    Server { worker: String, message: String },

    #[error("request {0} timed out")]
    Timeout(String),

    #[error("request {0} expired")]
    Expired(String),

    #[error("request {0} was cancelled")]
    Cancelled(String),

    #[error("worker resource error: {0}")]
    WorkerResource(String),

    #[error("merge error: {0}")]
    Merge(String),

    #[error("memory lock violation: owner uid {expected} but found {found}")]
    MemoryLockViolation { expected: u64, found: u64 },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("csv parse error: {0}")]
    Csv(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        CoreError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Serialization(e.to_string())
    }
}

impl From<bincode::error::EncodeError> for CoreError {
    fn from(e: bincode::error::EncodeError) -> Self {
        CoreError::Serialization(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for CoreError {
    fn from(e: bincode::error::DecodeError) -> Self {
        CoreError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
