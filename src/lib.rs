//! Core dispatch, scheduling, and replication-control engine for a
//! partitioned analytic catalog database (spec §1-§2): the czar-side
//! dispatch/result-merge pipeline, the worker-side task scheduler, and the
//! replica-side job/request framework, plus the ambient error/config/
//! control-db/wire/CSV stack those three pipelines share.
//!
//! SQL parsing, query rewriting, the MySQL wire protocol, the XRootD/SSI
//! transport, and CSV file I/O are out of scope; this crate receives
//! already-templated per-chunk SQL fragments and talks to its
//! collaborators through the [`task::SqlExecutor`], [`merger::MergeSqlExecutor`],
//! [`control_db::ControlDb`], and [`messenger::Transport`] seams.

pub mod chunk_resource;
pub mod config;
pub mod control_db;
pub mod csv;
pub mod director_index;
pub mod error;
pub mod executor;
pub mod ids;
pub mod job;
pub mod large_result;
pub mod merger;
pub mod messenger;
pub mod request;
pub mod scheduler;
pub mod stats;
pub mod task;
pub mod wire;

pub use error::{CoreError, Result};
