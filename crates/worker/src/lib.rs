//! Task relay worker daemon.
//!
//! Acquires tasks from the control plane (push notifications plus
//! polling), runs each one as a supervised child process, extracts
//! progress and the final result from the child's stdout, and relays
//! them back over the push channel or HTTP.

pub mod acquisition;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod monitor;
pub mod stats;
pub mod stream;
pub mod supervisor;
pub mod worker;

/// Tracing target for lines the child process writes.
pub const CHILD_LOG_TARGET: &str = "taskrelay_worker::child";
