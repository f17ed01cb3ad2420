//! Pure domain logic for the task relay worker.
//!
//! Task model, subject validation, the child-process marker protocol and
//! error sanitization. Nothing here performs I/O, so both the transport
//! client and the worker daemon can depend on it freely.

pub mod error;
pub mod marker;
pub mod protocol;
pub mod sanitize;
pub mod task;
