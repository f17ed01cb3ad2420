//! Control-plane client for task relay workers.
//!
//! Provides the HTTP API wrapper (register, get-task, task-update,
//! task-done), an explicit retry combinator with exponential backoff, the
//! persistent push channel over WebSocket, and the update relay that
//! prefers the push channel and falls back to HTTP.

pub mod api;
pub mod backoff;
pub mod error;
pub mod messages;
pub mod push;
pub mod relay;
pub mod retry;

pub use api::ControlPlaneApi;
pub use error::TransportError;
pub use push::{PushConfig, PushHandle, PushNotification};
pub use relay::{Delivery, UpdateRelay};
pub use retry::{retry, RetryPolicy};
