//! Push-channel message types and parser.
//!
//! The control plane sends JSON text frames shaped
//! `{"type": "<kind>", ...}`. This module deserializes them into
//! [`PushMessage`] and builds the worker's outgoing frames.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use taskrelay_core::protocol::{MSG_TYPE_PONG, MSG_TYPE_TASK_UPDATE};

/// All known incoming push messages.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushMessage {
    /// A task is available; the worker should pull immediately.
    NewTask {
        #[serde(rename = "taskId", default)]
        task_id: Option<String>,
    },

    /// Keepalive probe, answered with a pong frame.
    Ping,

    /// The server bound this connection to a worker.
    Registered {
        #[serde(rename = "workerId", default)]
        worker_id: Option<String>,
    },
}

/// Outgoing partial update frame.
#[derive(Debug, Serialize)]
struct TaskUpdateFrame<'a> {
    r#type: &'static str,
    #[serde(rename = "taskId")]
    task_id: &'a str,
    #[serde(rename = "partialData")]
    partial_data: &'a Value,
    timestamp: String,
}

/// Outgoing keepalive answer.
#[derive(Debug, Serialize)]
struct PongFrame<'a> {
    r#type: &'static str,
    #[serde(rename = "workerId")]
    worker_id: &'a str,
    timestamp: String,
}

/// Parse a push-channel text frame into a typed message.
///
/// Returns `Err` for malformed JSON or unknown `type` values. Callers
/// should log and continue.
pub fn parse_message(text: &str) -> Result<PushMessage, serde_json::Error> {
    serde_json::from_str(text)
}

/// Serialize a `task_update` frame.
pub fn task_update_frame(task_id: &str, partial_data: &Value) -> Result<String, serde_json::Error> {
    serde_json::to_string(&TaskUpdateFrame {
        r#type: MSG_TYPE_TASK_UPDATE,
        task_id,
        partial_data,
        timestamp: Utc::now().to_rfc3339(),
    })
}

/// Serialize a `pong` frame.
pub fn pong_frame(worker_id: &str) -> Result<String, serde_json::Error> {
    serde_json::to_string(&PongFrame {
        r#type: MSG_TYPE_PONG,
        worker_id,
        timestamp: Utc::now().to_rfc3339(),
    })
}
