//! Well-known wire constants shared by the worker and the control plane.
//!
//! Push-channel message discriminators, status strings used in HTTP
//! responses, and the sentinel lines of the child-process marker protocol.

/// Push message sent by the control plane when a task becomes available.
pub const MSG_TYPE_NEW_TASK: &str = "new_task";

/// Push message carrying a partial update from the worker.
pub const MSG_TYPE_TASK_UPDATE: &str = "task_update";

/// Keepalive probe from the control plane.
pub const MSG_TYPE_PING: &str = "ping";

/// Keepalive answer sent back by the worker.
pub const MSG_TYPE_PONG: &str = "pong";

/// Acknowledgement sent by the control plane once the push channel is bound
/// to a worker.
pub const MSG_TYPE_REGISTERED: &str = "registered";

/// `status` value of a successful control-plane response.
pub const STATUS_OK: &str = "ok";

/// `status` value returned by `/get-task` when the queue is empty.
pub const STATUS_EMPTY: &str = "empty";

/// Start of a partial-progress block in child stdout.
pub const PARTIAL_START: &str = "===JSON_PARTIAL_START===";

/// End of a partial-progress block in child stdout.
pub const PARTIAL_END: &str = "===JSON_PARTIAL_END===";

/// Start of the final-result block in child stdout.
pub const RESULT_START: &str = "===JSON_RESULT_START===";

/// End of the final-result block in child stdout.
pub const RESULT_END: &str = "===JSON_RESULT_END===";
