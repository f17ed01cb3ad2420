//! Per-kind post-processing of the child's final result document.
//!
//! The dispatcher turns a parsed result block into the terminal
//! [`TaskResult`] (plus, for movement lookups, the stage updates relayed
//! before it), and builds failure results with a sanitized message.

use serde_json::{Map, Value};
use taskrelay_core::sanitize::{sanitize, ErrorCategory};
use taskrelay_core::task::{PartialUpdate, ResultStatus, Task, TaskKind, TaskResult};

use crate::error::WorkerError;

/// Result document `status` that marks a PIN send as delivered.
const PIN_SUCCESS: &str = "successful";

/// Payload keys that hold free-text error details from the child.
const RAW_ERROR_KEYS: [&str; 4] = ["error", "errors", "traceback", "exception"];

/// What to relay for one finished task, in order.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    /// Stage updates relayed before the result.
    pub stages: Vec<PartialUpdate>,
    pub result: TaskResult,
}

impl Dispatch {
    fn result_only(result: TaskResult) -> Self {
        Self {
            stages: Vec::new(),
            result,
        }
    }
}

/// Post-process a parsed result document for `task`.
///
/// Never fails: a document that cannot be processed becomes an error
/// result.
pub fn dispatch(task: &Task, document: Value, execution_time_seconds: u64) -> Dispatch {
    let Value::Object(document) = document else {
        let error = WorkerError::PostProcessing("result document is not an object".to_string());
        tracing::warn!(task_id = %task.task_id, error = %error, "Result post-processing failed");
        return Dispatch::result_only(failure_result(task, &error, execution_time_seconds));
    };

    match task.kind {
        TaskKind::DebtLookup => {
            Dispatch::result_only(pass_through(task, document, execution_time_seconds))
        }
        TaskKind::MovementLookup => movement_lookup(task, document, execution_time_seconds),
        TaskKind::PinSend => {
            Dispatch::result_only(pin_send(task, document, execution_time_seconds))
        }
    }
}

/// An error result for a task that produced no usable result.
pub fn failure_result(task: &Task, error: &WorkerError, execution_time_seconds: u64) -> TaskResult {
    let category = error.category();
    let mut payload = Map::new();
    payload.insert("message".to_string(), Value::from(error.user_message()));
    payload.insert("errorCategory".to_string(), Value::from(category.as_str()));
    TaskResult {
        task_id: task.task_id.clone(),
        status: ResultStatus::Error,
        payload,
        execution_time_seconds,
    }
}

fn pass_through(task: &Task, mut document: Map<String, Value>, secs: u64) -> TaskResult {
    let status = if reports_error(&document) {
        sanitize_error_fields(&mut document);
        ResultStatus::Error
    } else {
        ResultStatus::Completed
    };
    TaskResult {
        task_id: task.task_id.clone(),
        status,
        payload: document,
        execution_time_seconds: secs,
    }
}

fn movement_lookup(task: &Task, document: Map<String, Value>, secs: u64) -> Dispatch {
    let stages = match document.get("stages") {
        Some(Value::Array(stages)) => stages
            .iter()
            .cloned()
            .map(|stage| PartialUpdate::from_block(task.task_id.clone(), stage))
            .collect(),
        Some(other) => {
            tracing::warn!(task_id = %task.task_id, stages = %other, "Ignoring non-array stages");
            Vec::new()
        }
        None => Vec::new(),
    };

    Dispatch {
        stages,
        result: pass_through(task, document, secs),
    }
}

fn pin_send(task: &Task, document: Map<String, Value>, secs: u64) -> TaskResult {
    let delivered = document.get("status").and_then(Value::as_str) == Some(PIN_SUCCESS);

    let mut payload = Map::new();
    payload.insert("phone".to_string(), Value::from(task.subject.clone()));
    payload.insert("delivered".to_string(), Value::Bool(delivered));
    for (key, value) in &document {
        let lower = key.to_ascii_lowercase();
        if lower.contains("image") || lower.contains("screenshot") {
            payload.insert(key.clone(), value.clone());
        }
    }

    let message = if delivered {
        document
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("PIN sent")
            .to_string()
    } else {
        raw_error_text(&document)
            .as_deref()
            .map(sanitize)
            .unwrap_or_else(|| ErrorCategory::Unexpected.user_message())
            .to_string()
    };
    payload.insert("message".to_string(), Value::String(message));

    TaskResult {
        task_id: task.task_id.clone(),
        status: if delivered {
            ResultStatus::Completed
        } else {
            ResultStatus::Error
        },
        payload,
        execution_time_seconds: secs,
    }
}

fn reports_error(document: &Map<String, Value>) -> bool {
    matches!(
        document.get("status").and_then(Value::as_str),
        Some("error" | "failed")
    )
}

fn raw_error_text(document: &Map<String, Value>) -> Option<String> {
    RAW_ERROR_KEYS
        .iter()
        .chain(["message"].iter())
        .find_map(|key| document.get(*key))
        .map(|value| match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
}

/// Replace child-supplied error text with its sanitized category message.
fn sanitize_error_fields(document: &mut Map<String, Value>) {
    let raw = raw_error_text(document).unwrap_or_default();
    let category = ErrorCategory::classify(&raw);
    for key in RAW_ERROR_KEYS {
        document.remove(key);
    }
    document.insert("message".to_string(), Value::from(category.user_message()));
    document.insert("errorCategory".to_string(), Value::from(category.as_str()));
}
