//! Task model shared by the worker and the control-plane client.
//!
//! A [`Task`] is acquired from the control plane, executed by exactly one
//! worker, and answered with zero or more [`PartialUpdate`]s followed by a
//! single terminal [`TaskResult`].

use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;

use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::CoreError;

/// Category of automation job. Determines the executable, the subject format
/// and the timeout policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    DebtLookup,
    MovementLookup,
    PinSend,
}

impl TaskKind {
    pub const ALL: [TaskKind; 3] = [Self::DebtLookup, Self::MovementLookup, Self::PinSend];

    /// Wire name, as used in URLs and JSON bodies.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DebtLookup => "debt_lookup",
            Self::MovementLookup => "movement_lookup",
            Self::PinSend => "pin_send",
        }
    }

    /// Accepted subject lengths (all ASCII digits).
    ///
    /// Lookups take a national ID number, PIN sends a phone number.
    pub fn subject_len(&self) -> RangeInclusive<usize> {
        match self {
            Self::DebtLookup | Self::MovementLookup => 7..=8,
            Self::PinSend => 10..=10,
        }
    }

    /// Whether the child process receives the serialized task as a second
    /// argument.
    pub fn passes_task_json(&self) -> bool {
        !matches!(self, Self::PinSend)
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s.trim())
            .ok_or_else(|| CoreError::UnknownKind(s.to_string()))
    }
}

/// A unit of work handed out by the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    #[serde(alias = "taskId")]
    pub task_id: String,
    pub kind: TaskKind,
    /// National ID or phone number, depending on `kind`.
    pub subject: String,
    #[serde(rename = "adminMode", default)]
    pub admin_mode: bool,
}

impl Task {
    /// Check that this task can be executed by a worker configured for
    /// `worker_kind`.
    ///
    /// Rules:
    /// - `kind` must equal `worker_kind`.
    /// - `task_id` must not be blank.
    /// - `subject` must be ASCII digits with a length in
    ///   [`TaskKind::subject_len`].
    pub fn validate_for(&self, worker_kind: TaskKind) -> Result<(), CoreError> {
        if self.kind != worker_kind {
            return Err(CoreError::Validation(format!(
                "Task kind {} does not match worker kind {worker_kind}",
                self.kind
            )));
        }
        if self.task_id.trim().is_empty() {
            return Err(CoreError::Validation("Task id must not be empty".to_string()));
        }
        validate_subject(self.kind, &self.subject)
    }
}

/// Validate a subject against the format expected for `kind`.
pub fn validate_subject(kind: TaskKind, subject: &str) -> Result<(), CoreError> {
    let range = kind.subject_len();
    if !subject.chars().all(|c| c.is_ascii_digit()) {
        return Err(CoreError::Validation(format!(
            "Subject for {kind} must contain only digits"
        )));
    }
    if !range.contains(&subject.len()) {
        return Err(CoreError::Validation(format!(
            "Subject for {kind} must have {}-{} digits, got {}",
            range.start(),
            range.end(),
            subject.len()
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Partial updates
// ---------------------------------------------------------------------------

/// Status carried by a non-terminal update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateStatus {
    Running,
    Error,
}

/// Incremental progress report for a running task.
///
/// Serializes as the control plane's `partialData` object: `stage`,
/// `message` and `status` alongside the flattened `extra` keys.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialUpdate {
    pub task_id: String,
    pub stage: String,
    pub message: String,
    pub extra: Map<String, Value>,
    pub status: UpdateStatus,
}

impl PartialUpdate {
    pub fn running(
        task_id: impl Into<String>,
        stage: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            stage: stage.into(),
            message: message.into(),
            extra: Map::new(),
            status: UpdateStatus::Running,
        }
    }

    pub fn error(
        task_id: impl Into<String>,
        stage: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            status: UpdateStatus::Error,
            ..Self::running(task_id, stage, message)
        }
    }

    /// Build an update from a JSON block emitted by the child process.
    ///
    /// `stage` defaults to `"progress"`. The message is taken from
    /// `message`, falling back to `info`. A `status` of `"error"` marks the
    /// update as an error; every other key is kept in `extra`.
    pub fn from_block(task_id: impl Into<String>, block: Value) -> Self {
        let mut fields = match block {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };

        let stage = take_string(&mut fields, "stage").unwrap_or_else(|| "progress".to_string());
        let message = take_string(&mut fields, "message")
            .or_else(|| take_string(&mut fields, "info"))
            .unwrap_or_default();
        let status = match take_string(&mut fields, "status").as_deref() {
            Some("error") => UpdateStatus::Error,
            _ => UpdateStatus::Running,
        };

        Self {
            task_id: task_id.into(),
            stage,
            message,
            extra: fields,
            status,
        }
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// The `partialData` object relayed to the control plane.
    pub fn to_partial_data(&self) -> Value {
        let mut map = self.extra.clone();
        map.insert("stage".to_string(), Value::String(self.stage.clone()));
        map.insert("message".to_string(), Value::String(self.message.clone()));
        map.insert(
            "status".to_string(),
            serde_json::to_value(self.status).unwrap_or(Value::Null),
        );
        Value::Object(map)
    }
}

impl Serialize for PartialUpdate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_partial_data().serialize(serializer)
    }
}

/// Remove `key` from `map` and return it when it holds a string.
///
/// Non-string values are left in place.
fn take_string(map: &mut Map<String, Value>, key: &str) -> Option<String> {
    match map.get(key) {
        Some(Value::String(_)) => match map.remove(key) {
            Some(Value::String(s)) => Some(s),
            _ => None,
        },
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Terminal results
// ---------------------------------------------------------------------------

/// Outcome of a finished task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Completed,
    Error,
}

impl ResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }
}

/// The single terminal outcome document for a task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskResult {
    pub task_id: String,
    pub status: ResultStatus,
    pub payload: Map<String, Value>,
    pub execution_time_seconds: u64,
}

impl TaskResult {
    pub fn is_success(&self) -> bool {
        self.status == ResultStatus::Completed
    }

    /// The final `partialData` object: the payload plus `status` and
    /// `executionTimeSeconds`, which always win over payload keys of the
    /// same name.
    pub fn to_partial_data(&self) -> Value {
        let mut map = self.payload.clone();
        map.insert(
            "status".to_string(),
            Value::String(self.status.as_str().to_string()),
        );
        map.insert(
            "executionTimeSeconds".to_string(),
            Value::from(self.execution_time_seconds),
        );
        Value::Object(map)
    }
}

impl Serialize for TaskResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_partial_data().serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn task(kind: TaskKind, subject: &str) -> Task {
        Task {
            task_id: "t-1".to_string(),
            kind,
            subject: subject.to_string(),
            admin_mode: false,
        }
    }

    #[test]
    fn kind_round_trips_through_wire_name() {
        for kind in TaskKind::ALL {
            assert_eq!(kind.as_str().parse::<TaskKind>().unwrap(), kind);
        }
        assert_matches!("scraping".parse::<TaskKind>(), Err(CoreError::UnknownKind(_)));
    }

    #[test]
    fn task_deserializes_with_defaults_and_alias() {
        let parsed: Task = serde_json::from_value(json!({
            "taskId": "abc",
            "kind": "pin_send",
            "subject": "1122334455"
        }))
        .unwrap();
        assert_eq!(parsed.task_id, "abc");
        assert_eq!(parsed.kind, TaskKind::PinSend);
        assert!(!parsed.admin_mode);
    }

    #[test]
    fn task_serializes_admin_mode_in_camel_case() {
        let mut t = task(TaskKind::DebtLookup, "12345678");
        t.admin_mode = true;
        let value = serde_json::to_value(&t).unwrap();
        assert_eq!(value["adminMode"], true);
        assert_eq!(value["kind"], "debt_lookup");
    }

    #[test]
    fn valid_subjects_pass() {
        assert!(task(TaskKind::DebtLookup, "12345678").validate_for(TaskKind::DebtLookup).is_ok());
        assert!(task(TaskKind::MovementLookup, "1234567")
            .validate_for(TaskKind::MovementLookup)
            .is_ok());
        assert!(task(TaskKind::PinSend, "1122334455").validate_for(TaskKind::PinSend).is_ok());
    }

    #[test]
    fn invalid_subjects_are_rejected() {
        assert_matches!(
            task(TaskKind::DebtLookup, "1234").validate_for(TaskKind::DebtLookup),
            Err(CoreError::Validation(_))
        );
        assert_matches!(
            task(TaskKind::DebtLookup, "12a45678").validate_for(TaskKind::DebtLookup),
            Err(CoreError::Validation(_))
        );
        assert_matches!(
            task(TaskKind::PinSend, "12345678").validate_for(TaskKind::PinSend),
            Err(CoreError::Validation(_))
        );
    }

    #[test]
    fn kind_mismatch_is_rejected() {
        let err = task(TaskKind::PinSend, "1122334455")
            .validate_for(TaskKind::DebtLookup)
            .unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }

    #[test]
    fn partial_from_block_extracts_known_fields() {
        let update = PartialUpdate::from_block(
            "t-1",
            json!({"stage": "score_obtained", "info": "Score: 85", "score": 85}),
        );
        assert_eq!(update.stage, "score_obtained");
        assert_eq!(update.message, "Score: 85");
        assert_eq!(update.status, UpdateStatus::Running);
        assert_eq!(update.extra.get("score"), Some(&json!(85)));
        assert!(!update.extra.contains_key("info"));
    }

    #[test]
    fn partial_from_block_honours_error_status() {
        let update =
            PartialUpdate::from_block("t-1", json!({"status": "error", "message": "bad"}));
        assert_eq!(update.status, UpdateStatus::Error);
        assert_eq!(update.stage, "progress");
    }

    #[test]
    fn partial_data_flattens_extra() {
        let update = PartialUpdate::running("t-1", "login", "Logged in")
            .with_extra("attempt", json!(2));
        assert_eq!(
            serde_json::to_value(&update).unwrap(),
            json!({"stage": "login", "message": "Logged in", "status": "running", "attempt": 2})
        );
    }

    #[test]
    fn result_fields_override_payload_keys() {
        let mut payload = Map::new();
        payload.insert("status".to_string(), json!("successful"));
        payload.insert("dni".to_string(), json!("12345678"));
        let result = TaskResult {
            task_id: "t-1".to_string(),
            status: ResultStatus::Completed,
            payload,
            execution_time_seconds: 12,
        };
        let data = result.to_partial_data();
        assert_eq!(data["status"], "completed");
        assert_eq!(data["executionTimeSeconds"], 12);
        assert_eq!(data["dni"], "12345678");
    }
}
