//! REST client for the control-plane HTTP endpoints.
//!
//! Wraps `register`, `get-task`, `task-update` and `task-done` using
//! [`reqwest`]. Every method returns a [`TransportError`] on failure and
//! never retries on its own; retry policy belongs to the caller.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use taskrelay_core::protocol::{STATUS_EMPTY, STATUS_OK};
use taskrelay_core::task::{ResultStatus, Task, TaskKind};

use crate::error::TransportError;

/// Header carrying the worker's API credential.
pub const API_KEY_HEADER: &str = "x-api-key";

/// HTTP client for one control plane.
#[derive(Debug, Clone)]
pub struct ControlPlaneApi {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    /// Deadline for a single partial-update request.
    update_timeout: Duration,
    /// Deadline for register / get-task / task-done requests.
    request_timeout: Duration,
}

/// Response of `POST /register/{kind}/{workerId}`.
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterResponse {
    pub status: String,
    #[serde(rename = "workerId", default)]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GetTaskResponse {
    status: String,
    #[serde(default)]
    task: Option<Value>,
}

#[derive(Debug, Serialize)]
struct GetTaskRequest<'a> {
    #[serde(rename = "workerId")]
    worker_id: &'a str,
    kind: TaskKind,
}

#[derive(Debug, Serialize)]
struct TaskUpdateRequest<'a> {
    #[serde(rename = "taskId")]
    task_id: &'a str,
    #[serde(rename = "partialData")]
    partial_data: &'a Value,
}

/// Body of `POST /task-done`.
#[derive(Debug, Clone, Serialize)]
pub struct TaskDone {
    #[serde(rename = "workerId")]
    pub worker_id: String,
    #[serde(rename = "taskId")]
    pub task_id: String,
    #[serde(rename = "executionTimeSeconds")]
    pub execution_time_seconds: u64,
    pub status: ResultStatus,
}

impl ControlPlaneApi {
    /// Create a client for the control plane at `base_url`
    /// (e.g. `http://host:8000`).
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url, api_key)
    }

    /// Create an API client reusing an existing [`reqwest::Client`].
    pub fn with_client(
        client: reqwest::Client,
        base_url: impl Into<String>,
        api_key: Option<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            update_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
        }
    }

    /// Override the per-request deadlines.
    pub fn with_timeouts(mut self, update_timeout: Duration, request_timeout: Duration) -> Self {
        self.update_timeout = update_timeout;
        self.request_timeout = request_timeout;
        self
    }

    /// Register this worker (also used as the liveness heartbeat).
    pub async fn register(
        &self,
        kind: TaskKind,
        worker_id: &str,
    ) -> Result<RegisterResponse, TransportError> {
        let response = self
            .post(&format!("/register/{kind}/{worker_id}"), self.request_timeout)
            .send()
            .await?;

        let body: RegisterResponse = Self::parse_response(response).await?;
        if body.status != STATUS_OK {
            return Err(TransportError::Rejected(format!(
                "registration status '{}'",
                body.status
            )));
        }
        Ok(body)
    }

    /// Pull the next task for `kind`. `Ok(None)` when the queue is empty.
    pub async fn get_task(
        &self,
        worker_id: &str,
        kind: TaskKind,
    ) -> Result<Option<Task>, TransportError> {
        let response = self
            .post("/get-task", self.request_timeout)
            .json(&GetTaskRequest { worker_id, kind })
            .send()
            .await?;

        let body: GetTaskResponse = Self::parse_response(response).await?;
        match (body.status.as_str(), body.task) {
            (STATUS_EMPTY, _) | (STATUS_OK, None) | (STATUS_OK, Some(Value::Null)) => Ok(None),
            (STATUS_OK, Some(task)) => serde_json::from_value(task)
                .map(Some)
                .map_err(|e| TransportError::Decode(format!("invalid task: {e}"))),
            (other, _) => Err(TransportError::Rejected(format!("get-task status '{other}'"))),
        }
    }

    /// Send one partial (or final) update for `task_id`. Uses the short
    /// update deadline.
    pub async fn task_update(
        &self,
        task_id: &str,
        partial_data: &Value,
    ) -> Result<(), TransportError> {
        let response = self
            .post("/task-update", self.update_timeout)
            .json(&TaskUpdateRequest {
                task_id,
                partial_data,
            })
            .send()
            .await?;

        Self::check_ack(response).await
    }

    /// Report task completion. A 404 means the control plane already
    /// closed the task and is treated as success.
    pub async fn task_done(&self, done: &TaskDone) -> Result<(), TransportError> {
        let response = self
            .post("/task-done", self.request_timeout)
            .json(done)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            tracing::debug!(task_id = %done.task_id, "task-done returned 404, already closed");
            return Ok(());
        }
        Self::check_ack(response).await
    }

    // ---- private helpers ----

    fn post(&self, path: &str, timeout: Duration) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .post(format!("{}{path}", self.base_url))
            .timeout(timeout);
        match &self.api_key {
            Some(key) => builder.header(API_KEY_HEADER, key),
            None => builder,
        }
    }

    /// Ensure the response has a success status code.
    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, TransportError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Parse a successful JSON response body into the expected type.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, TransportError> {
        let response = Self::ensure_success(response).await?;
        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|e| TransportError::Decode(e.to_string()))
    }

    /// Accept a 2xx response unless its JSON body reports a status other
    /// than `"ok"`. Empty or non-JSON bodies are accepted.
    async fn check_ack(response: reqwest::Response) -> Result<(), TransportError> {
        let response = Self::ensure_success(response).await?;
        let text = response.text().await.unwrap_or_default();
        let status = serde_json::from_str::<Value>(&text)
            .ok()
            .and_then(|v| v.get("status").and_then(Value::as_str).map(str::to_string));
        match status {
            Some(status) if status != STATUS_OK => Err(TransportError::Rejected(status)),
            _ => Ok(()),
        }
    }
}
