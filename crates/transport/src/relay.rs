//! Update relay: push channel first, short-timeout HTTP second.
//!
//! Neither path retries. A message that fails on the push channel falls
//! through to HTTP once; if HTTP fails too the message is dropped and the
//! caller learns about it through [`Delivery::Dropped`].

use serde_json::Value;
use taskrelay_core::task::{PartialUpdate, TaskResult};

use crate::api::ControlPlaneApi;
use crate::push::PushHandle;

/// How an update reached (or failed to reach) the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Push,
    Http,
    /// The HTTP fallback failed; the update was not delivered.
    Dropped,
}

impl Delivery {
    pub fn is_delivered(&self) -> bool {
        !matches!(self, Self::Dropped)
    }
}

/// Delivers partial and final updates for running tasks.
#[derive(Clone)]
pub struct UpdateRelay {
    api: ControlPlaneApi,
    push: Option<PushHandle>,
}

impl UpdateRelay {
    pub fn new(api: ControlPlaneApi, push: Option<PushHandle>) -> Self {
        Self { api, push }
    }

    pub fn api(&self) -> &ControlPlaneApi {
        &self.api
    }

    pub async fn relay_partial(&self, update: &PartialUpdate) -> Delivery {
        self.relay(&update.task_id, &update.to_partial_data()).await
    }

    /// Relay the terminal result as the task's last `partialData`.
    pub async fn relay_result(&self, result: &TaskResult) -> Delivery {
        self.relay(&result.task_id, &result.to_partial_data()).await
    }

    async fn relay(&self, task_id: &str, partial_data: &Value) -> Delivery {
        if let Some(push) = self.push.as_ref().filter(|p| p.is_connected()) {
            match push.send_partial_data(task_id, partial_data).await {
                Ok(()) => return Delivery::Push,
                Err(e) => {
                    tracing::debug!(task_id, error = %e, "Push delivery failed, falling back to HTTP");
                }
            }
        }

        match self.api.task_update(task_id, partial_data).await {
            Ok(()) => Delivery::Http,
            Err(e) => {
                tracing::warn!(task_id, error = %e, "Update dropped");
                Delivery::Dropped
            }
        }
    }
}
