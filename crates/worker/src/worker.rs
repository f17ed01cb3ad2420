//! The worker main loop.
//!
//! Startup registers with the control plane (fatal after bounded retries)
//! and starts the push channel. The loop then takes one task at a time
//! from the [`TaskSource`], runs it under the monitor, dispatches the
//! result, relays everything and reports completion. [`WorkerStats`] is
//! owned here and nowhere else.

use std::time::Duration;

use taskrelay_core::task::{PartialUpdate, Task, TaskKind, TaskResult};
use taskrelay_transport::api::TaskDone;
use taskrelay_transport::backoff::BackoffConfig;
use taskrelay_transport::push::{self, PushConfig};
use taskrelay_transport::{retry, ControlPlaneApi, RetryPolicy, UpdateRelay};
use tokio_util::sync::CancellationToken;

use crate::acquisition::{AcquisitionSettings, ApiFeed, TaskSource};
use crate::config::WorkerConfig;
use crate::dispatcher::{self, Dispatch};
use crate::error::WorkerError;
use crate::monitor::{self, UpdateSink};
use crate::stats::WorkerStats;
use crate::supervisor::Supervisor;

/// How long a push sender waits for its frame to be written.
const PUSH_ACK_TIMEOUT: Duration = Duration::from_millis(800);

/// How long shutdown waits for the push task to stop.
const PUSH_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// [`UpdateSink`] that relays through the push channel / HTTP and uses
/// registration as the heartbeat.
struct RelaySink<'a> {
    relay: &'a UpdateRelay,
    kind: TaskKind,
    worker_id: &'a str,
}

impl UpdateSink for RelaySink<'_> {
    async fn relay_partial(&self, update: &PartialUpdate) -> bool {
        self.relay.relay_partial(update).await.is_delivered()
    }

    async fn heartbeat(&self) -> bool {
        match self.relay.api().register(self.kind, self.worker_id).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(error = %e, "Heartbeat failed");
                false
            }
        }
    }
}

/// A worker bound to one control plane and one task kind.
pub struct Worker {
    config: WorkerConfig,
    api: ControlPlaneApi,
    supervisor: Supervisor,
    retry: RetryPolicy,
    stats: WorkerStats,
}

impl Worker {
    pub fn new(config: WorkerConfig) -> Self {
        let api = ControlPlaneApi::new(config.control_plane_url.clone(), config.api_key.clone())
            .with_timeouts(config.http_timeout, config.request_timeout);
        let retry = RetryPolicy {
            attempts: config.retry_attempts,
            backoff: BackoffConfig::default(),
        };
        Self {
            supervisor: Supervisor::from_config(&config),
            api,
            retry,
            stats: WorkerStats::new(),
            config,
        }
    }

    /// Override the retry policy for register / get-task / task-done.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Register, then process tasks until `cancel` fires.
    ///
    /// Returns the final stats, or [`WorkerError::RegistrationFailure`] if
    /// the worker could not register at startup.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<WorkerStats, WorkerError> {
        let kind = self.config.kind;
        let worker_id = self.config.worker_id.clone();
        tracing::info!(
            worker_id = %worker_id,
            kind = %kind,
            control_plane = %self.config.control_plane_url,
            push_enabled = self.config.push_enabled,
            "Worker starting",
        );

        retry(
            &self.retry,
            "register",
            || self.api.register(kind, &worker_id),
            |_| self.stats.record_connection_error(),
        )
        .await
        .map_err(WorkerError::RegistrationFailure)?;
        tracing::info!(worker_id = %worker_id, "Registered with control plane");

        let (push_handle, notifications, push_task) = if self.config.push_enabled {
            let (handle, notifications, task) = push::spawn(
                PushConfig {
                    url: self.config.push_channel_url(),
                    worker_id: worker_id.clone(),
                    api_key: self.config.api_key.clone(),
                    reconnect_delay: self.config.push_reconnect_delay,
                    ack_timeout: PUSH_ACK_TIMEOUT,
                },
                cancel.clone(),
            );
            (Some(handle), Some(notifications), Some(task))
        } else {
            (None, None, None)
        };

        let relay = UpdateRelay::new(self.api.clone(), push_handle);
        let mut source = TaskSource::new(
            ApiFeed::new(self.api.clone(), worker_id.clone(), kind),
            kind,
            notifications,
            AcquisitionSettings {
                poll_interval: self.config.poll_interval,
                register_interval: self.config.register_interval,
                ping_timeout: self.config.http_timeout,
                retry: self.retry.clone(),
            },
        );

        while let Some(task) = source.next(&mut self.stats, &cancel).await {
            self.execute_task(&task, &relay, &cancel).await;
            self.stats.log_summary();
        }

        tracing::info!("Shutting down");
        if let Some(task) = push_task {
            if tokio::time::timeout(PUSH_SHUTDOWN_TIMEOUT, task).await.is_err() {
                tracing::warn!("Push channel did not stop in time");
            }
        }

        Ok(self.stats)
    }

    /// Run one task end to end. Never fails; every outcome is relayed.
    pub async fn execute_task(
        &mut self,
        task: &Task,
        relay: &UpdateRelay,
        cancel: &CancellationToken,
    ) -> TaskResult {
        tracing::info!(
            task_id = %task.task_id,
            kind = %task.kind,
            admin_mode = task.admin_mode,
            "Starting task",
        );

        let sink = RelaySink {
            relay,
            kind: self.config.kind,
            worker_id: &self.config.worker_id,
        };

        let (dispatch, failure) = match self.supervisor.launch(task).await {
            Err(error) => {
                tracing::error!(task_id = %task.task_id, error = %error, "Launch failed");
                let update = PartialUpdate::error(&task.task_id, "launch", error.user_message());
                if !sink.relay_partial(&update).await {
                    self.stats.record_connection_error();
                }
                let result = dispatcher::failure_result(task, &error, 0);
                (Dispatch { stages: Vec::new(), result }, Some(error))
            }
            Ok(process) => {
                let settings = self.config.monitor_settings(task.kind);
                let outcome = monitor::supervise(task, process, &sink, &settings, cancel).await;
                self.stats.record_connection_errors(outcome.connection_errors);
                let secs = outcome.elapsed.as_secs();

                match (outcome.failure(&settings), outcome.result) {
                    (None, Some(document)) => (dispatcher::dispatch(task, document, secs), None),
                    (failure, _) => {
                        let error = failure.unwrap_or(WorkerError::NoResult { exit_code: None });
                        if !outcome.stderr_tail.is_empty() {
                            tracing::warn!(
                                task_id = %task.task_id,
                                stderr_tail = %outcome.stderr_tail.join("\n"),
                                "Child stderr before failure",
                            );
                        }
                        let result = dispatcher::failure_result(task, &error, secs);
                        (Dispatch { stages: Vec::new(), result }, Some(error))
                    }
                }
            }
        };

        for stage in &dispatch.stages {
            if !relay.relay_partial(stage).await.is_delivered() {
                self.stats.record_connection_error();
            }
        }
        if !relay.relay_result(&dispatch.result).await.is_delivered() {
            self.stats.record_connection_error();
        }

        self.report_done(&dispatch.result).await;

        match &failure {
            None if dispatch.result.is_success() => {
                self.stats.record_completed();
                tracing::info!(task_id = %task.task_id, "Task completed");
            }
            None => {
                self.stats.record_failed(false);
                tracing::warn!(task_id = %task.task_id, "Task finished with an error result");
            }
            Some(error) => {
                self.stats.record_failed(error.is_child_failure());
                tracing::warn!(
                    task_id = %task.task_id,
                    error = %error,
                    category = error.category().as_str(),
                    "Task failed",
                );
            }
        }

        dispatch.result
    }

    async fn report_done(&mut self, result: &TaskResult) {
        let done = TaskDone {
            worker_id: self.config.worker_id.clone(),
            task_id: result.task_id.clone(),
            execution_time_seconds: result.execution_time_seconds,
            status: result.status,
        };
        let outcome = retry(
            &self.retry,
            "task-done",
            || self.api.task_done(&done),
            |_| self.stats.record_connection_error(),
        )
        .await;
        if let Err(e) = outcome {
            tracing::error!(task_id = %done.task_id, error = %e, "Could not report task completion");
        }
    }
}

/// Build a worker from `config` and run it until `cancel` fires.
pub async fn run(
    config: WorkerConfig,
    cancel: CancellationToken,
) -> Result<WorkerStats, WorkerError> {
    Worker::new(config).run(cancel).await
}
