//! Per-task polling loop: stdout draining, marker parsing, timeouts and
//! heartbeats.
//!
//! Everything runs in one loop that suspends only on a bounded wait for
//! the next stdout item. Each iteration checks, in order: shutdown, the
//! global timeout, the idle timeout, and the heartbeat interval, then
//! drains stderr and handles at most one stdout item.

use std::future::Future;
use std::time::{Duration, Instant};

use serde_json::Value;
use taskrelay_core::marker::{BlockKind, MalformedResult, MarkerEvent, MarkerParser};
use taskrelay_core::task::{PartialUpdate, Task};
use tokio_util::sync::CancellationToken;

use crate::error::WorkerError;
use crate::stream::StreamItem;
use crate::supervisor::ProcessHandle;
use crate::CHILD_LOG_TARGET;

/// Liveness limits for one task.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorSettings {
    /// Maximum wall-clock time since the process started.
    pub global_timeout: Duration,
    /// Maximum time without a stdout line.
    pub idle_timeout: Duration,
    /// Interval between registration pings while the task runs.
    pub heartbeat_interval: Duration,
    /// Upper bound on one heartbeat. A ping is also cut short at the next
    /// timeout deadline.
    pub heartbeat_timeout: Duration,
    /// Bounded wait for the next stdout item.
    pub poll_interval: Duration,
    /// How long to wait for exit after stdout closes.
    pub exit_grace: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            global_timeout: Duration::from_secs(1800),
            idle_timeout: Duration::from_secs(1200),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(50),
            exit_grace: Duration::from_secs(5),
        }
    }
}

/// Where the monitor sends progress and heartbeats.
///
/// Both methods report whether delivery succeeded; failures are counted,
/// never retried.
pub trait UpdateSink: Send + Sync {
    fn relay_partial(&self, update: &PartialUpdate) -> impl Future<Output = bool> + Send;

    fn heartbeat(&self) -> impl Future<Output = bool> + Send;
}

/// How the monitored process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// Stdout closed and the process exited (code `None` when killed by a
    /// signal or after the grace period).
    Exited(Option<i32>),
    TimedOutGlobal,
    TimedOutIdle,
    /// The worker is shutting down.
    Cancelled,
}

/// Everything the monitor learned about one execution.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub termination: Termination,
    /// The first successfully parsed result block.
    pub result: Option<Value>,
    /// A result block that could not be parsed, when no result was found.
    pub malformed: Option<MalformedResult>,
    /// A stdout read failure. Fails the task even when a result was parsed.
    pub stream_error: Option<String>,
    pub elapsed: Duration,
    pub partials_relayed: u64,
    /// Partial updates or heartbeats that did not reach the control plane.
    pub connection_errors: u64,
    pub stderr_tail: Vec<String>,
}

impl ExecutionOutcome {
    /// The failure this outcome represents, or `None` when a result
    /// document is available for dispatch.
    pub fn failure(&self, settings: &MonitorSettings) -> Option<WorkerError> {
        match &self.termination {
            Termination::Cancelled => Some(WorkerError::Shutdown),
            Termination::TimedOutGlobal => {
                Some(WorkerError::GlobalTimeout(settings.global_timeout))
            }
            Termination::TimedOutIdle => Some(WorkerError::IdleTimeout(settings.idle_timeout)),
            Termination::Exited(exit_code) => {
                if let Some(reason) = &self.stream_error {
                    Some(WorkerError::StreamRead(reason.clone()))
                } else if self.result.is_some() {
                    None
                } else if let Some(malformed) = &self.malformed {
                    Some(WorkerError::MalformedResult(malformed.clone()))
                } else {
                    Some(WorkerError::NoResult {
                        exit_code: *exit_code,
                    })
                }
            }
        }
    }
}

#[derive(Default)]
struct Collected {
    result: Option<Value>,
    malformed: Option<MalformedResult>,
    stream_error: Option<String>,
    partials_relayed: u64,
    connection_errors: u64,
}

/// Drive one child process to completion.
///
/// On a timeout or shutdown the child is killed, and for timeouts a single
/// error [`PartialUpdate`] is relayed. Never fails: every problem ends up
/// in the returned [`ExecutionOutcome`].
pub async fn supervise<S: UpdateSink>(
    task: &Task,
    mut process: ProcessHandle,
    sink: &S,
    settings: &MonitorSettings,
    cancel: &CancellationToken,
) -> ExecutionOutcome {
    let task_id = task.task_id.as_str();
    let started_at = process.started_at();
    let mut parser = MarkerParser::new();
    let mut collected = Collected::default();
    let mut last_output = Instant::now();
    let mut last_heartbeat = Instant::now();

    let termination = loop {
        if cancel.is_cancelled() {
            tracing::warn!(task_id, "Shutdown requested, killing child process");
            process.kill().await;
            break Termination::Cancelled;
        }

        let now = Instant::now();
        if now.duration_since(started_at) >= settings.global_timeout {
            let error = WorkerError::GlobalTimeout(settings.global_timeout);
            tracing::error!(task_id, error = %error, "Global timeout expired, killing child process");
            process.kill().await;
            relay_timeout(task_id, &error, sink, &mut collected).await;
            break Termination::TimedOutGlobal;
        }
        if now.duration_since(last_output) >= settings.idle_timeout {
            let error = WorkerError::IdleTimeout(settings.idle_timeout);
            tracing::error!(task_id, error = %error, "Idle timeout expired, killing child process");
            process.kill().await;
            relay_timeout(task_id, &error, sink, &mut collected).await;
            break Termination::TimedOutIdle;
        }
        if now.duration_since(last_heartbeat) >= settings.heartbeat_interval {
            last_heartbeat = now;
            let liveness_deadline =
                (started_at + settings.global_timeout).min(last_output + settings.idle_timeout);
            let deadline = (now + settings.heartbeat_timeout).min(liveness_deadline);
            match tokio::time::timeout_at(deadline.into(), sink.heartbeat()).await {
                Ok(true) => {}
                Ok(false) => collected.connection_errors += 1,
                Err(_) => {
                    tracing::warn!(task_id, "Heartbeat timed out");
                    collected.connection_errors += 1;
                }
            }
        }

        log_stderr(task_id, process.streams.drain_stderr());

        match process.streams.next_stdout(settings.poll_interval).await {
            Some(StreamItem::Line(line)) => {
                last_output = Instant::now();
                if let Some(event) = parser.feed(&line) {
                    handle_event(task_id, event, sink, &mut collected).await;
                }
            }
            Some(StreamItem::Failed(reason)) => {
                tracing::warn!(task_id, error = %reason, "stdout read failed");
                collected.stream_error = Some(reason);
            }
            Some(StreamItem::Closed) => {
                if let Some(event) = parser.finish() {
                    handle_event(task_id, event, sink, &mut collected).await;
                }
                let exit_code = process.wait_with_grace(settings.exit_grace).await;
                break Termination::Exited(exit_code);
            }
            None => {}
        }
    };

    log_stderr(
        task_id,
        process.streams.drain_stderr_to_end(settings.exit_grace).await,
    );

    let elapsed = process.elapsed();
    tracing::info!(
        task_id,
        termination = ?termination,
        elapsed_secs = elapsed.as_secs(),
        partials = collected.partials_relayed,
        "Child process finished",
    );

    ExecutionOutcome {
        termination,
        result: collected.result,
        malformed: collected.malformed,
        stream_error: collected.stream_error,
        elapsed,
        partials_relayed: collected.partials_relayed,
        connection_errors: collected.connection_errors,
        stderr_tail: process.streams.stderr_tail(),
    }
}

async fn handle_event<S: UpdateSink>(
    task_id: &str,
    event: MarkerEvent,
    sink: &S,
    collected: &mut Collected,
) {
    match event {
        MarkerEvent::Line(line) => {
            tracing::info!(target: CHILD_LOG_TARGET, task_id, "{line}");
        }
        MarkerEvent::Partial(doc) => {
            let update = PartialUpdate::from_block(task_id, doc);
            tracing::debug!(task_id, stage = %update.stage, "Partial update");
            if sink.relay_partial(&update).await {
                collected.partials_relayed += 1;
            } else {
                collected.connection_errors += 1;
            }
        }
        MarkerEvent::Result(doc) => {
            tracing::info!(task_id, "Result block received");
            collected.result = Some(doc);
            collected.malformed = None;
        }
        MarkerEvent::Malformed(malformed) => match malformed.kind {
            BlockKind::Partial => {
                tracing::warn!(task_id, error = %malformed, "Skipping malformed partial block");
            }
            BlockKind::Result => {
                tracing::warn!(task_id, error = %malformed, "Malformed result block");
                if collected.result.is_none() {
                    collected.malformed = Some(malformed);
                }
            }
        },
        MarkerEvent::DuplicateResult => {
            tracing::warn!(task_id, "Ignoring additional result block");
        }
        MarkerEvent::StraySentinel(sentinel) => {
            tracing::warn!(task_id, sentinel = %sentinel, "Ignoring stray end sentinel");
        }
    }
}

async fn relay_timeout<S: UpdateSink>(
    task_id: &str,
    error: &WorkerError,
    sink: &S,
    collected: &mut Collected,
) {
    let update = PartialUpdate::error(task_id, "timeout", error.user_message());
    if !sink.relay_partial(&update).await {
        collected.connection_errors += 1;
    }
}

fn log_stderr(task_id: &str, lines: Vec<String>) {
    for line in lines {
        tracing::warn!(target: CHILD_LOG_TARGET, task_id, stream = "stderr", "{line}");
    }
}
