//! Hybrid push/poll task acquisition.
//!
//! [`TaskSource::next`] waits on four things at once: shutdown, a push
//! notification, the poll timer and the registration timer. A notification
//! or a poll tick fetches a task (with retry); a registration tick sends
//! one liveness ping. Fetched tasks are validated and de-duplicated before
//! they are handed to the caller.

use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;

use taskrelay_core::task::{Task, TaskKind};
use taskrelay_transport::{retry, ControlPlaneApi, PushNotification, RetryPolicy, TransportError};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::WorkerError;
use crate::stats::WorkerStats;

/// Number of recently executed task IDs remembered for de-duplication.
pub const RECENT_TASKS: usize = 64;

/// The control-plane operations the acquisition loop needs.
pub trait TaskFeed: Send + Sync {
    /// Pull the next task, `None` when the queue is empty.
    fn fetch(&self) -> impl Future<Output = Result<Option<Task>, TransportError>> + Send;

    /// Send one registration / liveness ping.
    fn register(&self) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// [`TaskFeed`] backed by the HTTP API.
#[derive(Debug, Clone)]
pub struct ApiFeed {
    api: ControlPlaneApi,
    worker_id: String,
    kind: TaskKind,
}

impl ApiFeed {
    pub fn new(api: ControlPlaneApi, worker_id: impl Into<String>, kind: TaskKind) -> Self {
        Self {
            api,
            worker_id: worker_id.into(),
            kind,
        }
    }
}

impl TaskFeed for ApiFeed {
    async fn fetch(&self) -> Result<Option<Task>, TransportError> {
        self.api.get_task(&self.worker_id, self.kind).await
    }

    async fn register(&self) -> Result<(), TransportError> {
        self.api.register(self.kind, &self.worker_id).await.map(|_| ())
    }
}

/// Bounded memory of recently executed task IDs.
#[derive(Debug)]
pub struct RecentTasks {
    ids: VecDeque<String>,
    capacity: usize,
}

impl RecentTasks {
    pub fn new(capacity: usize) -> Self {
        Self {
            ids: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.ids.iter().any(|id| id == task_id)
    }

    /// Remember `task_id`. Returns `false` when it was already known.
    pub fn insert(&mut self, task_id: &str) -> bool {
        if self.contains(task_id) {
            return false;
        }
        if self.ids.len() == self.capacity {
            self.ids.pop_front();
        }
        self.ids.push_back(task_id.to_string());
        true
    }
}

/// Timers and retry policy for [`TaskSource`].
#[derive(Debug, Clone)]
pub struct AcquisitionSettings {
    pub poll_interval: Duration,
    pub register_interval: Duration,
    /// Upper bound on one registration ping.
    pub ping_timeout: Duration,
    pub retry: RetryPolicy,
}

#[derive(Debug)]
enum Trigger {
    Notified(PushNotification),
    Poll,
    Register,
}

/// Produces the tasks this worker should execute, one at a time.
pub struct TaskSource<F> {
    feed: F,
    kind: TaskKind,
    notifications: Option<mpsc::Receiver<PushNotification>>,
    poll: Interval,
    register: Interval,
    ping_timeout: Duration,
    retry: RetryPolicy,
    recent: RecentTasks,
}

impl<F: TaskFeed> TaskSource<F> {
    /// The first poll happens immediately; the first registration ping
    /// one interval from now (registration itself happens at startup).
    pub fn new(
        feed: F,
        kind: TaskKind,
        notifications: Option<mpsc::Receiver<PushNotification>>,
        settings: AcquisitionSettings,
    ) -> Self {
        let now = Instant::now();
        let mut poll = interval_at(now, settings.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut register =
            interval_at(now + settings.register_interval, settings.register_interval);
        register.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Self {
            feed,
            kind,
            notifications,
            poll,
            register,
            ping_timeout: settings.ping_timeout,
            retry: settings.retry,
            recent: RecentTasks::new(RECENT_TASKS),
        }
    }

    pub fn feed(&self) -> &F {
        &self.feed
    }

    /// Wait for the next valid, not-yet-executed task.
    ///
    /// Returns `None` once `cancel` fires.
    pub async fn next(
        &mut self,
        stats: &mut WorkerStats,
        cancel: &CancellationToken,
    ) -> Option<Task> {
        loop {
            let trigger = tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                Some(notification) = next_notification(&mut self.notifications) => {
                    Trigger::Notified(notification)
                }
                _ = self.register.tick() => Trigger::Register,
                _ = self.poll.tick() => Trigger::Poll,
            };

            match trigger {
                Trigger::Register => {
                    let request = tokio::time::timeout(self.ping_timeout, self.feed.register());
                    let ping = tokio::select! {
                        _ = cancel.cancelled() => return None,
                        ping = request => ping,
                    };
                    match ping {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            stats.record_connection_error();
                            tracing::warn!(error = %e, "Registration ping failed");
                        }
                        Err(_) => {
                            stats.record_connection_error();
                            tracing::warn!("Registration ping timed out");
                        }
                    }
                    continue;
                }
                Trigger::Notified(PushNotification::NewTask { task_id }) => {
                    tracing::debug!(task_id = ?task_id, "Fetching after push notification");
                    // A notification fetch stands in for the next poll.
                    self.poll.reset();
                }
                Trigger::Poll => {}
            }

            let fetched = tokio::select! {
                _ = cancel.cancelled() => return None,
                fetched = retry(
                    &self.retry,
                    "get-task",
                    || self.feed.fetch(),
                    |_| stats.record_connection_error(),
                ) => fetched,
            };

            let task = match fetched {
                Ok(Some(task)) => task,
                Ok(None) => continue,
                Err(e) => {
                    let error = WorkerError::TaskFetch(e);
                    tracing::warn!(error = %error, "Giving up on this fetch");
                    continue;
                }
            };

            if let Err(e) = task.validate_for(self.kind) {
                tracing::warn!(task_id = %task.task_id, error = %e, "Dropping invalid task");
                continue;
            }
            if !self.recent.insert(&task.task_id) {
                tracing::warn!(task_id = %task.task_id, "Dropping already executed task");
                continue;
            }

            return Some(task);
        }
    }
}

/// Receive from the push channel. Pends forever when push is disabled or
/// its channel has closed.
async fn next_notification(
    notifications: &mut Option<mpsc::Receiver<PushNotification>>,
) -> Option<PushNotification> {
    match notifications {
        Some(rx) => match rx.recv().await {
            Some(notification) => Some(notification),
            None => {
                *notifications = None;
                std::future::pending().await
            }
        },
        None => std::future::pending().await,
    }
}
