use std::time::Duration;

use taskrelay_core::marker::MalformedResult;
use taskrelay_core::sanitize::ErrorCategory;
use taskrelay_transport::TransportError;

/// Everything that can go wrong while acquiring or executing a task.
///
/// Only [`WorkerError::RegistrationFailure`] is fatal. The others end the
/// current task (or fetch attempt) and the main loop keeps running. The
/// `Display` text is for logs; the control plane only ever sees
/// [`WorkerError::user_message`].
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Registration failed: {0}")]
    RegistrationFailure(#[source] TransportError),

    #[error("Task fetch failed: {0}")]
    TaskFetch(#[source] TransportError),

    #[error("Failed to launch {executable}: {source}")]
    ProcessLaunch {
        executable: String,
        #[source]
        source: std::io::Error,
    },

    #[error("No executable configured for task kind {0}")]
    NoExecutable(String),

    #[error("Stream read error: {0}")]
    StreamRead(String),

    #[error("Task timed out after {}s", .0.as_secs())]
    GlobalTimeout(Duration),

    #[error("Process not responding for {}s", .0.as_secs())]
    IdleTimeout(Duration),

    #[error(transparent)]
    MalformedResult(#[from] MalformedResult),

    #[error("Process exited without a result block (exit code {exit_code:?})")]
    NoResult { exit_code: Option<i32> },

    #[error("Result post-processing failed: {0}")]
    PostProcessing(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Worker is shutting down")]
    Shutdown,
}

impl WorkerError {
    /// The sanitizer category for this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::GlobalTimeout(_) | Self::IdleTimeout(_) => ErrorCategory::Timeout,
            Self::RegistrationFailure(_) | Self::TaskFetch(_) | Self::Transport(_) => {
                ErrorCategory::Connectivity
            }
            Self::ProcessLaunch { source, .. }
                if source.kind() == std::io::ErrorKind::PermissionDenied =>
            {
                ErrorCategory::Permissions
            }
            Self::MalformedResult(_) => ErrorCategory::Encoding,
            Self::StreamRead(reason) => match ErrorCategory::classify(reason) {
                ErrorCategory::Unexpected => ErrorCategory::Encoding,
                other => other,
            },
            Self::ProcessLaunch { .. }
            | Self::NoExecutable(_)
            | Self::NoResult { .. }
            | Self::PostProcessing(_)
            | Self::Shutdown => ErrorCategory::Unexpected,
        }
    }

    /// Fixed human-readable message that is safe to relay.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::IdleTimeout(_) => "The automation process stopped responding",
            Self::Shutdown => "The worker shut down before the task finished",
            other => other.category().user_message(),
        }
    }

    /// Whether the failure originated in the child process rather than in
    /// the worker or the network.
    pub fn is_child_failure(&self) -> bool {
        matches!(
            self,
            Self::ProcessLaunch { .. }
                | Self::StreamRead(_)
                | Self::GlobalTimeout(_)
                | Self::IdleTimeout(_)
                | Self::MalformedResult(_)
                | Self::NoResult { .. }
                | Self::PostProcessing(_)
        )
    }
}
