//! Child process launch and lifecycle.
//!
//! [`Supervisor::launch`] resolves the executable for a task's kind,
//! applies the argument and environment contract, spawns the process with
//! both output streams piped into an [`OutputStreams`], and hands back a
//! [`ProcessHandle`] that owns the child until it is reaped.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use taskrelay_core::task::{Task, TaskKind};
use tokio::process::{Child, Command};

use crate::config::WorkerConfig;
use crate::error::WorkerError;
use crate::stream::OutputStreams;

/// Variables forced on every child so output is unbuffered UTF-8.
const CHILD_BASE_ENV: [(&str, &str); 4] = [
    ("PYTHONUNBUFFERED", "1"),
    ("PYTHONIOENCODING", "utf-8"),
    ("LANG", "C.UTF-8"),
    ("LC_ALL", "C.UTF-8"),
];

/// Worker credentials that must never leak into the child.
const STRIPPED_ENV: [&str; 1] = ["API_KEY"];

/// Resolved program and arguments for one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: PathBuf,
    pub args: Vec<String>,
}

/// Spawns one child process per task.
#[derive(Debug, Clone)]
pub struct Supervisor {
    executables: HashMap<TaskKind, PathBuf>,
    child_env: Vec<(String, String)>,
}

impl Supervisor {
    pub fn new(executables: HashMap<TaskKind, PathBuf>, child_env: Vec<(String, String)>) -> Self {
        Self {
            executables,
            child_env,
        }
    }

    pub fn from_config(config: &WorkerConfig) -> Self {
        Self::new(config.executables.clone(), config.child_env.clone())
    }

    /// `<executable> <subject> [<task-json>]`.
    pub fn command_line(&self, task: &Task) -> Result<CommandLine, WorkerError> {
        let program = self
            .executables
            .get(&task.kind)
            .cloned()
            .ok_or_else(|| WorkerError::NoExecutable(task.kind.to_string()))?;

        let mut args = vec![task.subject.clone()];
        if task.kind.passes_task_json() {
            let json = serde_json::to_string(task)
                .map_err(|e| WorkerError::PostProcessing(format!("task serialization: {e}")))?;
            args.push(json);
        }

        Ok(CommandLine { program, args })
    }

    /// Launch the child for `task`.
    ///
    /// Fails fast with [`WorkerError::ProcessLaunch`] when the executable is
    /// missing or not executable.
    pub async fn launch(&self, task: &Task) -> Result<ProcessHandle, WorkerError> {
        let command_line = self.command_line(task)?;
        check_executable(&command_line.program).await?;

        let mut cmd = Command::new(&command_line.program);
        cmd.args(&command_line.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for key in STRIPPED_ENV {
            cmd.env_remove(key);
        }
        for (key, value) in &self.child_env {
            cmd.env(key, value);
        }
        for (key, value) in CHILD_BASE_ENV {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|source| WorkerError::ProcessLaunch {
            executable: command_line.program.display().to_string(),
            source,
        })?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            let _ = child.start_kill();
            return Err(WorkerError::StreamRead(
                "child output pipes were not captured".to_string(),
            ));
        };

        tracing::info!(
            task_id = %task.task_id,
            kind = %task.kind,
            pid = child.id(),
            program = %command_line.program.display(),
            "Child process started",
        );

        Ok(ProcessHandle {
            child,
            streams: OutputStreams::spawn(stdout, stderr),
            started_at: Instant::now(),
        })
    }
}

async fn check_executable(program: &Path) -> Result<(), WorkerError> {
    let launch_error = |source| WorkerError::ProcessLaunch {
        executable: program.display().to_string(),
        source,
    };

    let metadata = tokio::fs::metadata(program).await.map_err(launch_error)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = metadata.permissions().mode();
        if !metadata.is_file() || mode & 0o111 == 0 {
            return Err(launch_error(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                format!("not an executable file (mode {mode:#o})"),
            )));
        }
    }
    #[cfg(not(unix))]
    {
        if !metadata.is_file() {
            return Err(launch_error(std::io::Error::from(
                std::io::ErrorKind::NotFound,
            )));
        }
    }

    Ok(())
}

/// A running child, its output queues and its start time.
#[derive(Debug)]
pub struct ProcessHandle {
    child: Child,
    pub streams: OutputStreams,
    started_at: Instant,
}

impl ProcessHandle {
    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Kill the child and reap it.
    pub async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            tracing::warn!(error = %e, "Failed to kill child process");
        }
    }

    /// Wait up to `grace` for the child to exit on its own, then kill it.
    ///
    /// Returns the exit code, `None` when killed or terminated by a signal.
    pub async fn wait_with_grace(&mut self, grace: Duration) -> Option<i32> {
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => status.code(),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Failed to wait for child process");
                None
            }
            Err(_) => {
                tracing::warn!(
                    grace_ms = grace.as_millis() as u64,
                    "Child did not exit after closing stdout, killing"
                );
                self.kill().await;
                None
            }
        }
    }
}
