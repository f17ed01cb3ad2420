use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use taskrelay_core::error::CoreError;
use taskrelay_core::task::TaskKind;

use crate::monitor::MonitorSettings;

/// Prefix of variables forwarded to the child with the prefix stripped.
pub const CHILD_ENV_PREFIX: &str = "CHILD_ENV_";

/// Default `RUST_LOG` filter.
pub const DEFAULT_LOG_FILTER: &str = "taskrelay_worker=info,taskrelay_transport=info";

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    /// Read `LOG_FORMAT`. Anything other than `json` means text.
    pub fn from_env() -> Self {
        Self::parse(std::env::var("LOG_FORMAT").ok().as_deref())
    }

    fn parse(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            Some("json") => Self::Json,
            _ => Self::Text,
        }
    }
}

/// Worker configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    /// The single task kind this worker executes.
    pub kind: TaskKind,
    /// Base URL of the control-plane HTTP API.
    pub control_plane_url: String,
    /// Base URL of the push endpoint (`ws://` or `wss://`).
    pub push_base_url: String,
    pub api_key: Option<String>,
    pub executables: HashMap<TaskKind, PathBuf>,
    pub poll_interval: Duration,
    pub register_interval: Duration,
    pub heartbeat_interval: Duration,
    pub idle_timeout: Duration,
    pub task_timeouts: HashMap<TaskKind, Duration>,
    /// Deadline for task updates and heartbeats.
    pub http_timeout: Duration,
    /// Deadline for register / get-task / task-done requests.
    pub request_timeout: Duration,
    pub retry_attempts: u32,
    pub push_reconnect_delay: Duration,
    pub push_enabled: bool,
    /// Extra variables for the child process.
    pub child_env: Vec<(String, String)>,
}

impl WorkerConfig {
    /// Load configuration from the process environment.
    ///
    /// | Env Var                        | Default                               |
    /// |--------------------------------|---------------------------------------|
    /// | `WORKER_ID`                    | random UUID v4                        |
    /// | `WORKER_KIND`                  | required                              |
    /// | `CONTROL_PLANE_URL`            | required                              |
    /// | `PUSH_URL`                     | `CONTROL_PLANE_URL` with `ws(s)://`   |
    /// | `API_KEY`                      | none                                  |
    /// | `EXECUTABLE_<KIND>`            | required for `WORKER_KIND`            |
    /// | `POLL_INTERVAL_SECS`           | `5`                                   |
    /// | `REGISTER_INTERVAL_SECS`       | `60`                                  |
    /// | `HEARTBEAT_INTERVAL_SECS`      | `30`                                  |
    /// | `IDLE_TIMEOUT_SECS`            | `1200`                                |
    /// | `TIMEOUT_<KIND>_SECS`          | `1800` lookups, `120` PIN send        |
    /// | `HTTP_TIMEOUT_SECS`            | `5`                                   |
    /// | `REQUEST_TIMEOUT_SECS`         | `30`                                  |
    /// | `RETRY_ATTEMPTS`               | `5`                                   |
    /// | `PUSH_RECONNECT_SECS`          | `5`                                   |
    /// | `PUSH_ENABLED`                 | `true`                                |
    /// | `CHILD_ENV_<NAME>`             | forwarded to the child as `<NAME>`    |
    ///
    /// `LOG_FORMAT` and `RUST_LOG` are read separately, before logging is
    /// initialised.
    pub fn from_env() -> Result<Self, CoreError> {
        Self::from_vars(std::env::vars())
    }

    /// Build a configuration from an explicit set of variables.
    pub fn from_vars(vars: impl IntoIterator<Item = (String, String)>) -> Result<Self, CoreError> {
        let vars: HashMap<String, String> = vars
            .into_iter()
            .filter(|(_, v)| !v.trim().is_empty())
            .collect();
        let get = |name: &str| vars.get(name).map(|v| v.trim().to_string());

        let kind: TaskKind = get("WORKER_KIND")
            .ok_or_else(|| CoreError::Validation("WORKER_KIND is required".to_string()))?
            .parse()?;

        let control_plane_url = get("CONTROL_PLANE_URL")
            .ok_or_else(|| CoreError::Validation("CONTROL_PLANE_URL is required".to_string()))?
            .trim_end_matches('/')
            .to_string();
        if !(control_plane_url.starts_with("http://") || control_plane_url.starts_with("https://"))
        {
            return Err(CoreError::Validation(format!(
                "CONTROL_PLANE_URL must be an http(s) URL, got {control_plane_url}"
            )));
        }

        let push_base_url = match get("PUSH_URL") {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => derive_push_url(&control_plane_url)?,
        };

        let mut executables = HashMap::new();
        let mut task_timeouts = HashMap::new();
        for k in TaskKind::ALL {
            let suffix = k.as_str().to_ascii_uppercase();
            if let Some(path) = get(&format!("EXECUTABLE_{suffix}")) {
                executables.insert(k, PathBuf::from(path));
            }
            let timeout = secs(&get, &format!("TIMEOUT_{suffix}_SECS"), default_timeout(k))?;
            task_timeouts.insert(k, timeout);
        }
        if !executables.contains_key(&kind) {
            return Err(CoreError::Validation(format!(
                "EXECUTABLE_{} is required for a {kind} worker",
                kind.as_str().to_ascii_uppercase()
            )));
        }

        let retry_attempts = match get("RETRY_ATTEMPTS") {
            Some(v) => v.parse::<u32>().map_err(|_| {
                CoreError::Validation(format!("RETRY_ATTEMPTS must be a valid u32, got {v}"))
            })?,
            None => 5,
        };

        let push_enabled = match get("PUSH_ENABLED") {
            Some(v) => parse_bool(&v).ok_or_else(|| {
                CoreError::Validation(format!("PUSH_ENABLED must be a boolean, got {v}"))
            })?,
            None => true,
        };

        let mut child_env: Vec<(String, String)> = vars
            .iter()
            .filter_map(|(key, value)| {
                key.strip_prefix(CHILD_ENV_PREFIX)
                    .filter(|name| !name.is_empty())
                    .map(|name| (name.to_string(), value.clone()))
            })
            .collect();
        child_env.sort();

        Ok(Self {
            worker_id: get("WORKER_ID").unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            kind,
            control_plane_url,
            push_base_url,
            api_key: get("API_KEY"),
            executables,
            poll_interval: secs(&get, "POLL_INTERVAL_SECS", 5)?,
            register_interval: secs(&get, "REGISTER_INTERVAL_SECS", 60)?,
            heartbeat_interval: secs(&get, "HEARTBEAT_INTERVAL_SECS", 30)?,
            idle_timeout: secs(&get, "IDLE_TIMEOUT_SECS", 1200)?,
            task_timeouts,
            http_timeout: secs(&get, "HTTP_TIMEOUT_SECS", 5)?,
            request_timeout: secs(&get, "REQUEST_TIMEOUT_SECS", 30)?,
            retry_attempts,
            push_reconnect_delay: secs(&get, "PUSH_RECONNECT_SECS", 5)?,
            push_enabled,
            child_env,
        })
    }

    /// Full push-channel URL for this worker.
    pub fn push_channel_url(&self) -> String {
        format!("{}/ws/{}/{}", self.push_base_url, self.kind, self.worker_id)
    }

    /// Global timeout for tasks of `kind`.
    pub fn task_timeout(&self, kind: TaskKind) -> Duration {
        self.task_timeouts
            .get(&kind)
            .copied()
            .unwrap_or_else(|| Duration::from_secs(default_timeout(kind)))
    }

    /// Liveness settings for a task of `kind`.
    pub fn monitor_settings(&self, kind: TaskKind) -> MonitorSettings {
        MonitorSettings {
            global_timeout: self.task_timeout(kind),
            idle_timeout: self.idle_timeout,
            heartbeat_interval: self.heartbeat_interval,
            heartbeat_timeout: self.http_timeout,
            ..MonitorSettings::default()
        }
    }
}

fn default_timeout(kind: TaskKind) -> u64 {
    match kind {
        TaskKind::DebtLookup | TaskKind::MovementLookup => 1800,
        TaskKind::PinSend => 120,
    }
}

fn secs(
    get: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: u64,
) -> Result<Duration, CoreError> {
    let value = match get(name) {
        Some(v) => v
            .parse::<u64>()
            .map_err(|_| CoreError::Validation(format!("{name} must be a valid u64, got {v}")))?,
        None => default,
    };
    if value == 0 {
        return Err(CoreError::Validation(format!("{name} must be greater than zero")));
    }
    Ok(Duration::from_secs(value))
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// `http://host` -> `ws://host`, `https://host` -> `wss://host`.
fn derive_push_url(http_url: &str) -> Result<String, CoreError> {
    if let Some(rest) = http_url.strip_prefix("https://") {
        Ok(format!("wss://{rest}"))
    } else if let Some(rest) = http_url.strip_prefix("http://") {
        Ok(format!("ws://{rest}"))
    } else {
        Err(CoreError::Validation(format!(
            "Cannot derive a push URL from {http_url}"
        )))
    }
}
