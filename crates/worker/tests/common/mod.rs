//! Shared fixtures: an in-process fake control plane (axum) and helpers
//! for writing child scripts and building worker configs.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use axum::extract::{Path as UrlPath, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use taskrelay_core::task::TaskKind;
use taskrelay_transport::backoff::BackoffConfig;
use taskrelay_transport::RetryPolicy;
use taskrelay_worker::config::WorkerConfig;

#[derive(Debug, Default)]
pub struct FakeState {
    pub tasks: VecDeque<Value>,
    pub register_failures: u32,
    pub done_status: Option<u16>,

    pub registrations: u32,
    pub updates: Vec<Value>,
    pub done: Vec<Value>,
}

#[derive(Clone)]
pub struct FakeControlPlane {
    pub addr: SocketAddr,
    state: Arc<Mutex<FakeState>>,
}

impl FakeControlPlane {
    pub async fn start(state: FakeState) -> Self {
        let state = Arc::new(Mutex::new(state));
        let app = Router::new()
            .route("/register/{kind}/{worker_id}", post(register))
            .route("/get-task", post(get_task))
            .route("/task-update", post(task_update))
            .route("/task-done", post(task_done))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state }
    }

    pub fn with_task(task: Value) -> FakeState {
        FakeState {
            tasks: [task].into(),
            ..FakeState::default()
        }
    }

    pub fn http_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    /// `partialData` of every update for `task_id`, in arrival order.
    pub fn partials(&self, task_id: &str) -> Vec<Value> {
        self.state()
            .updates
            .iter()
            .filter(|u| u["taskId"] == task_id)
            .map(|u| u["partialData"].clone())
            .collect()
    }

    /// Wait until `done` holds at least `count` entries.
    pub async fn wait_for_done(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(20), async {
            while self.state().done.len() < count {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("task-done not reported in time");
    }

    /// Wait until at least `count` updates arrived.
    pub async fn wait_for_updates(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(20), async {
            while self.state().updates.len() < count {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("updates not received in time");
    }
}

type Shared = State<Arc<Mutex<FakeState>>>;

async fn register(
    State(state): Shared,
    UrlPath((kind, worker_id)): UrlPath<(String, String)>,
) -> Response {
    let mut state = state.lock().unwrap();
    state.registrations += 1;
    if state.register_failures > 0 {
        state.register_failures -= 1;
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    Json(json!({"status": "ok", "workerId": worker_id, "kind": kind})).into_response()
}

async fn get_task(State(state): Shared, Json(_body): Json<Value>) -> Response {
    let mut state = state.lock().unwrap();
    match state.tasks.pop_front() {
        Some(task) => Json(json!({"status": "ok", "task": task})).into_response(),
        None => Json(json!({"status": "empty"})).into_response(),
    }
}

async fn task_update(State(state): Shared, Json(body): Json<Value>) -> Response {
    state.lock().unwrap().updates.push(body);
    Json(json!({"status": "ok"})).into_response()
}

async fn task_done(State(state): Shared, Json(body): Json<Value>) -> Response {
    let mut state = state.lock().unwrap();
    state.done.push(body);
    match state.done_status {
        None => Json(json!({"status": "ok"})).into_response(),
        Some(code) => StatusCode::from_u16(code).unwrap().into_response(),
    }
}

/// Write an executable `/bin/sh` script into `dir`.
#[cfg(unix)]
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    {
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "#!/bin/sh").unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file.sync_all().unwrap();
    }
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Worker config pointed at `server`, push disabled, fast polling.
pub fn worker_config(server: &FakeControlPlane, kind: TaskKind, executable: &Path) -> WorkerConfig {
    let vars = [
        ("WORKER_ID".to_string(), "w-test".to_string()),
        ("WORKER_KIND".to_string(), kind.as_str().to_string()),
        ("CONTROL_PLANE_URL".to_string(), server.http_url()),
        (
            format!("EXECUTABLE_{}", kind.as_str().to_ascii_uppercase()),
            executable.display().to_string(),
        ),
        ("PUSH_ENABLED".to_string(), "false".to_string()),
        ("CHILD_ENV_PORTAL".to_string(), "demo".to_string()),
    ];
    let mut config = WorkerConfig::from_vars(vars).unwrap();
    config.poll_interval = Duration::from_millis(50);
    config
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        attempts: 3,
        backoff: BackoffConfig::fixed(Duration::from_millis(10)),
    }
}
