//! In-process fake control plane served with axum.
//!
//! Records every request it receives and answers according to a small set
//! of knobs, so tests can script failures and inspect what the client sent.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, post};
use axum::{Json, Router};
use serde_json::{json, Value};

#[derive(Debug, Default)]
pub struct FakeState {
    /// Tasks handed out by `get-task`, in order.
    pub tasks: VecDeque<Value>,
    /// Number of leading `register` calls answered with 500.
    pub register_failures: u32,
    /// Number of leading `get-task` calls answered with 500.
    pub fetch_failures: u32,
    /// Status code for `task-update`; `None` answers 200 `{status: ok}`.
    pub update_status: Option<u16>,
    /// Status code for `task-done`; `None` answers 200 `{status: ok}`.
    pub done_status: Option<u16>,
    /// Send `{type: new_task}` as soon as a push client connects.
    pub announce_on_connect: bool,

    pub registrations: Vec<String>,
    pub fetches: Vec<Value>,
    pub updates: Vec<Value>,
    pub done: Vec<Value>,
    pub push_frames: Vec<Value>,
    pub api_keys: Vec<Option<String>>,
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
            .route("/ws/{kind}/{worker_id}", any(push_upgrade))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state }
    }

    pub fn http_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn ws_url(&self, kind: &str, worker_id: &str) -> String {
        format!("ws://{}/ws/{kind}/{worker_id}", self.addr)
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }
}

type Shared = State<Arc<Mutex<FakeState>>>;

fn record_key(state: &mut FakeState, headers: &HeaderMap) {
    let key = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    state.api_keys.push(key);
}

fn status_or_ok(status: Option<u16>) -> Response {
    match status {
        None => Json(json!({"status": "ok"})).into_response(),
        Some(code) => {
            let code = StatusCode::from_u16(code).unwrap();
            (code, Json(json!({"status": "error"}))).into_response()
        }
    }
}

async fn register(
    State(state): Shared,
    headers: HeaderMap,
    Path((kind, worker_id)): Path<(String, String)>,
) -> Response {
    let mut state = state.lock().unwrap();
    record_key(&mut state, &headers);
    state.registrations.push(format!("{kind}/{worker_id}"));
    if state.register_failures > 0 {
        state.register_failures -= 1;
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    Json(json!({"status": "ok", "workerId": worker_id, "kind": kind})).into_response()
}

async fn get_task(State(state): Shared, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    let mut state = state.lock().unwrap();
    record_key(&mut state, &headers);
    state.fetches.push(body);
    if state.fetch_failures > 0 {
        state.fetch_failures -= 1;
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    match state.tasks.pop_front() {
        Some(task) => Json(json!({"status": "ok", "task": task})).into_response(),
        None => Json(json!({"status": "empty"})).into_response(),
    }
}

async fn task_update(State(state): Shared, Json(body): Json<Value>) -> Response {
    let mut state = state.lock().unwrap();
    state.updates.push(body);
    status_or_ok(state.update_status)
}

async fn task_done(State(state): Shared, Json(body): Json<Value>) -> Response {
    let mut state = state.lock().unwrap();
    state.done.push(body);
    status_or_ok(state.done_status)
}

async fn push_upgrade(State(state): Shared, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| push_session(socket, state))
}

async fn push_session(mut socket: WebSocket, state: Arc<Mutex<FakeState>>) {
    let announce = state.lock().unwrap().announce_on_connect;
    if announce {
        let frame = json!({"type": "new_task"}).to_string();
        if socket.send(Message::Text(frame.into())).await.is_err() {
            return;
        }
    }

    while let Some(Ok(msg)) = socket.recv().await {
        if let Message::Text(text) = msg {
            if let Ok(value) = serde_json::from_str::<Value>(text.as_str()) {
                state.lock().unwrap().push_frames.push(value);
            }
        }
    }
}
