//! Integration tests for the control-plane client, retry combinator, update
//! relay and push channel against an in-process fake server.

mod common;

use std::time::Duration;

use assert_matches::assert_matches;
use serde_json::json;
use taskrelay_core::task::{PartialUpdate, ResultStatus, TaskKind, TaskResult};
use taskrelay_transport::api::TaskDone;
use taskrelay_transport::backoff::BackoffConfig;
use taskrelay_transport::push::{self, PushConfig};
use taskrelay_transport::{
    retry, ControlPlaneApi, Delivery, PushNotification, RetryPolicy, TransportError, UpdateRelay,
};
use tokio_util::sync::CancellationToken;

use common::{FakeControlPlane, FakeState};

fn fast_retry(attempts: u32) -> RetryPolicy {
    RetryPolicy {
        attempts,
        backoff: BackoffConfig {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            multiplier: 2.0,
        },
    }
}

fn done(status: ResultStatus) -> TaskDone {
    TaskDone {
        worker_id: "w-1".to_string(),
        task_id: "t-1".to_string(),
        execution_time_seconds: 3,
        status,
    }
}

// ---------------------------------------------------------------------------
// Test: register
// ---------------------------------------------------------------------------

#[tokio::test]
async fn register_sends_kind_worker_and_api_key() {
    let server = FakeControlPlane::start(FakeState::default()).await;
    let api = ControlPlaneApi::new(server.http_url(), Some("secret".to_string()));

    let response = api.register(TaskKind::PinSend, "w-1").await.unwrap();

    assert_eq!(response.status, "ok");
    assert_eq!(response.worker_id.as_deref(), Some("w-1"));
    let state = server.state();
    assert_eq!(state.registrations, vec!["pin_send/w-1".to_string()]);
    assert_eq!(state.api_keys, vec![Some("secret".to_string())]);
}

#[tokio::test]
async fn register_server_error_surfaces_status() {
    let server = FakeControlPlane::start(FakeState {
        register_failures: 1,
        ..FakeState::default()
    })
    .await;
    let api = ControlPlaneApi::new(server.http_url(), None);

    let err = api.register(TaskKind::DebtLookup, "w-1").await.unwrap_err();
    assert_matches!(err, TransportError::Status { status: 500, .. });
}

#[tokio::test]
async fn register_recovers_through_retry() {
    let server = FakeControlPlane::start(FakeState {
        register_failures: 2,
        ..FakeState::default()
    })
    .await;
    let api = ControlPlaneApi::new(server.http_url(), None);
    let mut failures = 0;

    let result = retry(
        &fast_retry(5),
        "register",
        || api.register(TaskKind::DebtLookup, "w-1"),
        |_| failures += 1,
    )
    .await;

    assert!(result.is_ok());
    assert_eq!(failures, 2);
    assert_eq!(server.state().registrations.len(), 3);
}

#[tokio::test]
async fn unreachable_control_plane_is_a_request_error() {
    // Port 9 (discard) on localhost is closed in test environments.
    let api = ControlPlaneApi::new("http://127.0.0.1:9", None)
        .with_timeouts(Duration::from_millis(200), Duration::from_millis(200));
    let err = api.register(TaskKind::DebtLookup, "w-1").await.unwrap_err();
    assert_matches!(err, TransportError::Request(_));
}

// ---------------------------------------------------------------------------
// Test: get-task
// ---------------------------------------------------------------------------

#[tokio::test]
async fn get_task_returns_none_when_queue_is_empty() {
    let server = FakeControlPlane::start(FakeState::default()).await;
    let api = ControlPlaneApi::new(server.http_url(), None);

    let task = api.get_task("w-1", TaskKind::DebtLookup).await.unwrap();

    assert!(task.is_none());
    assert_eq!(
        server.state().fetches,
        vec![json!({"workerId": "w-1", "kind": "debt_lookup"})]
    );
}

#[tokio::test]
async fn get_task_decodes_task() {
    let server = FakeControlPlane::start(FakeState {
        tasks: [json!({
            "task_id": "t-7",
            "kind": "movement_lookup",
            "subject": "1234567",
            "adminMode": true
        })]
        .into(),
        ..FakeState::default()
    })
    .await;
    let api = ControlPlaneApi::new(server.http_url(), None);

    let task = api
        .get_task("w-1", TaskKind::MovementLookup)
        .await
        .unwrap()
        .expect("a task");

    assert_eq!(task.task_id, "t-7");
    assert_eq!(task.kind, TaskKind::MovementLookup);
    assert!(task.admin_mode);
}

#[tokio::test]
async fn get_task_with_undecodable_task_is_decode_error() {
    let server = FakeControlPlane::start(FakeState {
        tasks: [json!({"task_id": "t-8", "kind": "scraping"})].into(),
        ..FakeState::default()
    })
    .await;
    let api = ControlPlaneApi::new(server.http_url(), None);

    let err = api.get_task("w-1", TaskKind::DebtLookup).await.unwrap_err();
    assert_matches!(err, TransportError::Decode(_));
}

// ---------------------------------------------------------------------------
// Test: task-done
// ---------------------------------------------------------------------------

#[tokio::test]
async fn task_done_posts_camel_case_body() {
    let server = FakeControlPlane::start(FakeState::default()).await;
    let api = ControlPlaneApi::new(server.http_url(), None);

    api.task_done(&done(ResultStatus::Completed)).await.unwrap();

    assert_eq!(
        server.state().done,
        vec![json!({
            "workerId": "w-1",
            "taskId": "t-1",
            "executionTimeSeconds": 3,
            "status": "completed"
        })]
    );
}

#[tokio::test]
async fn task_done_404_is_success_and_not_retried() {
    let server = FakeControlPlane::start(FakeState {
        done_status: Some(404),
        ..FakeState::default()
    })
    .await;
    let api = ControlPlaneApi::new(server.http_url(), None);
    let body = done(ResultStatus::Error);
    let mut failures = 0;

    let result = retry(
        &fast_retry(5),
        "task-done",
        || api.task_done(&body),
        |_| failures += 1,
    )
    .await;

    assert!(result.is_ok());
    assert_eq!(failures, 0);
    assert_eq!(server.state().done.len(), 1);
}

#[tokio::test]
async fn task_done_500_is_retried_until_exhausted() {
    let server = FakeControlPlane::start(FakeState {
        done_status: Some(500),
        ..FakeState::default()
    })
    .await;
    let api = ControlPlaneApi::new(server.http_url(), None);
    let body = done(ResultStatus::Completed);

    let result = retry(&fast_retry(3), "task-done", || api.task_done(&body), |_| {}).await;

    assert_matches!(result, Err(TransportError::Status { status: 500, .. }));
    assert_eq!(server.state().done.len(), 3);
}

// ---------------------------------------------------------------------------
// Test: update relay
// ---------------------------------------------------------------------------

#[tokio::test]
async fn relay_without_push_uses_http_once() {
    let server = FakeControlPlane::start(FakeState::default()).await;
    let relay = UpdateRelay::new(ControlPlaneApi::new(server.http_url(), None), None);

    let delivery = relay
        .relay_partial(&PartialUpdate::running("t-1", "login", "Logged in"))
        .await;

    assert_eq!(delivery, Delivery::Http);
    assert_eq!(
        server.state().updates,
        vec![json!({
            "taskId": "t-1",
            "partialData": {"stage": "login", "message": "Logged in", "status": "running"}
        })]
    );
}

#[tokio::test]
async fn relay_drops_update_when_http_fails() {
    let server = FakeControlPlane::start(FakeState {
        update_status: Some(503),
        ..FakeState::default()
    })
    .await;
    let relay = UpdateRelay::new(ControlPlaneApi::new(server.http_url(), None), None);

    let delivery = relay
        .relay_partial(&PartialUpdate::running("t-1", "login", "Logged in"))
        .await;

    assert_eq!(delivery, Delivery::Dropped);
    assert!(!delivery.is_delivered());
    // No retry loop for partial updates.
    assert_eq!(server.state().updates.len(), 1);
}

#[tokio::test]
async fn relay_result_sends_terminal_partial_data() {
    let server = FakeControlPlane::start(FakeState::default()).await;
    let relay = UpdateRelay::new(ControlPlaneApi::new(server.http_url(), None), None);
    let mut payload = serde_json::Map::new();
    payload.insert("total".to_string(), json!(120));

    let delivery = relay
        .relay_result(&TaskResult {
            task_id: "t-1".to_string(),
            status: ResultStatus::Completed,
            payload,
            execution_time_seconds: 9,
        })
        .await;

    assert_eq!(delivery, Delivery::Http);
    let state = server.state();
    let update = &state.updates[0];
    assert_eq!(update["partialData"]["status"], "completed");
    assert_eq!(update["partialData"]["executionTimeSeconds"], 9);
    assert_eq!(update["partialData"]["total"], 120);
}

// ---------------------------------------------------------------------------
// Test: push channel
// ---------------------------------------------------------------------------

async fn wait_connected(handle: &taskrelay_transport::PushHandle) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !handle.is_connected() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("push channel should connect");
}

#[tokio::test]
async fn push_channel_delivers_notification_and_updates() {
    let server = FakeControlPlane::start(FakeState {
        announce_on_connect: true,
        ..FakeState::default()
    })
    .await;
    let cancel = CancellationToken::new();
    let (handle, mut notifications, task) = push::spawn(
        PushConfig {
            url: server.ws_url("debt_lookup", "w-1"),
            worker_id: "w-1".to_string(),
            api_key: None,
            reconnect_delay: Duration::from_millis(50),
            ack_timeout: Duration::from_secs(1),
        },
        cancel.clone(),
    );

    let notification = tokio::time::timeout(Duration::from_secs(5), notifications.recv())
        .await
        .expect("notification in time");
    assert_eq!(notification, Some(PushNotification::NewTask { task_id: None }));

    wait_connected(&handle).await;
    let relay = UpdateRelay::new(ControlPlaneApi::new(server.http_url(), None), Some(handle));
    let delivery = relay
        .relay_partial(&PartialUpdate::running("t-1", "search", "Searching"))
        .await;
    assert_eq!(delivery, Delivery::Push);

    // The frame is written before the ack; give the server a moment to read it.
    tokio::time::timeout(Duration::from_secs(5), async {
        while server.state().push_frames.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("frame received");

    {
        let state = server.state();
        let frame = &state.push_frames[0];
        assert_eq!(frame["type"], "task_update");
        assert_eq!(frame["taskId"], "t-1");
        assert_eq!(frame["partialData"]["stage"], "search");
        assert!(state.updates.is_empty(), "HTTP path should not be used");
    }

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("push task stops on cancel")
        .unwrap();
}

#[tokio::test]
async fn disconnected_push_falls_back_to_http() {
    let server = FakeControlPlane::start(FakeState::default()).await;
    let cancel = CancellationToken::new();
    let (handle, _notifications, _task) = push::spawn(
        PushConfig {
            // Nothing listens here, so the channel never connects.
            url: "ws://127.0.0.1:9/ws/debt_lookup/w-1".to_string(),
            worker_id: "w-1".to_string(),
            api_key: None,
            reconnect_delay: Duration::from_secs(60),
            ack_timeout: Duration::from_millis(200),
        },
        cancel.clone(),
    );
    assert!(!handle.is_connected());

    let relay = UpdateRelay::new(ControlPlaneApi::new(server.http_url(), None), Some(handle));
    let delivery = relay
        .relay_partial(&PartialUpdate::running("t-1", "login", "Logged in"))
        .await;

    assert_eq!(delivery, Delivery::Http);
    assert_eq!(server.state().updates.len(), 1);
    cancel.cancel();
}
