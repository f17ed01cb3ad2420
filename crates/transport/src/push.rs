//! Persistent push channel to the control plane.
//!
//! One long-lived WebSocket per worker. The server uses it to announce new
//! tasks; the worker uses it as the fast path for partial updates. The
//! connection runs in its own task (connect -> session -> fixed-delay
//! reconnect) and talks to the rest of the worker only through channels:
//!
//! - notifications flow out through an `mpsc` receiver,
//! - outgoing frames flow in through [`PushHandle`], each acknowledged with
//!   a `oneshot` once written (or refused),
//! - connection state is published on a `watch` channel.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::api::API_KEY_HEADER;
use crate::error::TransportError;
use crate::messages::{self, PushMessage};

/// Capacity of the notification and outgoing-frame channels.
const CHANNEL_CAPACITY: usize = 32;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection parameters for the push channel.
#[derive(Debug, Clone)]
pub struct PushConfig {
    /// Full WebSocket URL, e.g. `ws://host:8000/ws/pin_send/worker-1`.
    pub url: String,
    pub worker_id: String,
    pub api_key: Option<String>,
    /// Fixed delay between reconnection attempts.
    pub reconnect_delay: Duration,
    /// How long a sender waits for a frame to be written.
    pub ack_timeout: Duration,
}

/// Events surfaced to the task acquisition loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushNotification {
    NewTask { task_id: Option<String> },
}

struct Outgoing {
    frame: String,
    ack: oneshot::Sender<bool>,
}

/// Cloneable sending side of the push channel.
#[derive(Clone)]
pub struct PushHandle {
    outgoing: mpsc::Sender<Outgoing>,
    connected: watch::Receiver<bool>,
    ack_timeout: Duration,
}

impl PushHandle {
    /// Whether a WebSocket session is currently established.
    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Push a `partialData` object for `task_id`. Fails fast when
    /// disconnected; never retries.
    pub async fn send_partial_data(
        &self,
        task_id: &str,
        partial_data: &Value,
    ) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Push("not connected".to_string()));
        }

        let frame = messages::task_update_frame(task_id, partial_data)
            .map_err(|e| TransportError::Push(format!("frame encoding failed: {e}")))?;
        let (ack_tx, ack_rx) = oneshot::channel();

        self.outgoing
            .try_send(Outgoing { frame, ack: ack_tx })
            .map_err(|e| TransportError::Push(format!("outgoing queue unavailable: {e}")))?;

        match tokio::time::timeout(self.ack_timeout, ack_rx).await {
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => Err(TransportError::Push("frame was not written".to_string())),
            Ok(Err(_)) => Err(TransportError::Push("session dropped the frame".to_string())),
            Err(_) => Err(TransportError::Push(format!(
                "no write acknowledgement within {}ms",
                self.ack_timeout.as_millis()
            ))),
        }
    }
}

/// Spawn the push-channel task.
///
/// Returns the sending handle, the notification receiver, and the task's
/// join handle. The task runs until `cancel` fires.
pub fn spawn(
    config: PushConfig,
    cancel: CancellationToken,
) -> (
    PushHandle,
    mpsc::Receiver<PushNotification>,
    tokio::task::JoinHandle<()>,
) {
    let (notify_tx, notify_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (outgoing_tx, outgoing_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (connected_tx, connected_rx) = watch::channel(false);

    let handle = PushHandle {
        outgoing: outgoing_tx,
        connected: connected_rx,
        ack_timeout: config.ack_timeout,
    };

    let task = tokio::spawn(async move {
        run(config, notify_tx, outgoing_rx, connected_tx, cancel).await;
    });

    (handle, notify_rx, task)
}

/// Connect -> session -> reconnect loop. Never returns until cancelled.
async fn run(
    config: PushConfig,
    notify_tx: mpsc::Sender<PushNotification>,
    mut outgoing_rx: mpsc::Receiver<Outgoing>,
    connected_tx: watch::Sender<bool>,
    cancel: CancellationToken,
) {
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        tracing::info!(url = %config.url, attempt, "Connecting push channel");

        let connected = tokio::select! {
            _ = cancel.cancelled() => return,
            result = connect(&config) => result,
        };

        match connected {
            Ok(ws_stream) => {
                attempt = 0;
                tracing::info!("Push channel connected");
                let _ = connected_tx.send(true);
                run_session(ws_stream, &config, &notify_tx, &mut outgoing_rx, &cancel).await;
                let _ = connected_tx.send(false);
                tracing::warn!("Push channel session ended");
            }
            Err(e) => {
                tracing::warn!(error = %e, "Push channel connection failed");
            }
        }

        if cancel.is_cancelled() {
            return;
        }

        // Wait before reconnecting. Frames queued meanwhile are refused so
        // their senders fall back to HTTP immediately.
        let sleep = tokio::time::sleep(config.reconnect_delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = &mut sleep => break,
                Some(out) = outgoing_rx.recv() => {
                    let _ = out.ack.send(false);
                }
            }
        }
    }
}

async fn connect(config: &PushConfig) -> Result<WsStream, TransportError> {
    let mut request = config
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| TransportError::Push(format!("invalid push URL: {e}")))?;

    if let Some(key) = &config.api_key {
        let value = HeaderValue::from_str(key)
            .map_err(|e| TransportError::Push(format!("invalid API key header: {e}")))?;
        request.headers_mut().insert(API_KEY_HEADER, value);
    }

    let (ws_stream, _response) = connect_async(request)
        .await
        .map_err(|e| TransportError::Push(format!("connect to {} failed: {e}", config.url)))?;
    Ok(ws_stream)
}

/// Drive a single WebSocket session: forward outgoing frames and dispatch
/// incoming messages via `tokio::select!`.
async fn run_session(
    ws_stream: WsStream,
    config: &PushConfig,
    notify_tx: &mpsc::Sender<PushNotification>,
    outgoing_rx: &mut mpsc::Receiver<Outgoing>,
    cancel: &CancellationToken,
) {
    let (mut sink, mut stream) = ws_stream.split();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            Some(out) = outgoing_rx.recv() => {
                let written = sink.send(Message::Text(out.frame)).await;
                let ok = written.is_ok();
                let _ = out.ack.send(ok);
                if let Err(e) = written {
                    tracing::error!(error = %e, "Failed to write push frame");
                    break;
                }
            }
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(e) = handle_incoming(&mut sink, config, notify_tx, &text).await {
                            tracing::error!(error = %e, "Failed to answer push message");
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                        // Handled automatically by tungstenite.
                    }
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!(?frame, "Control plane closed push channel");
                        break;
                    }
                    Some(Ok(_)) => {
                        // Binary / Frame -- ignore.
                    }
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "Push channel receive error");
                        break;
                    }
                    None => {
                        tracing::info!("Push channel stream exhausted");
                        break;
                    }
                }
            }
        }
    }
}

/// Parse and dispatch an incoming text frame.
async fn handle_incoming<S>(
    sink: &mut S,
    config: &PushConfig,
    notify_tx: &mpsc::Sender<PushNotification>,
    text: &str,
) -> Result<(), tokio_tungstenite::tungstenite::Error>
where
    S: SinkExt<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    match messages::parse_message(text) {
        Ok(PushMessage::NewTask { task_id }) => {
            tracing::debug!(task_id = ?task_id, "New task announced");
            // A full queue already holds a pending wake-up; dropping this
            // one loses nothing.
            let _ = notify_tx.try_send(PushNotification::NewTask { task_id });
        }
        Ok(PushMessage::Ping) => {
            if let Ok(frame) = messages::pong_frame(&config.worker_id) {
                sink.send(Message::Text(frame)).await?;
            }
        }
        Ok(PushMessage::Registered { worker_id }) => {
            tracing::info!(worker_id = ?worker_id, "Push channel registered");
        }
        Err(e) => {
            tracing::warn!(error = %e, raw = %text, "Unknown or malformed push message");
        }
    }
    Ok(())
}
