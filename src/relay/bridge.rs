//! Client ⇄ upstream bridge
//!
//! One bridge per accepted client. The client hears `connection.established`
//! before the upstream leg is dialed. Four pump tasks then move messages
//! unmodified between the legs; a shared cancellation token ends all of them
//! when either leg closes, so one leg never outlives the other.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::upstream::{UpstreamSocket, connect_upstream};
use super::{Grant, RelayState};
use crate::transport::events::{event_type, timestamp_ms};

const LEG_QUEUE: usize = 256;

/// Decrements the active session count when the bridge ends
struct BridgeGuard<'a> {
    active: &'a AtomicUsize,
}

impl<'a> BridgeGuard<'a> {
    fn new(active: &'a AtomicUsize) -> Self {
        active.fetch_add(1, Ordering::SeqCst);
        Self { active }
    }
}

impl Drop for BridgeGuard<'_> {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Relay one client for its lifetime
pub(super) async fn run(socket: WebSocket, grant: Grant, state: Arc<RelayState>) {
    let _guard = BridgeGuard::new(&state.active);
    let bridge_id = Uuid::new_v4();
    let ping_interval = state.config.ping_interval;

    let (mut client_tx, client_rx) = socket.split();

    let established = json!({
        "type": "connection.established",
        "time": timestamp_ms(),
    });
    if client_tx
        .send(Message::Text(established.to_string().into()))
        .await
        .is_err()
    {
        tracing::debug!(%bridge_id, "client left before establishment");
        return;
    }
    tracing::info!(%bridge_id, model = %grant.model, "client connected");

    let shutdown = CancellationToken::new();
    let (to_client, to_client_rx) = mpsc::channel(LEG_QUEUE);
    let (to_upstream, to_upstream_rx) = mpsc::channel(LEG_QUEUE);

    let client_writer = tokio::spawn(write_client(
        client_tx,
        to_client_rx,
        ping_interval,
        shutdown.clone(),
    ));
    let client_reader = tokio::spawn(read_client(
        bridge_id,
        client_rx,
        to_client.clone(),
        to_upstream,
        shutdown.clone(),
    ));

    let upstream = tokio::select! {
        () = shutdown.cancelled() => None,
        result = connect_upstream(
            &state.config.upstream_url,
            state.config.upstream_api_key.as_ref(),
            &grant,
        ) => match result {
            Ok(socket) => Some(socket),
            Err(e) => {
                tracing::warn!(%bridge_id, error = %e, "upstream unavailable");
                let event = json!({
                    "type": "error",
                    "error": { "code": "upstream_unavailable", "message": e.to_string() },
                });
                let _ = to_client.send(Message::Text(event.to_string().into())).await;
                shutdown.cancel();
                None
            }
        },
    };

    if let Some(socket) = upstream {
        let (upstream_tx, upstream_rx) = socket.split();
        let upstream_writer = tokio::spawn(write_upstream(
            upstream_tx,
            to_upstream_rx,
            ping_interval,
            shutdown.clone(),
        ));
        let upstream_reader = tokio::spawn(read_upstream(
            bridge_id,
            upstream_rx,
            to_client,
            shutdown.clone(),
        ));
        let _ = tokio::join!(upstream_writer, upstream_reader);
    } else {
        drop(to_client);
    }

    shutdown.cancel();
    let _ = tokio::join!(client_writer, client_reader);
    tracing::info!(%bridge_id, "client disconnected");
}

async fn write_client(
    mut sink: SplitSink<WebSocket, Message>,
    mut queue: mpsc::Receiver<Message>,
    ping_interval: Duration,
    shutdown: CancellationToken,
) {
    let mut keepalive = tokio::time::interval_at(
        tokio::time::Instant::now() + ping_interval,
        ping_interval,
    );

    loop {
        tokio::select! {
            biased;
            message = queue.recv() => {
                let Some(message) = message else { break };
                if sink.send(message).await.is_err() {
                    break;
                }
            }
            () = shutdown.cancelled() => break,
            _ = keepalive.tick() => {
                let ping = json!({ "type": "ping", "timestamp": timestamp_ms() });
                if sink.send(Message::Text(ping.to_string().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    shutdown.cancel();
    let _ = sink.send(Message::Close(None)).await;
    let _ = sink.close().await;
}

async fn read_client(
    bridge_id: Uuid,
    mut stream: SplitStream<WebSocket>,
    to_client: mpsc::Sender<Message>,
    to_upstream: mpsc::Sender<UpstreamMessage>,
    shutdown: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            () = shutdown.cancelled() => break,
            message = stream.next() => message,
        };

        let forward = match message {
            Some(Ok(Message::Text(text))) => {
                match event_type(text.as_str()).as_deref() {
                    Some("ping") => {
                        let pong = json!({ "type": "pong", "timestamp": timestamp_ms() });
                        let _ = to_client.send(Message::Text(pong.to_string().into())).await;
                        continue;
                    }
                    Some("pong") => {
                        tracing::trace!(%bridge_id, "client pong");
                        continue;
                    }
                    kind => tracing::trace!(%bridge_id, event_type = kind, "client -> upstream"),
                }
                UpstreamMessage::Text(text.as_str().to_owned().into())
            }
            Some(Ok(Message::Binary(bytes))) => {
                tracing::trace!(%bridge_id, bytes = bytes.len(), "client -> upstream audio");
                UpstreamMessage::Binary(bytes)
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Err(e)) => {
                tracing::debug!(%bridge_id, error = %e, "client socket error");
                break;
            }
        };

        if to_upstream.send(forward).await.is_err() {
            break;
        }
    }

    shutdown.cancel();
}

async fn write_upstream(
    mut sink: SplitSink<UpstreamSocket, UpstreamMessage>,
    mut queue: mpsc::Receiver<UpstreamMessage>,
    ping_interval: Duration,
    shutdown: CancellationToken,
) {
    let mut keepalive = tokio::time::interval_at(
        tokio::time::Instant::now() + ping_interval,
        ping_interval,
    );

    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            message = queue.recv() => {
                let Some(message) = message else { break };
                if sink.send(message).await.is_err() {
                    break;
                }
            }
            _ = keepalive.tick() => {
                if sink.send(UpstreamMessage::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    shutdown.cancel();
    let _ = sink.close().await;
}

async fn read_upstream(
    bridge_id: Uuid,
    mut stream: SplitStream<UpstreamSocket>,
    to_client: mpsc::Sender<Message>,
    shutdown: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            () = shutdown.cancelled() => break,
            message = stream.next() => message,
        };

        let forward = match message {
            Some(Ok(UpstreamMessage::Text(text))) => {
                tracing::trace!(
                    %bridge_id,
                    event_type = event_type(text.as_str()).as_deref(),
                    "upstream -> client"
                );
                Message::Text(text.as_str().to_owned().into())
            }
            Some(Ok(UpstreamMessage::Binary(bytes))) => Message::Binary(bytes),
            Some(Ok(UpstreamMessage::Close(_))) | None => {
                tracing::debug!(%bridge_id, "upstream closed");
                break;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                tracing::debug!(%bridge_id, error = %e, "upstream socket error");
                break;
            }
        };

        if to_client.send(forward).await.is_err() {
            break;
        }
    }

    shutdown.cancel();
}
