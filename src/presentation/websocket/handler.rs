//! WebSocket Connection Handler
//!
//! Accepts the upgrade, authenticates the client, registers the connection,
//! and runs the read loop. Outbound delivery runs on a separate write task
//! draining the connection's bounded queue, so one slow socket never blocks
//! frame routing.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::gateway::frames::{ClientFrame, ServerFrame};
use crate::gateway::registry::{ConnectionHandle, DisconnectCause};
use crate::domain::Topic;
use crate::shared::error::GatewayError;
use crate::startup::AppState;

/// How long to wait for the write task to drain on teardown.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    /// Bearer token authenticating the connection
    token: String,
    /// Client device tag, recorded per connection
    #[serde(default = "default_device")]
    device: String,
}

fn default_device() -> String {
    "web".to_string()
}

/// WebSocket upgrade endpoint for `/gateway`.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, params))
}

async fn handle_socket(socket: WebSocket, state: AppState, params: ConnectParams) {
    let identity = match state.authenticator.authenticate(&params.token).await {
        Ok(identity) => identity,
        Err(err) => {
            tracing::debug!(code = err.code(), "rejecting unauthenticated socket");
            reject(socket, err).await;
            return;
        }
    };

    let (outbound_tx, outbound_rx) = mpsc::channel(state.settings.gateway.write_queue_depth);
    let conn = ConnectionHandle::new(identity, params.device, outbound_tx);
    state.registry.register(conn.clone());
    state.bridge.subscribe_topic(Topic::Presence(conn.user_id()));

    let _ = conn.push(ServerFrame::Hello {
        heartbeat_interval_ms: state.settings.gateway.heartbeat_interval_ms,
    });
    let _ = conn.push(ServerFrame::Ready {
        session_id: conn.id(),
        user_id: conn.user_id(),
    });

    let (ws_tx, ws_rx) = socket.split();
    let writer = tokio::spawn(write_task(ws_tx, outbound_rx));

    let cause = read_loop(ws_rx, &state, &conn).await;
    if let Some(cause) = cause {
        state.bridge.drop_connection(&conn, cause);
    }

    // drop_connection took the queue sender, so the writer drains and exits.
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
        tracing::warn!(session_id = %conn.id(), "write task did not drain in time");
    }
}

/// Read frames off the socket until it closes or the connection is torn down
/// elsewhere. Returns the disconnect cause when this loop observed it first.
async fn read_loop(
    mut ws_rx: futures::stream::SplitStream<WebSocket>,
    state: &AppState,
    conn: &std::sync::Arc<ConnectionHandle>,
) -> Option<DisconnectCause> {
    loop {
        tokio::select! {
            // Torn down by another component (heartbeat timeout, overflow).
            _ = conn.closed() => return None,
            incoming = ws_rx.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ClientFrame>(text.as_str()) {
                        Ok(frame) => state.router.dispatch(conn, frame).await,
                        Err(err) => {
                            // A malformed frame is rejected; the connection
                            // stays up.
                            let error = GatewayError::InvalidFrame(err.to_string());
                            let _ = conn.push(ServerFrame::Error {
                                code: error.code(),
                                message: error.client_message(),
                            });
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => return Some(DisconnectCause::ClientClosed),
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    tracing::debug!(session_id = %conn.id(), error = %err, "socket read error");
                    return Some(DisconnectCause::TransportError);
                }
            },
        }
    }
}

/// Drain the outbound queue into the socket, then close it.
async fn write_task(
    mut ws_tx: futures::stream::SplitSink<WebSocket, Message>,
    mut outbound_rx: mpsc::Receiver<ServerFrame>,
) {
    while let Some(frame) = outbound_rx.recv().await {
        let json = match serde_json::to_string(&frame) {
            Ok(json) => json,
            Err(err) => {
                tracing::error!(error = %err, "unserializable outbound frame");
                continue;
            }
        };
        if ws_tx.send(Message::Text(json.into())).await.is_err() {
            break;
        }
    }
    let _ = ws_tx.send(Message::Close(None)).await;
}

/// Send a final error frame to an unauthenticated socket and close it.
async fn reject(mut socket: WebSocket, err: GatewayError) {
    let frame = ServerFrame::Error {
        code: err.code(),
        message: err.client_message(),
    };
    if let Ok(json) = serde_json::to_string(&frame) {
        let _ = socket.send(Message::Text(json.into())).await;
    }
    let _ = socket.send(Message::Close(None)).await;
}
