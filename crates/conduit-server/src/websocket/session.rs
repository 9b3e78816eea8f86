//! WebSocket session lifecycle: handles a single authenticated client from
//! upgrade through disconnect.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use conduit_protocol::constants::{FEATURES, PROTOCOL_VERSION};
use conduit_protocol::messages::{ConnectionAckPayload, RateLimits};
use conduit_protocol::{Envelope, MessageType};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use super::connection::ClientConnection;
use super::handler::handle_text;
use crate::auth::AuthContext;
use crate::registry::DisconnectReason;
use crate::server::AppState;

/// How long the outbound forwarder gets to flush a close frame.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Run a WebSocket session for an authenticated client.
///
/// 1. Registers the connection (closing with "try again later" at capacity)
/// 2. Queues `CONNECTION_ACK` with the caller's budgets
/// 3. Forwards the outbound queue to the socket, with periodic Ping frames
/// 4. Runs every inbound text frame through the message pipeline
/// 5. Removes the connection on disconnect, or closes the socket when the
///    registry removes it first
#[instrument(skip_all, fields(user_id = %auth.user_id, org_id = %auth.organization_id))]
pub async fn run_session(ws: WebSocket, state: AppState, auth: AuthContext) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (send_tx, mut send_rx) = mpsc::channel::<Arc<String>>(state.config.send_queue_capacity);

    let connection = match state.registry.add(&auth, send_tx).await {
        Ok(c) => c,
        Err(e) => {
            let frame = CloseFrame {
                code: close_code::AGAIN,
                reason: e.to_string().into(),
            };
            let _ = ws_tx.send(Message::Close(Some(frame))).await;
            return;
        }
    };

    if !send_ack(&state, &connection) {
        warn!(conn_id = %connection.id, "failed to queue connection ack");
    }

    // Spawn outbound forwarder with periodic Ping frames.
    let outbound_conn = connection.clone();
    let ping_every = state.config.ping_interval;
    let mut outbound = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(ping_every);
        // Skip the immediate first tick
        let _ = ping_interval.tick().await;

        loop {
            tokio::select! {
                msg = send_rx.recv() => {
                    match msg {
                        Some(text) => {
                            if ws_tx.send(Message::Text(String::clone(&text).into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
                () = outbound_conn.closed() => {
                    let frame = CloseFrame {
                        code: close_code::NORMAL,
                        reason: "connection closed by server".into(),
                    };
                    let _ = ws_tx.send(Message::Close(Some(frame))).await;
                    break;
                }
            }
        }
    });

    // Process incoming messages
    loop {
        let frame = tokio::select! {
            frame = ws_rx.next() => frame,
            () = connection.closed() => break,
        };
        let Some(Ok(msg)) = frame else { break };
        state.registry.record_activity(&connection, state.config.ping_interval).await;

        let text = match msg {
            Message::Text(t) => t.to_string(),
            Message::Binary(data) => match String::from_utf8(data.to_vec()) {
                Ok(s) => s,
                Err(_) => {
                    debug!(conn_id = %connection.id, len = data.len(), "ignoring non-UTF8 binary frame");
                    continue;
                }
            },
            Message::Close(_) => {
                info!(conn_id = %connection.id, "client sent close frame");
                break;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        handle_text(&state, &connection, &text).await;
    }

    // Clean up
    connection.close();
    if tokio::time::timeout(CLOSE_GRACE, &mut outbound).await.is_err() {
        outbound.abort();
    }
    let _ = state
        .registry
        .remove(connection.id.as_str(), DisconnectReason::ClientClosed)
        .await;
}

/// Queue the `CONNECTION_ACK` frame. It is the first frame the client sees.
fn send_ack(state: &AppState, connection: &ClientConnection) -> bool {
    let policy = connection.role.policy();
    let ack = ConnectionAckPayload {
        connection_id: connection.id.to_string(),
        protocol_version: PROTOCOL_VERSION.to_owned(),
        features: FEATURES.iter().map(|f| (*f).to_owned()).collect(),
        rate_limits: RateLimits::from(policy),
        max_payload_bytes: policy.max_payload_bytes,
        heartbeat_interval_secs: state.config.ping_interval.as_secs(),
    };
    let Ok(payload) = serde_json::to_value(&ack) else {
        return false;
    };
    let id = connection.id.as_str();
    let mut envelope = Envelope::new(MessageType::ConnectionAck, id, id, payload);
    if let Some(signer) = &state.signer {
        signer.sign(&mut envelope);
    }
    connection.send_envelope(&envelope)
}
