//! WebSocket endpoint: `GET /ws?token=<bearer>`.
//!
//! Authentication happens before any application frame flows; a bad
//! token is answered with close code 1008. Inbound frames are either
//! envelope wire dicts (distinguished by the `uam_version` field) or
//! `{type:"pong"}` control messages. Inbound envelopes run the same
//! ingress pipeline as REST — only the error rendering differs.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::Response;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::relay::auth::authenticate_token;
use crate::relay::ingress::process_envelope;
use crate::relay::routes::inbox::emit_drain_receipt;
use crate::relay::server::RelayState;
use crate::relay::storage::AgentRecord;

const POLICY_VIOLATION: u16 = 1008;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: String,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<RelayState>>,
    Query(query): Query<WsQuery>,
) -> Response {
    // Auth precedes accept: resolve the token before the upgrade
    // completes, and greet invalid callers only with a 1008 close.
    let agent = authenticate_token(&state, &query.token).await.ok();
    ws.on_upgrade(move |socket| async move {
        match agent {
            Some(agent) => {
                if state.spam_filter.is_blocked(&agent.address) {
                    close_with_policy(socket, "sender is blocked").await;
                    return;
                }
                handle_session(socket, state, agent).await;
            }
            None => close_with_policy(socket, "invalid token").await,
        }
    })
}

async fn close_with_policy(mut socket: WebSocket, reason: &str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: POLICY_VIOLATION,
            reason: Utf8Bytes::from(reason),
        })))
        .await;
}

async fn handle_session(mut socket: WebSocket, state: Arc<RelayState>, agent: AgentRecord) {
    let address = agent.address.clone();
    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
    state.manager.connect(&address, tx.clone()).await;
    info!(agent = %address, "websocket connected");

    // Drain stored offline messages before entering the live loop.
    if let Err(err) = drain_stored(&mut socket, &state, &address).await {
        debug!(agent = %address, "stored-message drain aborted: {err:#}");
    }

    loop {
        tokio::select! {
            frame = socket.recv() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        handle_text_frame(&mut socket, &state, &agent, text.as_str()).await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // binary frames ignored
                    Some(Err(err)) => {
                        debug!(agent = %address, "websocket recv error: {err}");
                        break;
                    }
                }
            }
            outbound = rx.recv() => {
                match outbound {
                    Some(frame) => {
                        let text = frame.to_string();
                        if socket.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    // Channel closed: a newer session displaced this one.
                    None => break,
                }
            }
        }
    }

    info!(agent = %address, "websocket disconnected");
    if let Err(err) = state.storage.update_agent_last_seen(&address).await {
        debug!(agent = %address, "failed to update last_seen: {err:#}");
    }
    state.manager.disconnect(&address, &tx).await;
}

async fn handle_text_frame(
    socket: &mut WebSocket,
    state: &Arc<RelayState>,
    agent: &AgentRecord,
    text: &str,
) {
    let Ok(raw) = serde_json::from_str::<Value>(text) else {
        send_json(
            socket,
            &json!({"error": "bad_request", "detail": "frame is not JSON"}),
        )
        .await;
        return;
    };

    // Heartbeat control frame.
    if raw.get("type").and_then(Value::as_str) == Some("pong") {
        return;
    }

    // Envelope frames carry uam_version; everything else is unknown.
    if raw.get("uam_version").is_none() {
        let msg_type = raw
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("<missing>");
        warn!(agent = %agent.address, msg_type, "unknown websocket frame type");
        send_json(
            socket,
            &json!({
                "error": "bad_request",
                "detail": format!("unrecognized message type: {msg_type}"),
            }),
        )
        .await;
        return;
    }

    match process_envelope(state, agent, &raw).await {
        Ok(outcome) => {
            // Ack always precedes any receipt frame for this envelope.
            send_json(
                socket,
                &json!({
                    "type": "ack",
                    "message_id": outcome.message_id,
                    "delivered": outcome.delivered,
                }),
            )
            .await;
        }
        Err(err) => {
            send_json(socket, &err.ws_frame()).await;
        }
    }
}

async fn drain_stored(
    socket: &mut WebSocket,
    state: &Arc<RelayState>,
    address: &str,
) -> anyhow::Result<()> {
    let stored = state.storage.get_stored_messages(address, 100).await?;
    if stored.is_empty() {
        return Ok(());
    }
    let mut delivered_ids = Vec::with_capacity(stored.len());
    for msg in stored {
        let text = msg.envelope.to_string();
        if socket.send(Message::Text(text.into())).await.is_err() {
            anyhow::bail!("socket closed during drain");
        }
        delivered_ids.push(msg.id);
        emit_drain_receipt(state, &msg.envelope, address).await;
    }
    state.storage.mark_messages_delivered(&delivered_ids).await?;
    info!(agent = %address, count = delivered_ids.len(), "delivered stored messages");
    Ok(())
}

async fn send_json(socket: &mut WebSocket, value: &Value) {
    let _ = socket.send(Message::Text(value.to_string().into())).await;
}
