use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use crate::protocol::types::is_protocol_type;
use crate::relay::auth::authenticate;
use crate::relay::delivery::delivered_receipt;
use crate::relay::errors::ApiError;
use crate::relay::models::InboxResponse;
use crate::relay::server::RelayState;

#[derive(Debug, Deserialize)]
pub struct InboxQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

/// `GET /api/v1/inbox/{address}` — drain stored messages for the
/// authenticated agent, FIFO. Each drained non-receipt envelope earns the
/// original sender a `receipt.delivered` on its live session.
pub async fn inbox(
    State(state): State<Arc<RelayState>>,
    Path(address): Path<String>,
    Query(query): Query<InboxQuery>,
    headers: HeaderMap,
) -> Result<Json<InboxResponse>, ApiError> {
    let agent = authenticate(&state, &headers).await?;
    if agent.address != address {
        return Err(ApiError::forbidden(format!(
            "token does not own inbox for {address}"
        )));
    }

    let stored = state
        .storage
        .get_stored_messages(&address, query.limit.min(200))
        .await?;
    if stored.is_empty() {
        return Ok(Json(InboxResponse {
            messages: vec![],
            count: 0,
        }));
    }

    let ids: Vec<i64> = stored.iter().map(|msg| msg.id).collect();
    state.storage.mark_messages_delivered(&ids).await?;
    state.storage.update_agent_last_seen(&address).await?;

    let mut messages = Vec::with_capacity(stored.len());
    for msg in stored {
        emit_drain_receipt(&state, &msg.envelope, &address).await;
        messages.push(msg.envelope);
    }
    info!(agent = %address, count = messages.len(), "drained stored messages");

    Ok(Json(InboxResponse {
        count: messages.len(),
        messages,
    }))
}

/// `receipt.delivered` back to the sender of a drained envelope,
/// anti-loop guarded against all protocol traffic.
pub(crate) async fn emit_drain_receipt(state: &RelayState, envelope: &Value, recipient: &str) {
    let msg_type = envelope.get("type").and_then(Value::as_str).unwrap_or("");
    if is_protocol_type(msg_type) {
        return;
    }
    let Some(original_from) = envelope.get("from").and_then(Value::as_str) else {
        return;
    };
    let message_id = envelope
        .get("message_id")
        .and_then(Value::as_str)
        .unwrap_or("");
    state
        .manager
        .send_to(original_from, delivered_receipt(message_id, recipient))
        .await;
}
