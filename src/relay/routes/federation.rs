use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::HeaderMap;
use serde_json::Value;
use tracing::{info, warn};

use crate::protocol::envelope::from_wire_value;
use crate::relay::delivery::{DeliveryMethod, deliver_local};
use crate::relay::errors::ApiError;
use crate::relay::models::FederationDeliverResponse;
use crate::relay::server::RelayState;

/// `POST /api/v1/federation/deliver` — inbound relay-to-relay delivery.
///
/// The signature is verified over the raw body exactly as the peer
/// canonicalized it, before any reshaping into typed structs.
pub async fn federation_deliver(
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
    Json(raw_body): Json<Value>,
) -> Result<Json<FederationDeliverResponse>, ApiError> {
    let peer_domain = headers
        .get("X-UAM-Relay-Domain")
        .and_then(|value| value.to_str().ok())
        .map(str::to_lowercase)
        .ok_or_else(|| ApiError::unauthorized("missing X-UAM-Relay-Domain header"))?;
    let signature = headers
        .get("X-UAM-Relay-Signature")
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| ApiError::unauthorized("missing X-UAM-Relay-Signature header"))?;

    let request = state
        .federation
        .verify_inbound(
            &peer_domain,
            signature,
            &raw_body,
            state.settings.federation_max_hops,
        )
        .await?;

    let envelope = from_wire_value(&request.envelope)
        .map_err(|err| ApiError::invalid_envelope(err.to_string()))?;

    // Dedup across the federation boundary: an envelope replayed through
    // another path is acknowledged without re-delivery.
    let is_new = state
        .storage
        .record_message_id(&envelope.message_id, &envelope.from_address)
        .await?;
    if !is_new {
        return Ok(Json(FederationDeliverResponse {
            status: "duplicate",
        }));
    }

    let method = deliver_local(&state, &envelope, &request.envelope, envelope.expires.as_deref())
        .await?;
    let status = match method {
        DeliveryMethod::Stored => "stored",
        _ => "delivered",
    };

    if let Err(err) = state
        .storage
        .log_federation(
            &envelope.message_id,
            &peer_domain,
            &state.settings.relay_domain,
            "inbound",
            request.hop_count,
            status,
            None,
        )
        .await
    {
        warn!(peer = %peer_domain, "failed to log federation inbound: {err:#}");
    }
    info!(
        peer = %peer_domain,
        message_id = %envelope.message_id,
        status,
        "federation inbound accepted"
    );

    Ok(Json(FederationDeliverResponse { status }))
}
