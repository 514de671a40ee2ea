//! Three-tier delivery dispatch: live socket → webhook → store-and-forward,
//! with federation hand-off for remote recipients.

use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::protocol::address::domain_of;
use crate::protocol::envelope::MessageEnvelope;
use crate::protocol::types::{is_protocol_type, utc_timestamp};

use super::server::RelayState;

/// How an accepted envelope left the ingress pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMethod {
    Websocket,
    Webhook,
    Stored,
    Federated,
    FederationQueued,
}

impl DeliveryMethod {
    /// Whether the sender sees `delivered: true` for this outcome.
    pub fn delivered_flag(self) -> bool {
        !matches!(self, DeliveryMethod::Stored | DeliveryMethod::FederationQueued)
    }
}

/// The relay-to-sender delivery receipt. A relay control message: not
/// signed, not encrypted — the sender already trusts its own relay.
pub fn delivered_receipt(message_id: &str, to: &str) -> Value {
    json!({
        "type": "receipt.delivered",
        "message_id": message_id,
        "timestamp": utc_timestamp(),
        "to": to,
    })
}

/// Local tiers only: live socket, then webhook, then store. Used for
/// local recipients and for federated-inbound envelopes whose domain has
/// already been checked against ours.
pub async fn deliver_local(
    state: &RelayState,
    envelope: &MessageEnvelope,
    wire: &Value,
    expires: Option<&str>,
) -> anyhow::Result<DeliveryMethod> {
    // Tier 1: live socket.
    if state.manager.send_to(&envelope.to_address, wire.clone()).await {
        return Ok(DeliveryMethod::Websocket);
    }

    // Tier 2: webhook. True means a delivery task was scheduled; the
    // receipt for this tier is emitted by the webhook service on success.
    if state.webhook_service.try_deliver(&envelope.to_address, wire).await {
        return Ok(DeliveryMethod::Webhook);
    }

    // Tier 3: store-and-forward.
    state
        .storage
        .store_message(
            &envelope.from_address,
            &envelope.to_address,
            &wire.to_string(),
            expires,
        )
        .await?;
    debug!(to = %envelope.to_address, "stored for offline pickup");
    Ok(DeliveryMethod::Stored)
}

/// Full dispatch: local tiers first; when both live and webhook pass and
/// the recipient's domain is foreign, hand the envelope to federation
/// (queueing on failure) instead of storing it locally.
pub async fn deliver(
    state: &RelayState,
    envelope: &MessageEnvelope,
    wire: &Value,
    expires: Option<&str>,
) -> anyhow::Result<DeliveryMethod> {
    if state.manager.send_to(&envelope.to_address, wire.clone()).await {
        return Ok(DeliveryMethod::Websocket);
    }
    if state.webhook_service.try_deliver(&envelope.to_address, wire).await {
        return Ok(DeliveryMethod::Webhook);
    }

    let recipient_domain = domain_of(&envelope.to_address).unwrap_or("");
    if !recipient_domain.is_empty()
        && recipient_domain != state.settings.relay_domain
        && state.settings.federation_enabled
    {
        let result = state
            .federation
            .forward(wire, &state.settings.relay_domain, &[], 0)
            .await;
        if result.delivered {
            return Ok(DeliveryMethod::Federated);
        }
        warn!(
            domain = recipient_domain,
            error = result.error.as_deref().unwrap_or("unknown"),
            "federation forward failed, queueing for retry"
        );
        // Queued entries hold the pre-forward chain; the retry worker's
        // forward() call appends our own domain and bumps the hop count.
        state
            .storage
            .enqueue_federation(
                recipient_domain,
                wire,
                &[],
                0,
                super::federation::RETRY_SCHEDULE_SECONDS[0],
            )
            .await?;
        return Ok(DeliveryMethod::FederationQueued);
    }

    state
        .storage
        .store_message(
            &envelope.from_address,
            &envelope.to_address,
            &wire.to_string(),
            expires,
        )
        .await?;
    Ok(DeliveryMethod::Stored)
}

/// Emit `receipt.delivered` to the sender's live session for a
/// successfully delivered user envelope. Protocol traffic (receipts,
/// handshakes, sessions) never generates receipts.
pub async fn emit_delivered_receipt(state: &RelayState, envelope: &MessageEnvelope) {
    if is_protocol_type(&envelope.message_type) {
        return;
    }
    let receipt = delivered_receipt(&envelope.message_id, &envelope.to_address);
    state.manager.send_to(&envelope.from_address, receipt).await;
}
