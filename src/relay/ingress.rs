//! The relay ingress pipeline, shared verbatim by the REST `send`
//! endpoint and the WebSocket inbound path. Ordered cheapest-first so an
//! attacker pays our CPU as late as possible; signature verification is
//! the last gate before dispatch.

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::Value;
use tracing::{debug, warn};

use crate::protocol::address::domain_of;
use crate::protocol::crypto::deserialize_verify_key;
use crate::protocol::envelope::{MessageEnvelope, from_wire_value, verify_envelope};
use crate::protocol::types::{is_receipt_type, parse_timestamp};

use super::delivery::{self, DeliveryMethod};
use super::errors::ApiError;
use super::server::RelayState;
use super::storage::AgentRecord;

/// Grace period for clock skew when checking expiry.
const EXPIRY_GRACE_SECONDS: i64 = 30;

/// The pipeline's verdict for one accepted envelope.
#[derive(Debug)]
pub struct SendOutcome {
    pub message_id: String,
    pub delivered: bool,
    /// Duplicate submissions are acknowledged as success without
    /// re-delivery (idempotent for the sender).
    pub duplicate: bool,
    pub envelope: Option<MessageEnvelope>,
}

/// Run steps 2–13 of the ingress pipeline for an authenticated sender.
/// (Step 1, bearer-token auth, happens at the surface.)
pub async fn process_envelope(
    state: &RelayState,
    agent: &AgentRecord,
    wire: &Value,
) -> Result<SendOutcome, ApiError> {
    // Receipt detection runs on the raw dict: receipts bypass rate limits
    // and the reputation floor even before full parsing.
    let raw_type = wire.get("type").and_then(Value::as_str).unwrap_or("");
    let is_receipt = is_receipt_type(raw_type);

    // Step 2: blocklist, O(1).
    if state.spam_filter.is_blocked(&agent.address) {
        return Err(ApiError::blocked("Sender is blocked"));
    }

    // Step 3: allowlist, O(1). Allowlisted senders skip reputation-driven
    // limits for the rest of the pipeline.
    let is_allowlisted = state.spam_filter.is_allowed(&agent.address);

    // Step 4: adaptive sender rate limit (receipts exempt).
    if !is_receipt {
        if is_allowlisted {
            if !state.sender_limiter.check(&agent.address) {
                return Err(ApiError::rate_limited("Sender rate limit exceeded"));
            }
        } else {
            let send_limit = state.reputation.get_send_limit(&agent.address);
            if send_limit == 0 {
                return Err(ApiError::reputation_blocked("Sender reputation too low"));
            }
            if !state
                .sender_limiter
                .check_with_limit(&agent.address, send_limit)
            {
                return Err(ApiError::rate_limited("Sender rate limit exceeded"));
            }
        }
    }

    // Step 5: parse the wire dict.
    let envelope =
        from_wire_value(wire).map_err(|err| ApiError::invalid_envelope(err.to_string()))?;

    // Step 6: the envelope's sender must be the authenticated caller.
    if envelope.from_address != agent.address {
        return Err(ApiError::sender_mismatch(format!(
            "envelope from '{}' but authenticated as '{}'",
            envelope.from_address, agent.address
        )));
    }

    // Step 7: dedup. Duplicates are silently accepted as idempotent success.
    let is_new = state
        .storage
        .record_message_id(&envelope.message_id, &agent.address)
        .await?;
    if !is_new {
        debug!(message_id = %envelope.message_id, "duplicate envelope acknowledged");
        return Ok(SendOutcome {
            message_id: envelope.message_id,
            delivered: true,
            duplicate: true,
            envelope: None,
        });
    }

    // Step 8: expiry. Malformed expires is treated as absent.
    let mut expires = envelope.expires.clone();
    if let Some(expires_str) = &envelope.expires {
        match parse_timestamp(expires_str) {
            Some(exp_ts) => {
                if exp_ts + ChronoDuration::seconds(EXPIRY_GRACE_SECONDS) < Utc::now() {
                    return Err(ApiError::expired("Message has expired"));
                }
            }
            None => expires = None,
        }
    }

    // Step 9: domain rate limit. Receipts exempt, our own domain exempt.
    if !is_receipt && !is_allowlisted {
        let sender_domain = domain_of(&agent.address).unwrap_or("");
        if !sender_domain.is_empty()
            && sender_domain != state.settings.relay_domain
            && !state.domain_limiter.check(sender_domain)
        {
            return Err(ApiError::rate_limited("Domain rate limit exceeded"));
        }
    }

    // Step 10: recipient rate limit (receipts exempt).
    if !is_receipt && !state.recipient_limiter.check(&envelope.to_address) {
        return Err(ApiError::rate_limited(format!(
            "Recipient rate limit exceeded ({}/min)",
            state.settings.recipient_rate_limit
        )));
    }

    // Step 11: reputation floor (receipts and allowlisted senders exempt).
    if !is_receipt
        && !is_allowlisted
        && state.reputation.get_score(&agent.address) < super::reputation::MIN_SEND_SCORE
    {
        return Err(ApiError::reputation_blocked("Sender reputation too low"));
    }

    // Step 12: signature verification. The expensive gate runs last.
    let sender_vk = deserialize_verify_key(&agent.public_key)
        .map_err(|err| ApiError::invalid_signature(err.to_string()))?;
    if verify_envelope(&envelope, &sender_vk).is_err() {
        warn!(
            message_id = %envelope.message_id,
            from = %envelope.from_address,
            "invalid envelope signature"
        );
        if let Err(err) = state.reputation.record_message_rejected(&agent.address).await {
            warn!("failed to record rejection: {err:#}");
        }
        return Err(ApiError::invalid_signature("Signature verification failed"));
    }

    // Step 13: dispatch through the delivery tiers.
    let method = delivery::deliver(state, &envelope, wire, expires.as_deref()).await?;
    let delivered = method.delivered_flag();

    if !is_receipt
        && let Err(err) = state.reputation.record_message_success(&agent.address).await
    {
        warn!("failed to record send success: {err:#}");
    }

    if delivered && !is_receipt && method != DeliveryMethod::Webhook {
        // Webhook receipts are deferred until the POST actually lands;
        // the webhook service emits them on success.
        delivery::emit_delivered_receipt(state, &envelope).await;
    }

    Ok(SendOutcome {
        message_id: envelope.message_id.clone(),
        delivered,
        duplicate: false,
        envelope: Some(envelope),
    })
}
