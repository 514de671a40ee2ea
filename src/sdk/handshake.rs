//! The handshake state machine: first contact exchanges signed contact
//! cards, and a completed accept pins the peer's key (TOFU).

use anyhow::{Context, Result, bail};
use ed25519_dalek::{SigningKey, VerifyingKey};
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::protocol::contact::{CardOptions, contact_card_from_value, create_contact_card};
use crate::protocol::crypto::{
    decrypt_payload, decrypt_payload_anonymous, deserialize_verify_key, serialize_verify_key,
};
use crate::protocol::envelope::{EnvelopeOptions, MessageEnvelope, create_envelope, to_wire_value};
use crate::protocol::types::MessageType;

use super::contact_book::{ContactBook, ContactUpdate, TrustState};

/// How inbound handshake requests from unknown peers are gated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrustPolicy {
    /// Pin anyone who completes a handshake.
    #[default]
    AutoAccept,
    /// Queue requests for an explicit approve/deny decision.
    ApprovalRequired,
    /// Deny requests from peers not already in the contact book.
    AllowlistOnly,
    /// Like approval-required, and `send` additionally refuses targets
    /// that are not pinned/verified/trusted.
    RequireVerify,
}

impl TrustPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "auto-accept" => Some(TrustPolicy::AutoAccept),
            "approval-required" => Some(TrustPolicy::ApprovalRequired),
            "allowlist-only" => Some(TrustPolicy::AllowlistOnly),
            "require_verify" | "require-verify" => Some(TrustPolicy::RequireVerify),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TrustPolicy::AutoAccept => "auto-accept",
            TrustPolicy::ApprovalRequired => "approval-required",
            TrustPolicy::AllowlistOnly => "allowlist-only",
            TrustPolicy::RequireVerify => "require_verify",
        }
    }
}

/// The identity material the handshake flow signs and advertises with.
pub struct HandshakeIdentity<'a> {
    pub address: &'a str,
    pub display_name: &'a str,
    pub relay_ws_url: &'a str,
    pub signing_key: &'a SigningKey,
}

pub struct HandshakeManager {
    policy: TrustPolicy,
}

impl HandshakeManager {
    pub fn new(policy: TrustPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> TrustPolicy {
        self.policy
    }

    /// Build a `handshake.request` wire envelope carrying our signed
    /// contact card, sealed to the recipient.
    pub fn create_handshake_request(
        &self,
        identity: &HandshakeIdentity<'_>,
        to_address: &str,
        recipient_vk: &VerifyingKey,
    ) -> Result<Value> {
        let card = create_contact_card(
            identity.address,
            identity.display_name,
            identity.relay_ws_url,
            identity.signing_key,
            CardOptions::default(),
        )?;
        let card_json = serde_json::to_string(&card)?;
        let envelope = create_envelope(
            identity.address,
            to_address,
            MessageType::HandshakeRequest,
            card_json.as_bytes(),
            identity.signing_key,
            recipient_vk,
            EnvelopeOptions::default(),
        )?;
        Ok(to_wire_value(&envelope))
    }

    /// Handle an inbound handshake envelope (already signature-verified).
    /// Returns a wire envelope to transmit back, if the policy calls for
    /// one. Handshake traffic is never surfaced to the application.
    pub fn handle_inbound(
        &self,
        book: &mut ContactBook,
        identity: &HandshakeIdentity<'_>,
        envelope: &MessageEnvelope,
        sender_vk: &VerifyingKey,
    ) -> Result<Option<Value>> {
        match MessageType::parse(&envelope.message_type) {
            Some(MessageType::HandshakeRequest) => {
                self.handle_request(book, identity, envelope)
            }
            Some(MessageType::HandshakeAccept) => {
                self.handle_accept(book, identity, envelope, sender_vk)
            }
            Some(MessageType::HandshakeDeny) => {
                self.handle_deny(book, identity, envelope, sender_vk)
            }
            _ => bail!("not a handshake envelope: {}", envelope.message_type),
        }
    }

    fn handle_request(
        &self,
        book: &mut ContactBook,
        identity: &HandshakeIdentity<'_>,
        envelope: &MessageEnvelope,
    ) -> Result<Option<Value>> {
        // Requests are sealed: the sender had no pinned relationship yet.
        let plaintext = decrypt_payload_anonymous(&envelope.payload, identity.signing_key)
            .context("handshake.request payload did not unseal")?;
        let card_value: Value = serde_json::from_str(std::str::from_utf8(&plaintext)?)?;
        let card = contact_card_from_value(&card_value)?;

        if card.address != envelope.from_address {
            bail!(
                "contact card address '{}' does not match envelope sender '{}'",
                card.address,
                envelope.from_address
            );
        }
        let peer_vk = deserialize_verify_key(&card.public_key)?;

        match self.policy {
            TrustPolicy::AutoAccept => {
                book.add_contact(
                    &card.address,
                    &card.public_key,
                    TrustState::Pinned,
                    ContactUpdate {
                        display_name: Some(card.display_name.clone()),
                        trust_source: Some("auto-accepted".to_string()),
                        relay: Some(card.relay.clone()),
                        relays: card.relays.clone(),
                    },
                )?;
                book.set_pinned_at(&card.address)?;
                info!(peer = %card.address, "handshake auto-accepted, key pinned");
                let accept = self.make_accept(identity, &card.address, &peer_vk)?;
                Ok(Some(accept))
            }
            TrustPolicy::ApprovalRequired | TrustPolicy::RequireVerify => {
                book.add_pending(&card.address, &card_value.to_string())?;
                info!(peer = %card.address, "handshake queued for approval");
                Ok(None)
            }
            TrustPolicy::AllowlistOnly => {
                if book.is_known(&card.address) {
                    book.add_contact(
                        &card.address,
                        &card.public_key,
                        TrustState::Pinned,
                        ContactUpdate {
                            display_name: Some(card.display_name.clone()),
                            trust_source: Some("allowlist".to_string()),
                            relay: Some(card.relay.clone()),
                            relays: card.relays.clone(),
                        },
                    )?;
                    book.set_pinned_at(&card.address)?;
                    let accept = self.make_accept(identity, &card.address, &peer_vk)?;
                    Ok(Some(accept))
                } else {
                    info!(peer = %card.address, "handshake denied (allowlist-only)");
                    let deny =
                        self.make_deny(identity, &card.address, &peer_vk, "not_on_allowlist")?;
                    Ok(Some(deny))
                }
            }
        }
    }

    fn handle_accept(
        &self,
        book: &mut ContactBook,
        identity: &HandshakeIdentity<'_>,
        envelope: &MessageEnvelope,
        sender_vk: &VerifyingKey,
    ) -> Result<Option<Value>> {
        // The payload is informational; the accept itself is the signal.
        if let Err(err) =
            decrypt_payload(&envelope.payload, identity.signing_key, sender_vk)
        {
            warn!(peer = %envelope.from_address, "unreadable accept payload: {err}");
        }
        book.add_contact(
            &envelope.from_address,
            &serialize_verify_key(sender_vk),
            TrustState::Pinned,
            ContactUpdate {
                trust_source: Some("handshake-accept".to_string()),
                ..ContactUpdate::default()
            },
        )?;
        book.set_pinned_at(&envelope.from_address)?;
        info!(peer = %envelope.from_address, "handshake accepted, key pinned");
        Ok(None)
    }

    fn handle_deny(
        &self,
        book: &mut ContactBook,
        identity: &HandshakeIdentity<'_>,
        envelope: &MessageEnvelope,
        sender_vk: &VerifyingKey,
    ) -> Result<Option<Value>> {
        let reason = decrypt_payload(&envelope.payload, identity.signing_key, sender_vk)
            .ok()
            .and_then(|plaintext| serde_json::from_slice::<Value>(&plaintext).ok())
            .and_then(|payload| {
                payload
                    .get("reason")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .unwrap_or_else(|| "unspecified".to_string());
        info!(peer = %envelope.from_address, %reason, "handshake denied by peer");
        book.remove_contact(&envelope.from_address)?;
        Ok(None)
    }

    /// Build a `handshake.accept` wire envelope.
    pub fn make_accept(
        &self,
        identity: &HandshakeIdentity<'_>,
        to_address: &str,
        recipient_vk: &VerifyingKey,
    ) -> Result<Value> {
        let payload = json!({"status": "accepted"}).to_string();
        let envelope = create_envelope(
            identity.address,
            to_address,
            MessageType::HandshakeAccept,
            payload.as_bytes(),
            identity.signing_key,
            recipient_vk,
            EnvelopeOptions::default(),
        )?;
        Ok(to_wire_value(&envelope))
    }

    /// Build a `handshake.deny` wire envelope with a reason.
    pub fn make_deny(
        &self,
        identity: &HandshakeIdentity<'_>,
        to_address: &str,
        recipient_vk: &VerifyingKey,
        reason: &str,
    ) -> Result<Value> {
        let payload = json!({"reason": reason}).to_string();
        let envelope = create_envelope(
            identity.address,
            to_address,
            MessageType::HandshakeDeny,
            payload.as_bytes(),
            identity.signing_key,
            recipient_vk,
            EnvelopeOptions::default(),
        )?;
        Ok(to_wire_value(&envelope))
    }
}

#[cfg(test)]
#[path = "handshake_tests.rs"]
mod tests;
