//! UAM message envelope — creation, signing, verification, wire format.
//!
//! The wire keys are `from` / `to`; the struct fields are `from_address` /
//! `to_address`. The signature covers the canonical JSON of all required
//! fields plus any non-null optional field except `attachments`, which is
//! a versioned extension outside the signature scope.

use ed25519_dalek::{SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use super::address::parse_address;
use super::crypto::{
    canonicalize, encrypt_payload, encrypt_payload_anonymous, generate_nonce, sign_message,
    verify_signature,
};
use super::errors::ProtocolError;
use super::types::{MAX_ENVELOPE_SIZE, MessageType, UAM_VERSION, utc_timestamp};

const REQUIRED_WIRE_FIELDS: [&str; 9] = [
    "uam_version",
    "message_id",
    "from",
    "to",
    "timestamp",
    "type",
    "nonce",
    "payload",
    "signature",
];

/// A signed, encrypted UAM message envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub uam_version: String,
    pub message_id: String,
    #[serde(rename = "from")]
    pub from_address: String,
    #[serde(rename = "to")]
    pub to_address: String,
    pub timestamp: String,
    #[serde(rename = "type")]
    pub message_type: String,
    pub nonce: String,
    pub payload: String,
    pub signature: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,

    // Extension field, NOT in the signature scope, so agents on older
    // protocol versions still verify newer envelopes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<Value>>,
}

/// Optional envelope fields for [`create_envelope`].
#[derive(Debug, Clone, Default)]
pub struct EnvelopeOptions {
    pub thread_id: Option<String>,
    pub reply_to: Option<String>,
    pub expires: Option<String>,
    pub media_type: Option<String>,
    pub metadata: Option<Map<String, Value>>,
    pub attachments: Option<Vec<Value>>,
}

/// Build the map used for signature computation: required fields under
/// their wire names plus non-null optionals, excluding `signature` and
/// `attachments`.
pub(crate) fn build_signable_value(envelope: &MessageEnvelope) -> Value {
    let mut map = Map::new();
    map.insert("uam_version".into(), json!(envelope.uam_version));
    map.insert("message_id".into(), json!(envelope.message_id));
    map.insert("from".into(), json!(envelope.from_address));
    map.insert("to".into(), json!(envelope.to_address));
    map.insert("timestamp".into(), json!(envelope.timestamp));
    map.insert("type".into(), json!(envelope.message_type));
    map.insert("nonce".into(), json!(envelope.nonce));
    map.insert("payload".into(), json!(envelope.payload));
    if let Some(v) = &envelope.thread_id {
        map.insert("thread_id".into(), json!(v));
    }
    if let Some(v) = &envelope.reply_to {
        map.insert("reply_to".into(), json!(v));
    }
    if let Some(v) = &envelope.expires {
        map.insert("expires".into(), json!(v));
    }
    if let Some(v) = &envelope.media_type {
        map.insert("media_type".into(), json!(v));
    }
    if let Some(v) = &envelope.metadata {
        map.insert("metadata".into(), Value::Object(v.clone()));
    }
    Value::Object(map)
}

/// Convert an envelope to its wire-format JSON value.
pub fn to_wire_value(envelope: &MessageEnvelope) -> Value {
    serde_json::to_value(envelope).expect("envelope serializes to JSON")
}

/// Restore an envelope from a wire-format JSON value.
pub fn from_wire_value(value: &Value) -> Result<MessageEnvelope, ProtocolError> {
    let Some(obj) = value.as_object() else {
        return Err(ProtocolError::InvalidEnvelope(
            "envelope must be a JSON object".into(),
        ));
    };
    let mut missing: Vec<&str> = REQUIRED_WIRE_FIELDS
        .iter()
        .copied()
        .filter(|field| !obj.contains_key(*field))
        .collect();
    if !missing.is_empty() {
        missing.sort_unstable();
        return Err(ProtocolError::InvalidEnvelope(format!(
            "missing required fields: {missing:?}"
        )));
    }
    serde_json::from_value(value.clone())
        .map_err(|err| ProtocolError::InvalidEnvelope(err.to_string()))
}

/// Serialize an envelope to compact wire bytes, enforcing the size cap.
pub fn encode_wire(envelope: &MessageEnvelope) -> Result<Vec<u8>, ProtocolError> {
    let bytes = serde_json::to_vec(envelope).expect("envelope serializes to JSON");
    if bytes.len() > MAX_ENVELOPE_SIZE {
        return Err(ProtocolError::EnvelopeTooLarge {
            size: bytes.len(),
            max: MAX_ENVELOPE_SIZE,
        });
    }
    Ok(bytes)
}

/// Create a signed, encrypted envelope.
///
/// Steps: validate both addresses, generate the UUIDv7 message id, nonce,
/// and timestamp, encrypt (sealed box iff `handshake.request`, box
/// otherwise), sign the canonicalized signable map, then enforce the wire
/// size cap.
pub fn create_envelope(
    from_address: &str,
    to_address: &str,
    message_type: MessageType,
    payload_plaintext: &[u8],
    signing_key: &SigningKey,
    recipient_verify_key: &VerifyingKey,
    options: EnvelopeOptions,
) -> Result<MessageEnvelope, ProtocolError> {
    parse_address(from_address)?;
    parse_address(to_address)?;

    let message_id = uuid::Uuid::now_v7().to_string();
    let nonce = generate_nonce();
    let timestamp = utc_timestamp();

    // Handshake requests use the sealed box because the sender may have no
    // established relationship with the recipient yet.
    let payload = if message_type == MessageType::HandshakeRequest {
        encrypt_payload_anonymous(payload_plaintext, recipient_verify_key)?
    } else {
        encrypt_payload(payload_plaintext, signing_key, recipient_verify_key)?
    };

    let mut envelope = MessageEnvelope {
        uam_version: UAM_VERSION.to_string(),
        message_id,
        from_address: from_address.to_string(),
        to_address: to_address.to_string(),
        timestamp,
        message_type: message_type.as_str().to_string(),
        nonce,
        payload,
        signature: String::new(),
        thread_id: options.thread_id,
        reply_to: options.reply_to,
        expires: options.expires,
        media_type: options.media_type,
        metadata: options.metadata,
        attachments: options.attachments,
    };

    let signable = build_signable_value(&envelope);
    envelope.signature = sign_message(&canonicalize(&signable), signing_key);

    encode_wire(&envelope)?;
    Ok(envelope)
}

/// Verify the signature on an envelope against the sender's verify key.
///
/// Rebuilds the same signable map as [`create_envelope`] so the scope
/// stays consistent between the two paths.
pub fn verify_envelope(
    envelope: &MessageEnvelope,
    sender_verify_key: &VerifyingKey,
) -> Result<(), ProtocolError> {
    let signable = build_signable_value(envelope);
    verify_signature(
        &canonicalize(&signable),
        &envelope.signature,
        sender_verify_key,
    )
}

#[cfg(test)]
#[path = "envelope_tests.rs"]
mod tests;
