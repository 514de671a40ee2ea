//! Signed, self-describing contact cards.
//!
//! The signature covers the required identity fields plus any non-null
//! optional field inside the scope. `payload_formats`, `fingerprint`, and
//! `relays` live outside the scope so agents on older protocol versions
//! still verify newer cards; the fingerprint is advisory and always
//! derivable from the embedded key.

use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use super::address::parse_address;
use super::crypto::{
    canonicalize, deserialize_verify_key, public_key_fingerprint, serialize_verify_key,
    sign_message, verify_signature,
};
use super::errors::ProtocolError;
use super::types::UAM_VERSION;

const REQUIRED_CARD_FIELDS: [&str; 6] = [
    "version",
    "address",
    "display_name",
    "relay",
    "public_key",
    "signature",
];

/// A self-signed identity card. The embedded `public_key` verifies the
/// card, so no external key material is needed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactCard {
    pub version: String,
    pub address: String,
    pub display_name: String,
    pub relay: String,
    pub public_key: String,
    pub signature: String,

    // Optional, inside the signature scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verified_domain: Option<String>,

    // Extension fields, outside the signature scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_formats: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relays: Option<Vec<String>>,
}

/// Optional card fields for [`create_contact_card`].
#[derive(Debug, Clone)]
pub struct CardOptions {
    pub description: Option<String>,
    pub system: Option<String>,
    pub connection_endpoint: Option<String>,
    pub verified_domain: Option<String>,
    pub payload_formats: Option<Vec<String>>,
    pub relays: Option<Vec<String>>,
}

impl Default for CardOptions {
    fn default() -> Self {
        Self {
            description: None,
            system: None,
            connection_endpoint: None,
            verified_domain: None,
            payload_formats: Some(vec!["text/plain".to_string(), "text/markdown".to_string()]),
            relays: None,
        }
    }
}

pub(crate) fn build_signable_value(card: &ContactCard) -> Value {
    let mut map = Map::new();
    map.insert("version".into(), json!(card.version));
    map.insert("address".into(), json!(card.address));
    map.insert("display_name".into(), json!(card.display_name));
    map.insert("relay".into(), json!(card.relay));
    map.insert("public_key".into(), json!(card.public_key));
    if let Some(v) = &card.description {
        map.insert("description".into(), json!(v));
    }
    if let Some(v) = &card.system {
        map.insert("system".into(), json!(v));
    }
    if let Some(v) = &card.connection_endpoint {
        map.insert("connection_endpoint".into(), json!(v));
    }
    if let Some(v) = &card.verified_domain {
        map.insert("verified_domain".into(), json!(v));
    }
    Value::Object(map)
}

/// Create and sign a contact card for the owner of `signing_key`.
pub fn create_contact_card(
    address: &str,
    display_name: &str,
    relay: &str,
    signing_key: &SigningKey,
    options: CardOptions,
) -> Result<ContactCard, ProtocolError> {
    parse_address(address)?;
    let verify_key = signing_key.verifying_key();

    let mut card = ContactCard {
        version: UAM_VERSION.to_string(),
        address: address.to_string(),
        display_name: display_name.to_string(),
        relay: relay.to_string(),
        public_key: serialize_verify_key(&verify_key),
        signature: String::new(),
        description: options.description,
        system: options.system,
        connection_endpoint: options.connection_endpoint,
        verified_domain: options.verified_domain,
        payload_formats: options.payload_formats,
        fingerprint: Some(public_key_fingerprint(&verify_key)),
        relays: options.relays,
    };

    let signable = build_signable_value(&card);
    card.signature = sign_message(&canonicalize(&signable), signing_key);
    Ok(card)
}

/// Verify a card's signature using its embedded public key.
///
/// Extension fields (`payload_formats`, `fingerprint`, `relays`) are not
/// checked: tampering with them does not invalidate the card.
pub fn verify_contact_card(card: &ContactCard) -> Result<(), ProtocolError> {
    let verify_key = deserialize_verify_key(&card.public_key)?;
    let signable = build_signable_value(card);
    verify_signature(&canonicalize(&signable), &card.signature, &verify_key)
}

/// Serialize a card to its wire-format JSON value.
pub fn contact_card_to_value(card: &ContactCard) -> Value {
    serde_json::to_value(card).expect("contact card serializes to JSON")
}

/// Parse a wire-format card and verify its signature.
pub fn contact_card_from_value(value: &Value) -> Result<ContactCard, ProtocolError> {
    let card = contact_card_from_value_unverified(value)?;
    verify_contact_card(&card)?;
    Ok(card)
}

/// Parse a wire-format card without verifying — for callers that inspect
/// untrusted cards before deciding anything.
pub fn contact_card_from_value_unverified(value: &Value) -> Result<ContactCard, ProtocolError> {
    let Some(obj) = value.as_object() else {
        return Err(ProtocolError::InvalidContactCard(
            "contact card must be a JSON object".into(),
        ));
    };
    let mut missing: Vec<&str> = REQUIRED_CARD_FIELDS
        .iter()
        .copied()
        .filter(|field| !obj.contains_key(*field))
        .collect();
    if !missing.is_empty() {
        missing.sort_unstable();
        return Err(ProtocolError::InvalidContactCard(format!(
            "missing required fields: {missing:?}"
        )));
    }
    serde_json::from_value(value.clone())
        .map_err(|err| ProtocolError::InvalidContactCard(err.to_string()))
}

impl ContactCard {
    /// Recompute the fingerprint from the embedded key. The stored
    /// `fingerprint` field is advisory; this is the authoritative value.
    pub fn derived_fingerprint(&self) -> Result<String, ProtocolError> {
        Ok(public_key_fingerprint(&deserialize_verify_key(
            &self.public_key,
        )?))
    }
}

#[cfg(test)]
#[path = "contact_tests.rs"]
mod tests;
