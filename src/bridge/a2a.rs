//! Bidirectional mapping between UAM contact cards and the external A2A
//! agent-card shape.
//!
//! Bridge contacts are opaque: an A2A card carries no Ed25519 material,
//! so the resulting UAM contact has empty `public_key` / `signature` and
//! cannot be verified. A2A-specific fields are preserved verbatim in
//! [`A2aBridgeMetadata`] rather than squeezed into the UAM card.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::protocol::contact::ContactCard;
use crate::protocol::errors::ProtocolError;
use crate::protocol::types::UAM_VERSION;

/// Address domain used when an A2A card has no URL to derive one from.
const BRIDGE_SENTINEL_DOMAIN: &str = "a2a.bridge";

/// Fields of an A2A card that have no UAM counterpart, carried alongside
/// the converted contact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct A2aBridgeMetadata {
    pub source_protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    #[serde(default)]
    pub a2a_fields: Map<String, Value>,
}

/// A2A field names that are recorded in bridge metadata rather than
/// mapped onto the UAM card.
const A2A_PASSTHROUGH_FIELDS: [&str; 8] = [
    "version",
    "provider",
    "capabilities",
    "skills",
    "defaultInputModes",
    "defaultOutputModes",
    "securitySchemes",
    "authentication",
];

/// Convert an A2A agent card into a UAM contact plus bridge metadata.
///
/// The address derives from the host of `url` (sentinel domain when the
/// card has no URL); `name` is required.
pub fn contact_from_a2a(
    a2a_card: &Value,
    source_url: Option<&str>,
) -> Result<(ContactCard, A2aBridgeMetadata), ProtocolError> {
    let Some(name) = a2a_card.get("name").and_then(Value::as_str) else {
        return Err(ProtocolError::InvalidContactCard(
            "A2A card missing required 'name' field".into(),
        ));
    };
    let url = a2a_card.get("url").and_then(Value::as_str);
    let domain = url
        .and_then(|url| url.parse::<reqwest::Url>().ok())
        .and_then(|parsed| parsed.host_str().map(str::to_string))
        .unwrap_or_else(|| BRIDGE_SENTINEL_DOMAIN.to_string());

    let card = ContactCard {
        version: UAM_VERSION.to_string(),
        address: format!("{name}::{domain}"),
        display_name: name.to_string(),
        relay: "bridge://a2a".to_string(),
        // Opaque bridge contact: nothing to verify with.
        public_key: String::new(),
        signature: String::new(),
        description: a2a_card
            .get("description")
            .and_then(Value::as_str)
            .map(str::to_string),
        system: Some("a2a".to_string()),
        connection_endpoint: url.map(str::to_string),
        verified_domain: None,
        payload_formats: None,
        fingerprint: None,
        relays: None,
    };

    let mut a2a_fields = Map::new();
    if let Some(obj) = a2a_card.as_object() {
        for field in A2A_PASSTHROUGH_FIELDS {
            if let Some(value) = obj.get(field) {
                a2a_fields.insert(field.to_string(), value.clone());
            }
        }
    }

    Ok((
        card,
        A2aBridgeMetadata {
            source_protocol: "a2a".to_string(),
            source_url: source_url.map(str::to_string),
            a2a_fields,
        },
    ))
}

/// Project a UAM contact card into the A2A agent-card shape, always
/// injecting the single `uam-messaging` skill.
pub fn contact_to_a2a(card: &ContactCard, base_url: Option<&str>) -> Value {
    let url = base_url
        .map(str::to_string)
        .or_else(|| card.connection_endpoint.clone())
        .unwrap_or_else(|| {
            let domain = crate::protocol::address::domain_of(&card.address).unwrap_or("invalid");
            format!("https://{domain}")
        });

    let mut result = json!({
        "name": card.display_name,
        "url": url,
        "version": card.version,
        "capabilities": {"streaming": false, "pushNotifications": true},
        "skills": [{
            "id": "uam-messaging",
            "name": "UAM Messaging",
            "description": "Signed, end-to-end encrypted agent messaging over UAM relays",
            "tags": ["uam", "messaging", "encrypted"],
        }],
        "defaultInputModes": ["text/plain"],
        "defaultOutputModes": ["text/plain"],
    });
    if let Some(description) = &card.description {
        result["description"] = json!(description);
    }
    result
}

#[cfg(test)]
#[path = "a2a_tests.rs"]
mod tests;
