use super::*;
use crate::protocol::crypto::{generate_keypair, public_key_fingerprint, serialize_verify_key};
use crate::protocol::errors::ProtocolError;
use serde_json::json;

fn sample_card(sk: &ed25519_dalek::SigningKey) -> ContactCard {
    create_contact_card(
        "alice::relay.test",
        "Alice Agent",
        "wss://relay.test/ws",
        sk,
        CardOptions {
            description: Some("A helpful agent".into()),
            ..CardOptions::default()
        },
    )
    .unwrap()
}

#[test]
fn create_fills_required_fields() {
    let (sk, vk) = generate_keypair();
    let card = sample_card(&sk);
    assert_eq!(card.version, "0.1");
    assert_eq!(card.address, "alice::relay.test");
    assert_eq!(card.display_name, "Alice Agent");
    assert_eq!(card.relay, "wss://relay.test/ws");
    assert_eq!(card.public_key, serialize_verify_key(&vk));
    assert!(!card.signature.is_empty());
}

#[test]
fn defaults_payload_formats_and_fingerprint() {
    let (sk, vk) = generate_keypair();
    let card = sample_card(&sk);
    assert_eq!(
        card.payload_formats.as_deref(),
        Some(&["text/plain".to_string(), "text/markdown".to_string()][..])
    );
    assert_eq!(card.fingerprint.as_deref(), Some(public_key_fingerprint(&vk).as_str()));
}

#[test]
fn card_is_self_verifying() {
    let (sk, _) = generate_keypair();
    verify_contact_card(&sample_card(&sk)).unwrap();
}

#[test]
fn tampered_signed_field_fails() {
    let (sk, _) = generate_keypair();
    let mut card = sample_card(&sk);
    card.display_name = "Evil Agent".into();
    assert!(matches!(
        verify_contact_card(&card),
        Err(ProtocolError::SignatureVerification(_))
    ));

    let mut card = sample_card(&sk);
    card.address = "eve::relay.test".into();
    assert!(verify_contact_card(&card).is_err());
}

#[test]
fn tampered_extension_fields_do_not_fail() {
    let (sk, _) = generate_keypair();
    let mut card = sample_card(&sk);
    card.payload_formats = Some(vec!["application/octet-stream".into()]);
    card.fingerprint = Some("00".repeat(32));
    card.relays = Some(vec!["wss://other.test/ws".into()]);
    verify_contact_card(&card).unwrap();

    card.payload_formats = None;
    card.fingerprint = None;
    card.relays = None;
    verify_contact_card(&card).unwrap();
}

#[test]
fn wire_round_trip() {
    let (sk, _) = generate_keypair();
    let card = sample_card(&sk);
    let value = contact_card_to_value(&card);
    let restored = contact_card_from_value(&value).unwrap();
    assert_eq!(restored, card);
}

#[test]
fn wire_excludes_none_optionals() {
    let (sk, _) = generate_keypair();
    let card = create_contact_card(
        "alice::relay.test",
        "Alice",
        "wss://relay.test/ws",
        &sk,
        CardOptions::default(),
    )
    .unwrap();
    let value = contact_card_to_value(&card);
    let obj = value.as_object().unwrap();
    assert!(!obj.contains_key("description"));
    assert!(!obj.contains_key("system"));
    assert!(!obj.contains_key("connection_endpoint"));
    assert!(!obj.contains_key("verified_domain"));
    assert!(!obj.contains_key("relays"));
    assert!(obj.contains_key("payload_formats"));
    assert!(obj.contains_key("fingerprint"));
}

#[test]
fn from_value_verifies_by_default() {
    let (sk, _) = generate_keypair();
    let mut value = contact_card_to_value(&sample_card(&sk));
    value["display_name"] = json!("Tampered");
    assert!(contact_card_from_value(&value).is_err());
    let card = contact_card_from_value_unverified(&value).unwrap();
    assert_eq!(card.display_name, "Tampered");
}

#[test]
fn missing_required_fields_rejected() {
    let err = contact_card_from_value_unverified(&json!({"version": "0.1"})).unwrap_err();
    assert!(matches!(err, ProtocolError::InvalidContactCard(_)));
}

#[test]
fn invalid_address_rejected() {
    let (sk, _) = generate_keypair();
    assert!(matches!(
        create_contact_card("invalid-address", "Alice", "wss://r/ws", &sk, CardOptions::default()),
        Err(ProtocolError::InvalidAddress(_))
    ));
}

#[test]
fn verified_domain_changes_signature() {
    let (sk, _) = generate_keypair();
    let plain = create_contact_card(
        "alice::relay.test",
        "Alice",
        "wss://relay.test/ws",
        &sk,
        CardOptions::default(),
    )
    .unwrap();
    let with_domain = create_contact_card(
        "alice::relay.test",
        "Alice",
        "wss://relay.test/ws",
        &sk,
        CardOptions {
            verified_domain: Some("example.com".into()),
            ..CardOptions::default()
        },
    )
    .unwrap();
    assert_ne!(plain.signature, with_domain.signature);
    verify_contact_card(&with_domain).unwrap();

    let value = contact_card_to_value(&with_domain);
    assert_eq!(value["verified_domain"], json!("example.com"));
    let restored = contact_card_from_value(&value).unwrap();
    assert_eq!(restored.verified_domain.as_deref(), Some("example.com"));
}

#[test]
fn derived_fingerprint_matches_stored_default() {
    let (sk, _) = generate_keypair();
    let card = sample_card(&sk);
    assert_eq!(
        card.derived_fingerprint().unwrap(),
        card.fingerprint.clone().unwrap()
    );
}
