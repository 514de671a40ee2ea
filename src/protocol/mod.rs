pub mod address;
pub mod contact;
pub mod crypto;
pub mod envelope;
pub mod errors;
pub mod types;

pub use address::{Address, parse_address};
pub use contact::{
    ContactCard, contact_card_from_value, contact_card_from_value_unverified,
    contact_card_to_value, create_contact_card, verify_contact_card,
};
pub use crypto::{
    canonicalize, decrypt_payload, decrypt_payload_anonymous, deserialize_verify_key,
    encrypt_payload, encrypt_payload_anonymous, generate_keypair, generate_nonce,
    public_key_fingerprint, serialize_verify_key, sign_message, verify_signature,
};
pub use envelope::{
    EnvelopeOptions, MessageEnvelope, create_envelope, encode_wire, from_wire_value,
    to_wire_value, verify_envelope,
};
pub use errors::ProtocolError;
pub use types::{MAX_ENVELOPE_SIZE, MessageType, UAM_VERSION};
