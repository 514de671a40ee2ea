//! Cryptographic primitives: Ed25519 signing, canonical JSON, and the
//! authenticated / anonymous payload encryption used by envelopes.
//!
//! Payload encryption derives an X25519 shared secret from the Ed25519
//! material (Montgomery conversion), runs it through HKDF-SHA256, and
//! seals with ChaCha20-Poly1305. The nonce travels inside the ciphertext
//! blob; sealed (anonymous) blobs additionally prefix an ephemeral public
//! key so the sender's identity is not required to decrypt.

use std::fmt::Write as _;

use chacha20poly1305::{
    ChaCha20Poly1305, Nonce,
    aead::{Aead, KeyInit},
};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand::RngCore;
use rand::rngs::OsRng;
use serde_json::Value;
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, PublicKey as X25519Public, StaticSecret};

use super::errors::ProtocolError;
use super::types::{b64_decode, b64_encode};

const NONCE_LEN: usize = 12;
const HKDF_SALT_BOX: &[u8] = b"uam-v1";
const HKDF_SALT_SEALED: &[u8] = b"uam-v1-sealed";

/// Generate a fresh Ed25519 keypair.
pub fn generate_keypair() -> (SigningKey, VerifyingKey) {
    let signing = SigningKey::generate(&mut OsRng);
    let verify = signing.verifying_key();
    (signing, verify)
}

/// Sign `message` and return the base64 signature.
pub fn sign_message(message: &[u8], signing_key: &SigningKey) -> String {
    b64_encode(&signing_key.sign(message).to_bytes())
}

/// Verify a base64 Ed25519 signature over `message`.
pub fn verify_signature(
    message: &[u8],
    signature_b64: &str,
    verify_key: &VerifyingKey,
) -> Result<(), ProtocolError> {
    let bytes = b64_decode(signature_b64)
        .map_err(|_| ProtocolError::SignatureVerification("signature is not base64".into()))?;
    let bytes: [u8; 64] = bytes
        .try_into()
        .map_err(|_| ProtocolError::SignatureVerification("signature must be 64 bytes".into()))?;
    let signature = Signature::from_bytes(&bytes);
    verify_key
        .verify(message, &signature)
        .map_err(|_| ProtocolError::SignatureVerification("signature mismatch".into()))
}

/// Base64-encode a verify key's 32 raw bytes.
pub fn serialize_verify_key(verify_key: &VerifyingKey) -> String {
    b64_encode(verify_key.as_bytes())
}

/// Decode a base64 verify key.
pub fn deserialize_verify_key(b64: &str) -> Result<VerifyingKey, ProtocolError> {
    let bytes = b64_decode(b64).map_err(|_| ProtocolError::InvalidKey("not base64".into()))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| ProtocolError::InvalidKey("key must be 32 bytes".into()))?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|_| ProtocolError::InvalidKey("not a valid Ed25519 point".into()))
}

/// Lowercase-hex SHA-256 of the verify key's raw bytes (64 chars).
pub fn public_key_fingerprint(verify_key: &VerifyingKey) -> String {
    hex::encode(Sha256::digest(verify_key.as_bytes()))
}

/// 24 random bytes, base64 — the per-envelope nonce field.
pub fn generate_nonce() -> String {
    let mut bytes = [0u8; 24];
    OsRng.fill_bytes(&mut bytes);
    b64_encode(&bytes)
}

// ---------------------------------------------------------------------------
// Canonical JSON (signature input)
// ---------------------------------------------------------------------------

/// Render `value` as canonical JSON bytes: keys sorted at every depth, no
/// insignificant whitespace, ASCII-only escaping, integers rendered
/// without exponent or fraction.
pub fn canonicalize(value: &Value) -> Vec<u8> {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out.into_bytes()
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                let _ = write!(out, "{i}");
            } else if let Some(u) = n.as_u64() {
                let _ = write!(out, "{u}");
            } else {
                // Floats are excluded from the signature scope; render
                // pass-through for completeness.
                let _ = write!(out, "{n}");
            }
        }
        Value::String(s) => write_escaped(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_escaped(key, out);
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
    }
}

fn write_escaped(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0c}' => out.push_str("\\f"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c if c.is_ascii() => out.push(c),
            c => {
                // Non-ASCII escapes as UTF-16 units (surrogate pairs for
                // characters outside the BMP).
                let mut buf = [0u16; 2];
                for unit in c.encode_utf16(&mut buf) {
                    let _ = write!(out, "\\u{unit:04x}");
                }
            }
        }
    }
    out.push('"');
}

// ---------------------------------------------------------------------------
// Payload encryption
// ---------------------------------------------------------------------------

fn signing_to_x25519(signing_key: &SigningKey) -> StaticSecret {
    StaticSecret::from(signing_key.to_scalar_bytes())
}

fn verify_to_x25519(verify_key: &VerifyingKey) -> X25519Public {
    X25519Public::from(verify_key.to_montgomery().to_bytes())
}

fn derive_key(shared_secret: &[u8], salt: &[u8]) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(Some(salt), shared_secret);
    let mut key = [0u8; 32];
    hk.expand(b"payload", &mut key)
        .expect("HKDF output length is valid");
    key
}

fn seal(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let cipher = ChaCha20Poly1305::new(key.into());
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| ProtocolError::Decryption("encryption failed".into()))?;
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn open(key: &[u8; 32], blob: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    if blob.len() < NONCE_LEN {
        return Err(ProtocolError::Decryption("ciphertext too short".into()));
    }
    let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
    let cipher = ChaCha20Poly1305::new(key.into());
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| ProtocolError::Decryption("authentication failed".into()))
}

/// Authenticated encryption to `recipient_vk`: only the holder of the
/// recipient's signing key together with the sender's verify key can open
/// the result. Returns a base64 blob of `nonce || ciphertext`.
pub fn encrypt_payload(
    plaintext: &[u8],
    sender_sk: &SigningKey,
    recipient_vk: &VerifyingKey,
) -> Result<String, ProtocolError> {
    let secret = signing_to_x25519(sender_sk);
    let shared = secret.diffie_hellman(&verify_to_x25519(recipient_vk));
    let key = derive_key(shared.as_bytes(), HKDF_SALT_BOX);
    Ok(b64_encode(&seal(&key, plaintext)?))
}

/// Inverse of [`encrypt_payload`].
pub fn decrypt_payload(
    payload_b64: &str,
    recipient_sk: &SigningKey,
    sender_vk: &VerifyingKey,
) -> Result<Vec<u8>, ProtocolError> {
    let blob =
        b64_decode(payload_b64).map_err(|_| ProtocolError::Decryption("not base64".into()))?;
    let secret = signing_to_x25519(recipient_sk);
    let shared = secret.diffie_hellman(&verify_to_x25519(sender_vk));
    let key = derive_key(shared.as_bytes(), HKDF_SALT_BOX);
    open(&key, &blob)
}

/// Anonymous (sealed) encryption to `recipient_vk` — used only for
/// `handshake.request`, where the sender's key is not yet trusted. The
/// blob carries an ephemeral public key: `ephemeral_pk || nonce || ct`.
pub fn encrypt_payload_anonymous(
    plaintext: &[u8],
    recipient_vk: &VerifyingKey,
) -> Result<String, ProtocolError> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_pk = X25519Public::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(&verify_to_x25519(recipient_vk));
    let key = derive_key(shared.as_bytes(), HKDF_SALT_SEALED);
    let sealed = seal(&key, plaintext)?;
    let mut out = Vec::with_capacity(32 + sealed.len());
    out.extend_from_slice(ephemeral_pk.as_bytes());
    out.extend_from_slice(&sealed);
    Ok(b64_encode(&out))
}

/// Inverse of [`encrypt_payload_anonymous`] — needs only the recipient's
/// signing key.
pub fn decrypt_payload_anonymous(
    payload_b64: &str,
    recipient_sk: &SigningKey,
) -> Result<Vec<u8>, ProtocolError> {
    let blob =
        b64_decode(payload_b64).map_err(|_| ProtocolError::Decryption("not base64".into()))?;
    if blob.len() < 32 + NONCE_LEN {
        return Err(ProtocolError::Decryption("sealed blob too short".into()));
    }
    let (ephemeral_bytes, sealed) = blob.split_at(32);
    let ephemeral_pk: [u8; 32] = ephemeral_bytes
        .try_into()
        .expect("split_at(32) yields 32 bytes");
    let secret = signing_to_x25519(recipient_sk);
    let shared = secret.diffie_hellman(&X25519Public::from(ephemeral_pk));
    let key = derive_key(shared.as_bytes(), HKDF_SALT_SEALED);
    open(&key, sealed)
}

#[cfg(test)]
#[path = "crypto_tests.rs"]
mod tests;
