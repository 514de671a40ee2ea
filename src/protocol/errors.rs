use thiserror::Error;

/// Typed domain errors for the UAM protocol layer.
///
/// Application flow uses `anyhow`; callers that must distinguish a kind
/// (the relay's error codes, the SDK's pinning check) downcast to this.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),

    #[error("envelope size {size} bytes exceeds maximum {max} bytes")]
    EnvelopeTooLarge { size: usize, max: usize },

    #[error("signature verification failed: {0}")]
    SignatureVerification(String),

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("invalid public key: {0}")]
    InvalidKey(String),

    #[error("invalid contact card: {0}")]
    InvalidContactCard(String),

    /// Fatal: a pinned peer re-resolved to a different key. Never retried,
    /// never swallowed — the caller must surface this to the user.
    #[error(
        "CRITICAL: key pinning violation for {address}: pinned fingerprint {pinned} but resolved {observed}"
    )]
    KeyPinning {
        address: String,
        pinned: String,
        observed: String,
    },
}
