use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, SecondsFormat, Utc};

use super::errors::ProtocolError;

/// Protocol version carried in every envelope.
pub const UAM_VERSION: &str = "0.1";

/// Maximum serialized envelope size on the wire, in bytes.
pub const MAX_ENVELOPE_SIZE: usize = 65536;

/// UAM message type — determines payload encryption mode and receipt rules.
///
/// Envelopes carry the type as a plain string so unknown `session.*`
/// subtypes survive a wire round-trip; this enum is the boundary parse for
/// everything the core dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Message,
    HandshakeRequest,
    HandshakeAccept,
    HandshakeDeny,
    ReceiptDelivered,
    ReceiptRead,
    ReceiptFailed,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Message => "message",
            MessageType::HandshakeRequest => "handshake.request",
            MessageType::HandshakeAccept => "handshake.accept",
            MessageType::HandshakeDeny => "handshake.deny",
            MessageType::ReceiptDelivered => "receipt.delivered",
            MessageType::ReceiptRead => "receipt.read",
            MessageType::ReceiptFailed => "receipt.failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "message" => Some(MessageType::Message),
            "handshake.request" => Some(MessageType::HandshakeRequest),
            "handshake.accept" => Some(MessageType::HandshakeAccept),
            "handshake.deny" => Some(MessageType::HandshakeDeny),
            "receipt.delivered" => Some(MessageType::ReceiptDelivered),
            "receipt.read" => Some(MessageType::ReceiptRead),
            "receipt.failed" => Some(MessageType::ReceiptFailed),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// True for `receipt.*` type strings — these bypass rate limits and never
/// generate further receipts.
pub fn is_receipt_type(type_str: &str) -> bool {
    type_str.starts_with("receipt.")
}

/// True for any protocol-internal type that must never trigger a
/// `receipt.read` or `receipt.delivered` (anti-loop guard).
pub fn is_protocol_type(type_str: &str) -> bool {
    type_str.starts_with("receipt.")
        || type_str.starts_with("handshake.")
        || type_str.starts_with("session.")
}

/// Current UTC time as `YYYY-MM-DDTHH:MM:SS.mmmZ`.
pub fn utc_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse an ISO-8601 timestamp, accepting both `Z` and `+00:00` suffixes.
/// Returns `None` for malformed input (callers treat that as "absent").
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

pub fn b64_encode(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn b64_decode(s: &str) -> Result<Vec<u8>, ProtocolError> {
    STANDARD
        .decode(s)
        .map_err(|err| ProtocolError::InvalidEnvelope(format!("invalid base64: {err}")))
}

#[cfg(test)]
#[path = "types_tests.rs"]
mod tests;
