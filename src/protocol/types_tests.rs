use super::*;

#[test]
fn message_type_round_trips_through_strings() {
    let all = [
        MessageType::Message,
        MessageType::HandshakeRequest,
        MessageType::HandshakeAccept,
        MessageType::HandshakeDeny,
        MessageType::ReceiptDelivered,
        MessageType::ReceiptRead,
        MessageType::ReceiptFailed,
    ];
    for ty in all {
        assert_eq!(MessageType::parse(ty.as_str()), Some(ty));
    }
    assert_eq!(MessageType::parse("session.offer"), None);
    assert_eq!(MessageType::parse("bogus"), None);
}

#[test]
fn receipt_detection() {
    assert!(is_receipt_type("receipt.delivered"));
    assert!(is_receipt_type("receipt.read"));
    assert!(!is_receipt_type("message"));
    assert!(!is_receipt_type("handshake.request"));
}

#[test]
fn protocol_type_detection_covers_session() {
    assert!(is_protocol_type("receipt.failed"));
    assert!(is_protocol_type("handshake.deny"));
    assert!(is_protocol_type("session.offer"));
    assert!(!is_protocol_type("message"));
}

#[test]
fn timestamp_has_millisecond_z_format() {
    let ts = utc_timestamp();
    // YYYY-MM-DDTHH:MM:SS.mmmZ
    assert_eq!(ts.len(), 24);
    assert!(ts.ends_with('Z'));
    assert_eq!(&ts[10..11], "T");
    assert_eq!(&ts[19..20], ".");
    assert!(parse_timestamp(&ts).is_some());
}

#[test]
fn parse_timestamp_accepts_offset_suffix() {
    assert!(parse_timestamp("2026-01-02T03:04:05.678+00:00").is_some());
    assert!(parse_timestamp("2026-01-02T03:04:05.678Z").is_some());
    assert!(parse_timestamp("not a timestamp").is_none());
    assert!(parse_timestamp("").is_none());
}
