/// A decrypted, signature-verified inbound message as handed to SDK
/// callers. Protocol messages (handshakes, receipts) never surface here.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message_id: String,
    pub from_address: String,
    pub to_address: String,
    pub content: String,
    pub timestamp: String,
    pub message_type: String,
    pub thread_id: Option<String>,
    pub reply_to: Option<String>,
    pub media_type: Option<String>,
    pub verified: bool,
}
