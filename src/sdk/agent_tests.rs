use super::*;
use crate::protocol::crypto::generate_keypair;
use crate::protocol::envelope::create_envelope;
use crate::sdk::transport::Transport;
use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicUsize, Ordering};

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MockTransportState {
    sent: StdMutex<Vec<Value>>,
    inbox: StdMutex<VecDeque<Value>>,
}

#[derive(Clone, Default)]
struct MockTransport(Arc<MockTransportState>);

impl MockTransport {
    fn sent(&self) -> Vec<Value> {
        self.0.sent.lock().unwrap().clone()
    }

    fn push_inbound(&self, wire: Value) {
        self.0.inbox.lock().unwrap().push_back(wire);
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, wire: &Value) -> Result<()> {
        self.0.sent.lock().unwrap().push(wire.clone());
        Ok(())
    }

    async fn receive(&self, limit: usize) -> Result<Vec<Value>> {
        let mut inbox = self.0.inbox.lock().unwrap();
        let n = limit.min(inbox.len());
        Ok(inbox.drain(..n).collect())
    }
}

#[derive(Default)]
struct StaticResolver {
    keys: StdMutex<HashMap<String, String>>,
    calls: AtomicUsize,
}

impl StaticResolver {
    fn insert(&self, address: &str, key_b64: &str) {
        self.keys
            .lock()
            .unwrap()
            .insert(address.to_string(), key_b64.to_string());
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AddressResolver for StaticResolver {
    async fn resolve_public_key(
        &self,
        address: &str,
        _token: Option<&str>,
        _relay_url: &str,
    ) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.keys
            .lock()
            .unwrap()
            .get(address)
            .cloned()
            .ok_or_else(|| anyhow!("no key for {address}"))
    }
}

struct Harness {
    agent: Agent,
    transport: MockTransport,
    resolver: Arc<StaticResolver>,
    _dir: tempfile::TempDir,
}

async fn harness(name: &str, policy: TrustPolicy) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = SdkConfig::new(name);
    config.key_dir = dir.path().join("keys");
    config.data_dir = dir.path().to_path_buf();
    config.relay_domain = "r.test".to_string();
    config.relay_url = "http://relay.invalid".to_string();
    config.trust_policy = policy;
    config.auto_register = false;

    // Stored token puts connect() on the returning-user path: no network.
    KeyManager::new(config.key_dir.clone())
        .save_token(name, "test-token")
        .unwrap();

    let transport = MockTransport::default();
    let resolver = Arc::new(StaticResolver::default());
    let mut agent = Agent::with_parts(
        config,
        resolver.clone(),
        Some(Box::new(transport.clone())),
    );
    agent.connect().await.unwrap();
    Harness {
        agent,
        transport,
        resolver,
        _dir: dir,
    }
}

fn peer_keys() -> (SigningKey, ed25519_dalek::VerifyingKey, String) {
    let (sk, vk) = generate_keypair();
    let b64 = serialize_verify_key(&vk);
    (sk, vk, b64)
}

/// A signed, encrypted envelope from a peer to the harness agent.
fn envelope_from(
    peer_sk: &SigningKey,
    from: &str,
    to: &str,
    recipient_vk: &ed25519_dalek::VerifyingKey,
    body: &str,
) -> Value {
    let envelope = create_envelope(
        from,
        to,
        MessageType::Message,
        body.as_bytes(),
        peer_sk,
        recipient_vk,
        EnvelopeOptions::default(),
    )
    .unwrap();
    to_wire_value(&envelope)
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn connect_uses_stored_token() {
    let h = harness("alice", TrustPolicy::AutoAccept).await;
    assert!(h.agent.is_connected());
    assert_eq!(h.agent.address().unwrap(), "alice::r.test");
}

#[tokio::test]
async fn contact_card_is_self_verifying() {
    let h = harness("alice", TrustPolicy::AutoAccept).await;
    let card_value = h.agent.contact_card().unwrap();
    let card = contact_card_from_value(&card_value).unwrap();
    assert_eq!(card.address, "alice::r.test");
    assert_eq!(card.public_key, h.agent.public_key());
}

// ---------------------------------------------------------------------------
// Send: first contact, handshake, failover ordering
// ---------------------------------------------------------------------------

#[tokio::test]
async fn first_send_initiates_handshake_then_message() {
    let mut h = harness("alice", TrustPolicy::AutoAccept).await;
    let (bob_sk, _, bob_pk) = peer_keys();
    h.resolver.insert("bob::r.test", &bob_pk);

    let message_id = h.agent.send("bob::r.test", "Hi Bob").await.unwrap();

    let sent = h.transport.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0]["type"], "handshake.request");
    assert_eq!(sent[1]["type"], "message");
    assert_eq!(sent[1]["message_id"], Value::String(message_id));

    // The ciphertext never carries the plaintext.
    assert!(!sent[1].to_string().contains("Hi Bob"));
    // Bob can open it.
    let envelope = from_wire_value(&sent[1]).unwrap();
    let alice_vk = deserialize_verify_key(&h.agent.public_key()).unwrap();
    verify_envelope(&envelope, &alice_vk).unwrap();
    let plaintext = decrypt_payload(&envelope.payload, &bob_sk, &alice_vk).unwrap();
    assert_eq!(plaintext, b"Hi Bob");
}

#[tokio::test]
async fn second_send_skips_handshake() {
    let mut h = harness("alice", TrustPolicy::AutoAccept).await;
    let (_, _, bob_pk) = peer_keys();
    h.resolver.insert("bob::r.test", &bob_pk);

    h.agent.send("bob::r.test", "one").await.unwrap();
    h.agent.send("bob::r.test", "two").await.unwrap();

    let sent = h.transport.sent();
    assert_eq!(sent.len(), 3); // request + two messages
    assert_eq!(sent[2]["type"], "message");
    // Every send re-resolves so the TOFU gate can compare keys.
    assert_eq!(h.resolver.call_count(), 2);
}

#[tokio::test]
async fn resolve_stores_unknown_contact_as_provisional() {
    let mut h = harness("alice", TrustPolicy::AutoAccept).await;
    let (_, _, bob_pk) = peer_keys();
    h.resolver.insert("bob::r.test", &bob_pk);

    h.agent.resolve_public_key("bob::r.test").await.unwrap();
    let book = h.agent.contact_book.as_ref().unwrap();
    assert_eq!(
        book.get_trust_state("bob::r.test").unwrap(),
        Some(TrustState::Provisional)
    );
    assert_eq!(book.get_public_key("bob::r.test").unwrap().unwrap(), bob_pk);
}

#[tokio::test]
async fn pinned_contact_returns_stored_key_when_resolution_agrees() {
    let mut h = harness("alice", TrustPolicy::AutoAccept).await;
    let (_, bob_vk, bob_pk) = peer_keys();
    h.resolver.insert("bob::r.test", &bob_pk);
    h.agent
        .contact_book
        .as_mut()
        .unwrap()
        .add_contact("bob::r.test", &bob_pk, TrustState::Pinned, ContactUpdate::default())
        .unwrap();

    let resolved = h.agent.resolve_public_key("bob::r.test").await.unwrap();
    assert_eq!(resolved, bob_vk);
    assert_eq!(h.resolver.call_count(), 1);
}

#[tokio::test]
async fn pinned_contact_survives_resolution_failure() {
    // The resolver has no key for bob; only a successful resolution may
    // contradict a pin, so the stored key carries the send.
    let mut h = harness("alice", TrustPolicy::AutoAccept).await;
    let (_, bob_vk, bob_pk) = peer_keys();
    h.agent
        .contact_book
        .as_mut()
        .unwrap()
        .add_contact("bob::r.test", &bob_pk, TrustState::Pinned, ContactUpdate::default())
        .unwrap();

    let resolved = h.agent.resolve_public_key("bob::r.test").await.unwrap();
    assert_eq!(resolved, bob_vk);
    assert_eq!(h.resolver.call_count(), 1);
}

#[tokio::test]
async fn provisional_contact_refreshes_to_fresh_key() {
    let mut h = harness("alice", TrustPolicy::AutoAccept).await;
    let (_, _, old_pk) = peer_keys();
    let (_, new_vk, new_pk) = peer_keys();
    h.resolver.insert("bob::r.test", &new_pk);
    h.agent
        .contact_book
        .as_mut()
        .unwrap()
        .add_contact("bob::r.test", &old_pk, TrustState::Provisional, ContactUpdate::default())
        .unwrap();

    let resolved = h.agent.resolve_public_key("bob::r.test").await.unwrap();
    assert_eq!(resolved, new_vk);
    let book = h.agent.contact_book.as_ref().unwrap();
    assert_eq!(book.get_public_key("bob::r.test").unwrap().unwrap(), new_pk);
    assert_eq!(
        book.get_trust_state("bob::r.test").unwrap(),
        Some(TrustState::Provisional)
    );
}

// ---------------------------------------------------------------------------
// TOFU gate
// ---------------------------------------------------------------------------

/// Resolver standing in for a compromised relay: honest on the first
/// lookup, a different key on every lookup after that.
struct FlippingResolver {
    first: String,
    then: String,
    calls: AtomicUsize,
}

#[async_trait]
impl AddressResolver for FlippingResolver {
    async fn resolve_public_key(
        &self,
        _address: &str,
        _token: Option<&str>,
        _relay_url: &str,
    ) -> Result<String> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(if call == 0 {
            self.first.clone()
        } else {
            self.then.clone()
        })
    }
}

#[tokio::test]
async fn send_raises_key_pinning_when_relay_flips_key() {
    let (_, _, real_pk) = peer_keys();
    let (_, _, fake_pk) = peer_keys();

    let dir = tempfile::tempdir().unwrap();
    let mut config = SdkConfig::new("carol");
    config.key_dir = dir.path().join("keys");
    config.data_dir = dir.path().to_path_buf();
    config.relay_domain = "r.test".to_string();
    config.relay_url = "http://relay.invalid".to_string();
    config.auto_register = false;
    KeyManager::new(config.key_dir.clone())
        .save_token("carol", "test-token")
        .unwrap();

    let transport = MockTransport::default();
    let resolver = Arc::new(FlippingResolver {
        first: real_pk.clone(),
        then: fake_pk,
        calls: AtomicUsize::new(0),
    });
    let mut carol = Agent::with_parts(config, resolver, Some(Box::new(transport.clone())));
    carol.connect().await.unwrap();

    // First exchange goes through; the completed handshake pins dave.
    carol.send("dave::r.test", "first").await.unwrap();
    let sent_before = transport.sent().len();
    carol
        .contact_book
        .as_mut()
        .unwrap()
        .add_contact("dave::r.test", &real_pk, TrustState::Pinned, ContactUpdate::default())
        .unwrap();

    // The relay now answers with a different key: the second send must
    // fail loudly and transmit nothing.
    let err = carol.send("dave::r.test", "second").await.unwrap_err();
    let pinning = err
        .downcast_ref::<ProtocolError>()
        .expect("a protocol error");
    assert!(matches!(pinning, ProtocolError::KeyPinning { .. }));
    assert!(err.to_string().contains("CRITICAL"));
    assert_eq!(transport.sent().len(), sent_before);

    // The pinned key is untouched.
    assert_eq!(
        carol
            .contact_book
            .as_ref()
            .unwrap()
            .get_public_key("dave::r.test")
            .unwrap()
            .unwrap(),
        real_pk
    );
}

#[test]
fn pinning_mismatch_is_fatal() {
    let (_, _, real) = peer_keys();
    let (_, _, fake) = peer_keys();
    let err = enforce_pinning("dave::r.test", &real, Some(TrustState::Pinned), &fake).unwrap_err();
    assert!(matches!(err, ProtocolError::KeyPinning { .. }));
    assert!(err.to_string().contains("CRITICAL"));

    // Grandfathered trusted contacts get the same protection.
    assert!(enforce_pinning("dave::r.test", &real, Some(TrustState::Trusted), &fake).is_err());
    assert!(enforce_pinning("dave::r.test", &real, Some(TrustState::Verified), &fake).is_err());
}

#[test]
fn pinning_allows_matching_or_unpinned_keys() {
    let (_, _, real) = peer_keys();
    let (_, _, other) = peer_keys();
    enforce_pinning("d::r.test", &real, Some(TrustState::Pinned), &real).unwrap();
    enforce_pinning("d::r.test", &real, Some(TrustState::Provisional), &other).unwrap();
    enforce_pinning("d::r.test", &real, Some(TrustState::Unverified), &other).unwrap();
    enforce_pinning("d::r.test", &real, None, &other).unwrap();
}

#[tokio::test]
async fn require_verify_blocks_provisional_and_allows_pinned() {
    let mut h = harness("alice", TrustPolicy::RequireVerify).await;
    let (_, _, bob_pk) = peer_keys();
    h.agent
        .contact_book
        .as_mut()
        .unwrap()
        .add_contact("bob::r.test", &bob_pk, TrustState::Provisional, ContactUpdate::default())
        .unwrap();

    let err = h.agent.send("bob::r.test", "hi").await.unwrap_err();
    assert!(err.to_string().contains("require_verify"));
    assert!(h.transport.sent().is_empty());

    h.agent
        .contact_book
        .as_mut()
        .unwrap()
        .add_contact("bob::r.test", &bob_pk, TrustState::Pinned, ContactUpdate::default())
        .unwrap();
    h.agent.send("bob::r.test", "hi").await.unwrap();
    assert_eq!(h.transport.sent().len(), 1);
}

// ---------------------------------------------------------------------------
// Inbox: verify, decrypt, receipts, silent drops
// ---------------------------------------------------------------------------

#[tokio::test]
async fn inbox_surfaces_message_and_sends_read_receipt() {
    let mut h = harness("alice", TrustPolicy::AutoAccept).await;
    let (bob_sk, bob_vk, bob_pk) = peer_keys();
    h.agent
        .contact_book
        .as_mut()
        .unwrap()
        .add_contact("bob::r.test", &bob_pk, TrustState::Pinned, ContactUpdate::default())
        .unwrap();

    let alice_vk = deserialize_verify_key(&h.agent.public_key()).unwrap();
    h.transport.push_inbound(envelope_from(
        &bob_sk,
        "bob::r.test",
        "alice::r.test",
        &alice_vk,
        "Hi Alice",
    ));

    let messages = h.agent.inbox(50).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, "Hi Alice");
    assert_eq!(messages[0].from_address, "bob::r.test");
    assert!(messages[0].verified);

    // One receipt.read went back, encrypted and signed.
    let sent = h.transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0]["type"], "receipt.read");
    let receipt = from_wire_value(&sent[0]).unwrap();
    verify_envelope(&receipt, &alice_vk).unwrap();
    let plaintext = decrypt_payload(&receipt.payload, &bob_sk, &alice_vk).unwrap();
    let payload: Value = serde_json::from_slice(&plaintext).unwrap();
    assert_eq!(payload["message_id"], Value::String(messages[0].message_id.clone()));
}

#[tokio::test]
async fn no_read_receipt_for_protocol_messages() {
    let mut h = harness("alice", TrustPolicy::AutoAccept).await;
    let (bob_sk, _, bob_pk) = peer_keys();
    h.agent
        .contact_book
        .as_mut()
        .unwrap()
        .add_contact("bob::r.test", &bob_pk, TrustState::Pinned, ContactUpdate::default())
        .unwrap();
    let alice_vk = deserialize_verify_key(&h.agent.public_key()).unwrap();

    // A peer receipt.read arrives; it surfaces but earns no receipt.
    let envelope = create_envelope(
        "bob::r.test",
        "alice::r.test",
        MessageType::ReceiptRead,
        br#"{"message_id":"m-1"}"#,
        &bob_sk,
        &alice_vk,
        EnvelopeOptions::default(),
    )
    .unwrap();
    h.transport.push_inbound(to_wire_value(&envelope));

    let messages = h.agent.inbox(50).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].message_type, "receipt.read");
    assert!(h.transport.sent().is_empty(), "receipt for a receipt");
}

#[tokio::test]
async fn invalid_signature_dropped_silently() {
    let mut h = harness("alice", TrustPolicy::AutoAccept).await;
    let (bob_sk, _, bob_pk) = peer_keys();
    h.agent
        .contact_book
        .as_mut()
        .unwrap()
        .add_contact("bob::r.test", &bob_pk, TrustState::Pinned, ContactUpdate::default())
        .unwrap();
    let alice_vk = deserialize_verify_key(&h.agent.public_key()).unwrap();

    let mut wire = envelope_from(&bob_sk, "bob::r.test", "alice::r.test", &alice_vk, "hi");
    wire["timestamp"] = Value::String("2031-01-01T00:00:00.000Z".to_string());
    h.transport.push_inbound(wire);

    let messages = h.agent.inbox(50).await.unwrap();
    assert!(messages.is_empty());
    assert!(h.transport.sent().is_empty());
}

#[tokio::test]
async fn undecryptable_payload_dropped_silently() {
    let mut h = harness("alice", TrustPolicy::AutoAccept).await;
    let (bob_sk, _, bob_pk) = peer_keys();
    let (_, eve_vk) = generate_keypair();
    h.agent
        .contact_book
        .as_mut()
        .unwrap()
        .add_contact("bob::r.test", &bob_pk, TrustState::Pinned, ContactUpdate::default())
        .unwrap();

    // Bob encrypts to eve, not alice: signature valid, payload opaque.
    h.transport.push_inbound(envelope_from(
        &bob_sk,
        "bob::r.test",
        "alice::r.test",
        &eve_vk,
        "hi",
    ));
    let messages = h.agent.inbox(50).await.unwrap();
    assert!(messages.is_empty());
}

#[tokio::test]
async fn blocked_sender_dropped_before_crypto() {
    let mut h = harness("alice", TrustPolicy::AutoAccept).await;
    let (bob_sk, _, bob_pk) = peer_keys();
    h.agent
        .contact_book
        .as_mut()
        .unwrap()
        .add_contact("bob::r.test", &bob_pk, TrustState::Pinned, ContactUpdate::default())
        .unwrap();
    h.agent.block("bob::r.test").await.unwrap();
    let alice_vk = deserialize_verify_key(&h.agent.public_key()).unwrap();

    h.transport.push_inbound(envelope_from(
        &bob_sk,
        "bob::r.test",
        "alice::r.test",
        &alice_vk,
        "spam",
    ));
    assert!(h.agent.inbox(50).await.unwrap().is_empty());

    h.agent.unblock("bob::r.test").await.unwrap();
    h.transport.push_inbound(envelope_from(
        &bob_sk,
        "bob::r.test",
        "alice::r.test",
        &alice_vk,
        "welcome back",
    ));
    assert_eq!(h.agent.inbox(50).await.unwrap().len(), 1);
}

#[tokio::test]
async fn relay_control_receipts_are_ignored() {
    let mut h = harness("alice", TrustPolicy::AutoAccept).await;
    // The relay's receipt.delivered is a bare control dict, not an envelope.
    h.transport.push_inbound(json!({
        "type": "receipt.delivered",
        "message_id": "m-1",
        "timestamp": "2026-06-01T00:00:00.000Z",
        "to": "bob::r.test",
    }));
    let messages = h.agent.inbox(50).await.unwrap();
    assert!(messages.is_empty());
}

#[tokio::test]
async fn strict_policy_filters_unapproved_senders() {
    let mut h = harness("alice", TrustPolicy::ApprovalRequired).await;
    let (bob_sk, _, bob_pk) = peer_keys();
    h.agent
        .contact_book
        .as_mut()
        .unwrap()
        .add_contact("bob::r.test", &bob_pk, TrustState::Provisional, ContactUpdate::default())
        .unwrap();
    let alice_vk = deserialize_verify_key(&h.agent.public_key()).unwrap();

    h.transport.push_inbound(envelope_from(
        &bob_sk,
        "bob::r.test",
        "alice::r.test",
        &alice_vk,
        "not yet",
    ));
    assert!(h.agent.inbox(50).await.unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// Handshake over the wire
// ---------------------------------------------------------------------------

/// A handshake.request from a fresh peer, as it would arrive off the wire.
fn handshake_request_from(
    peer_sk: &SigningKey,
    peer_address: &str,
    to: &str,
    recipient_vk: &ed25519_dalek::VerifyingKey,
) -> Value {
    let manager = HandshakeManager::new(TrustPolicy::AutoAccept);
    let identity = crate::sdk::handshake::HandshakeIdentity {
        address: peer_address,
        display_name: "peer",
        relay_ws_url: "ws://relay.test/ws",
        signing_key: peer_sk,
    };
    manager
        .create_handshake_request(&identity, to, recipient_vk)
        .unwrap()
}

#[tokio::test]
async fn inbound_handshake_request_auto_accepts() {
    let mut h = harness("alice", TrustPolicy::AutoAccept).await;
    let (bob_sk, _, bob_pk) = peer_keys();
    h.resolver.insert("bob::r.test", &bob_pk);
    let alice_vk = deserialize_verify_key(&h.agent.public_key()).unwrap();

    h.transport
        .push_inbound(handshake_request_from(&bob_sk, "bob::r.test", "alice::r.test", &alice_vk));
    let messages = h.agent.inbox(50).await.unwrap();
    assert!(messages.is_empty(), "handshakes are not user-visible");

    let book = h.agent.contact_book.as_ref().unwrap();
    assert_eq!(book.get_trust_state("bob::r.test").unwrap(), Some(TrustState::Pinned));

    let sent = h.transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0]["type"], "handshake.accept");
}

#[tokio::test]
async fn approval_flow_approve_pins_and_accepts() {
    let mut h = harness("alice", TrustPolicy::ApprovalRequired).await;
    let (bob_sk, _, bob_pk) = peer_keys();
    h.resolver.insert("bob::r.test", &bob_pk);
    let alice_vk = deserialize_verify_key(&h.agent.public_key()).unwrap();

    h.transport
        .push_inbound(handshake_request_from(&bob_sk, "bob::r.test", "alice::r.test", &alice_vk));
    h.agent.inbox(50).await.unwrap();

    let pending = h.agent.pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].address, "bob::r.test");

    h.agent.approve("bob::r.test").await.unwrap();
    let book = h.agent.contact_book.as_ref().unwrap();
    assert_eq!(book.get_trust_state("bob::r.test").unwrap(), Some(TrustState::Pinned));
    assert_eq!(
        book.get_trust_source("bob::r.test").unwrap().as_deref(),
        Some("explicit-approval")
    );
    assert!(h.agent.pending().await.unwrap().is_empty());

    let sent = h.transport.sent();
    assert_eq!(sent.last().unwrap()["type"], "handshake.accept");
}

#[tokio::test]
async fn approval_flow_deny_drops_and_notifies() {
    let mut h = harness("alice", TrustPolicy::ApprovalRequired).await;
    let (bob_sk, _, bob_pk) = peer_keys();
    h.resolver.insert("bob::r.test", &bob_pk);
    let alice_vk = deserialize_verify_key(&h.agent.public_key()).unwrap();

    h.transport
        .push_inbound(handshake_request_from(&bob_sk, "bob::r.test", "alice::r.test", &alice_vk));
    h.agent.inbox(50).await.unwrap();

    h.agent.deny("bob::r.test").await.unwrap();
    assert!(h.agent.pending().await.unwrap().is_empty());
    assert!(!h.agent.contact_book.as_ref().unwrap().is_known("bob::r.test"));
    let sent = h.transport.sent();
    assert_eq!(sent.last().unwrap()["type"], "handshake.deny");
}

#[tokio::test]
async fn approve_without_pending_is_an_error() {
    let mut h = harness("alice", TrustPolicy::ApprovalRequired).await;
    let err = h.agent.approve("ghost::r.test").await.unwrap_err();
    assert!(err.to_string().contains("no pending handshake"));
}

#[tokio::test]
async fn expired_pending_handshakes_emit_receipt_failed() {
    let mut h = harness("alice", TrustPolicy::ApprovalRequired).await;
    let (bob_sk, bob_vk, _) = peer_keys();

    // Store bob's pending request, then age it past the TTL.
    let card = crate::protocol::contact::create_contact_card(
        "bob::r.test",
        "bob",
        "ws://relay.test/ws",
        &bob_sk,
        crate::protocol::contact::CardOptions::default(),
    )
    .unwrap();
    {
        let book = h.agent.contact_book.as_mut().unwrap();
        book.add_pending("bob::r.test", &serde_json::to_string(&card).unwrap())
            .unwrap();
        book.raw_conn()
            .execute(
                "UPDATE pending_handshakes SET received_at = datetime('now', '-8 days')",
                [],
            )
            .unwrap();
    }

    h.agent.inbox(50).await.unwrap();

    assert!(h.agent.pending().await.unwrap().is_empty());
    let sent = h.transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0]["type"], "receipt.failed");
    let receipt = from_wire_value(&sent[0]).unwrap();
    let alice_vk = deserialize_verify_key(&h.agent.public_key()).unwrap();
    let plaintext = decrypt_payload(&receipt.payload, &bob_sk, &alice_vk).unwrap();
    let payload: Value = serde_json::from_slice(&plaintext).unwrap();
    assert_eq!(payload["reason"], "handshake_expired");
    assert_eq!(payload["original_from"], "bob::r.test");
    let _ = bob_vk;
}
