//! The `Agent` — the primary SDK surface: connect, send, inbox, and
//! trust management over one relay connection.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use ed25519_dalek::VerifyingKey;
use serde_json::{Map, Value, json};
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use crate::protocol::contact::{CardOptions, contact_card_from_value, create_contact_card};
use crate::protocol::crypto::{
    decrypt_payload, deserialize_verify_key, public_key_fingerprint, serialize_verify_key,
};
use crate::protocol::envelope::{EnvelopeOptions, create_envelope, from_wire_value, to_wire_value, verify_envelope};
use crate::protocol::errors::ProtocolError;
use crate::protocol::types::{MessageType, is_protocol_type, is_receipt_type};

use super::config::SdkConfig;
use super::contact_book::{ContactBook, ContactUpdate, PendingHandshake, TrustState};
use super::handshake::{HandshakeIdentity, HandshakeManager, TrustPolicy};
use super::key_manager::KeyManager;
use super::message::ReceivedMessage;
use super::resolver::{AddressResolver, SmartResolver};
use super::transport::{HttpTransport, Transport};

const PENDING_HANDSHAKE_TTL_DAYS: i64 = 7;

/// Optional fields for [`Agent::send`].
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub thread_id: Option<String>,
    pub attachments: Option<Vec<Value>>,
}

pub struct Agent {
    config: SdkConfig,
    relay_ws_url: String,
    key_manager: KeyManager,
    resolver: Arc<dyn AddressResolver>,
    handshake: HandshakeManager,
    contact_book: Option<ContactBook>,
    transport: Option<Box<dyn Transport>>,
    address: Option<String>,
    token: Option<String>,
    connected: bool,
}

impl Agent {
    /// Create an agent. No I/O happens here — call [`connect`](Self::connect).
    pub fn new(config: SdkConfig) -> Self {
        let resolver = Arc::new(SmartResolver::new(&config.relay_domain));
        Self::with_parts(config, resolver, None)
    }

    /// Create an agent with a custom resolver and/or transport — the seam
    /// for alternative relay protocols and for harness use.
    pub fn with_parts(
        config: SdkConfig,
        resolver: Arc<dyn AddressResolver>,
        transport: Option<Box<dyn Transport>>,
    ) -> Self {
        Self {
            relay_ws_url: config.relay_ws_url(),
            key_manager: KeyManager::new(config.key_dir.clone()),
            handshake: HandshakeManager::new(config.trust_policy),
            resolver,
            contact_book: None,
            transport,
            address: None,
            token: None,
            connected: false,
            config,
        }
    }

    // -- Properties ----------------------------------------------------------

    pub fn address(&self) -> Result<&str> {
        self.address
            .as_deref()
            .ok_or_else(|| anyhow!("agent not connected; call connect() first"))
    }

    pub fn public_key(&self) -> String {
        serialize_verify_key(&self.key_manager.verify_key())
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Generate a signed contact card for this agent.
    pub fn contact_card(&self) -> Result<Value> {
        let address = self.address()?;
        let card = create_contact_card(
            address,
            &self.config.display_name,
            &self.config.relay_ws_url(),
            self.key_manager.signing_key(),
            CardOptions::default(),
        )?;
        Ok(serde_json::to_value(&card)?)
    }

    // -- Lifecycle -----------------------------------------------------------

    /// Load or generate keys, register (or reuse the stored token), and
    /// open the contact book. Idempotent.
    pub async fn connect(&mut self) -> Result<()> {
        if self.connected {
            return Ok(());
        }
        self.key_manager.load_or_generate(&self.config.name)?;

        if let Some(token) = self.key_manager.load_token(&self.config.name) {
            self.token = Some(token);
            self.address = Some(format!(
                "{}::{}",
                self.config.name, self.config.relay_domain
            ));
        } else if self.config.auto_register {
            self.register_with_relay().await?;
        } else {
            bail!("no stored token and auto_register is off; register manually first");
        }

        if self.transport.is_none() {
            self.transport = Some(Box::new(HttpTransport::new(
                &self.config.relay_url,
                self.token.as_deref().unwrap_or(""),
                self.address.as_deref().expect("address set above"),
            )));
        }
        self.contact_book = Some(ContactBook::open(&self.config.data_dir)?);
        self.connected = true;

        self.sweep_expired_handshakes().await;
        Ok(())
    }

    pub fn close(&mut self) {
        self.contact_book = None;
        self.transport = None;
        self.connected = false;
    }

    async fn register_with_relay(&mut self) -> Result<()> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        let response = client
            .post(format!(
                "{}/api/v1/register",
                self.config.relay_url.trim_end_matches('/')
            ))
            .json(&json!({
                "agent_name": self.config.name,
                "public_key": self.public_key(),
            }))
            .send()
            .await
            .context("relay registration request failed")?;

        if response.status().as_u16() == 409 {
            bail!(
                "address already registered with a different key: {}::{}",
                self.config.name,
                self.config.relay_domain
            );
        }
        if !response.status().is_success() {
            bail!("registration failed: HTTP {}", response.status());
        }
        let body: Value = response.json().await?;
        let address = body
            .get("address")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("registration response missing address"))?
            .to_string();
        let token = body
            .get("token")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("registration response missing token"))?
            .to_string();

        self.key_manager.save_token(&self.config.name, &token)?;
        info!(agent = %address, "registered with relay");
        self.address = Some(address);
        self.token = Some(token);
        Ok(())
    }

    // -- Messaging -----------------------------------------------------------

    /// Send an encrypted, signed message. Returns the message id.
    pub async fn send(&mut self, to_address: &str, message: &str) -> Result<String> {
        self.send_with(to_address, message, SendOptions::default()).await
    }

    pub async fn send_with(
        &mut self,
        to_address: &str,
        message: &str,
        options: SendOptions,
    ) -> Result<String> {
        self.ensure_connected().await?;

        // First-contact detection must precede resolution: resolving an
        // unknown peer stores a provisional contact.
        let first_contact = !self.book().is_known(to_address);

        let recipient_vk = self.resolve_public_key(to_address).await?;

        if self.handshake.policy() == TrustPolicy::RequireVerify
            && !self.book().is_trusted_or_verified(to_address)?
        {
            bail!(
                "trust policy require_verify refuses send to {to_address} \
                 (not pinned, verified, or trusted)"
            );
        }

        if first_contact {
            self.initiate_handshake(to_address, &recipient_vk).await?;
        }

        let envelope = create_envelope(
            self.address()?,
            to_address,
            MessageType::Message,
            message.as_bytes(),
            self.key_manager.signing_key(),
            &recipient_vk,
            EnvelopeOptions {
                thread_id: options.thread_id,
                media_type: Some("text/plain".to_string()),
                attachments: options.attachments,
                ..EnvelopeOptions::default()
            },
        )?;
        let wire = to_wire_value(&envelope);

        // Multi-relay failover: honor the recipient card's relay list when
        // it differs from our own relay.
        match self.book().get_relay_urls(to_address)? {
            Some(urls)
                if !(urls.len() == 1 && urls[0] == self.config.relay_url) && !urls.is_empty() =>
            {
                self.try_send_with_failover(&wire, &urls).await?;
            }
            _ => self.transport().send(&wire).await?,
        }
        Ok(envelope.message_id)
    }

    /// Retrieve, verify, and decrypt pending messages. Invalid
    /// signatures and undecryptable payloads are dropped silently (an
    /// attacker gets no signal); a `receipt.read` goes back to the
    /// sender of each surfaced user message.
    pub async fn inbox(&mut self, limit: usize) -> Result<Vec<ReceivedMessage>> {
        self.ensure_connected().await?;
        self.sweep_expired_handshakes().await;

        let raw_messages = self.transport().receive(limit).await?;
        let mut result = Vec::new();
        for raw in raw_messages {
            if let Some(msg) = self.process_inbound(&raw).await? {
                self.send_read_receipt(&msg).await;
                result.push(msg);
            }
        }
        Ok(result)
    }

    // -- Trust management ----------------------------------------------------

    /// Pending handshake requests awaiting a decision.
    pub async fn pending(&mut self) -> Result<Vec<PendingHandshake>> {
        self.ensure_connected().await?;
        self.book().get_pending()
    }

    /// Approve a pending handshake: pin the peer and send
    /// `handshake.accept`.
    pub async fn approve(&mut self, address: &str) -> Result<()> {
        self.ensure_connected().await?;
        let entry = self
            .book()
            .get_pending()?
            .into_iter()
            .find(|pending| pending.address == address)
            .ok_or_else(|| anyhow!("no pending handshake from {address}"))?;

        let card_value: Value = serde_json::from_str(&entry.contact_card)?;
        let card = contact_card_from_value(&card_value)?;
        let peer_vk = deserialize_verify_key(&card.public_key)?;

        self.book_mut().add_contact(
            &card.address,
            &card.public_key,
            TrustState::Pinned,
            ContactUpdate {
                display_name: Some(card.display_name.clone()),
                trust_source: Some("explicit-approval".to_string()),
                relay: Some(card.relay.clone()),
                relays: card.relays.clone(),
            },
        )?;
        self.book_mut().set_pinned_at(&card.address)?;
        self.book_mut().remove_pending(address)?;

        let accept = {
            let identity = self.identity()?;
            self.handshake.make_accept(&identity, address, &peer_vk)?
        };
        self.transport().send(&accept).await?;
        info!(peer = address, "handshake approved");
        Ok(())
    }

    /// Deny a pending handshake: drop it and send `handshake.deny`.
    pub async fn deny(&mut self, address: &str) -> Result<()> {
        self.ensure_connected().await?;
        let entry = self
            .book()
            .get_pending()?
            .into_iter()
            .find(|pending| pending.address == address)
            .ok_or_else(|| anyhow!("no pending handshake from {address}"))?;

        let card_value: Value = serde_json::from_str(&entry.contact_card)?;
        let card = contact_card_from_value(&card_value)?;
        let peer_vk = deserialize_verify_key(&card.public_key)?;

        self.book_mut().remove_pending(address)?;
        let deny = {
            let identity = self.identity()?;
            self.handshake.make_deny(&identity, address, &peer_vk, "denied")?
        };
        self.transport().send(&deny).await?;
        info!(peer = address, "handshake denied");
        Ok(())
    }

    /// Block an exact address or a `*::domain` wildcard.
    pub async fn block(&mut self, pattern: &str) -> Result<()> {
        self.ensure_connected().await?;
        self.book_mut().add_block(pattern)
    }

    pub async fn unblock(&mut self, pattern: &str) -> Result<()> {
        self.ensure_connected().await?;
        self.book_mut().remove_block(pattern)
    }

    // -- Domain verification ---------------------------------------------------

    /// Poll the relay's verify-domain endpoint until it reports
    /// `verified` or `timeout` elapses.
    pub async fn verify_domain(&mut self, domain: &str, timeout: Duration) -> Result<bool> {
        self.ensure_connected().await?;
        let expected = crate::dns::generate_txt_record(&self.public_key(), &self.config.relay_url);
        info!(domain, "expected TXT record at _uam.{domain}: {expected}");

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        let url = format!(
            "{}/api/v1/verify-domain",
            self.config.relay_url.trim_end_matches('/')
        );
        let deadline = Instant::now() + timeout;
        let poll_interval = Duration::from_secs(10);

        loop {
            let attempt = client
                .post(&url)
                .bearer_auth(self.token.as_deref().unwrap_or(""))
                .json(&json!({"domain": domain}))
                .send()
                .await;
            match attempt {
                Ok(response) if response.status().is_success() => {
                    let body: Value = response.json().await.unwrap_or_else(|_| json!({}));
                    if body.get("status").and_then(Value::as_str) == Some("verified") {
                        return Ok(true);
                    }
                }
                Ok(_) | Err(_) => {
                    debug!("verify-domain request failed, retrying");
                }
            }
            if Instant::now() + poll_interval > deadline {
                return Ok(false);
            }
            sleep(poll_interval).await;
        }
    }

    // -- Internals -----------------------------------------------------------

    fn book(&self) -> &ContactBook {
        self.contact_book
            .as_ref()
            .expect("contact book opens during connect")
    }

    fn book_mut(&mut self) -> &mut ContactBook {
        self.contact_book
            .as_mut()
            .expect("contact book opens during connect")
    }

    fn transport(&self) -> &dyn Transport {
        self.transport
            .as_deref()
            .expect("transport opens during connect")
    }

    fn identity(&self) -> Result<HandshakeIdentity<'_>> {
        Ok(HandshakeIdentity {
            address: self.address()?,
            display_name: &self.config.display_name,
            relay_ws_url: &self.relay_ws_url,
            signing_key: self.key_manager.signing_key(),
        })
    }

    async fn ensure_connected(&mut self) -> Result<()> {
        if !self.connected {
            self.connect().await?;
        }
        Ok(())
    }

    /// The TOFU gate: resolve, then branch on trust state.
    ///
    /// For pinned/verified/trusted contacts the stored key is
    /// authoritative, and a re-resolved differing key is a fatal
    /// [`ProtocolError::KeyPinning`] that must interrupt the send. For
    /// unverified/provisional contacts the fresh key replaces the stored
    /// one as `provisional`. Resolution *failures* for known contacts
    /// degrade to the stored key; only a successful resolution can
    /// contradict a pin.
    pub async fn resolve_public_key(&mut self, to_address: &str) -> Result<VerifyingKey> {
        let resolved = self
            .resolver
            .resolve_public_key(to_address, self.token.as_deref(), &self.config.relay_url)
            .await;

        let Some(stored) = self.book().get_public_key(to_address)? else {
            // First sight: the fresh key goes in as provisional.
            let fresh = resolved?;
            self.book_mut().add_contact(
                to_address,
                &fresh,
                TrustState::Provisional,
                ContactUpdate::default(),
            )?;
            return Ok(deserialize_verify_key(&fresh)?);
        };

        let fresh = match resolved {
            Ok(fresh) => fresh,
            Err(err) => {
                warn!(
                    peer = to_address,
                    "resolution failed, using stored key: {err:#}"
                );
                return Ok(deserialize_verify_key(&stored)?);
            }
        };

        let state = self.book().get_trust_state(to_address)?;
        if state.map(TrustState::is_trusted_or_verified).unwrap_or(false) {
            enforce_pinning(to_address, &stored, state, &fresh)?;
            return Ok(deserialize_verify_key(&stored)?);
        }
        if matches!(
            state,
            Some(TrustState::Unverified | TrustState::Provisional) | None
        ) {
            self.book_mut().add_contact(
                to_address,
                &fresh,
                TrustState::Provisional,
                ContactUpdate::default(),
            )?;
            return Ok(deserialize_verify_key(&fresh)?);
        }
        // Mid-handshake and bridge states keep the key the flow started
        // with; the accept (or approval) decides what gets pinned.
        Ok(deserialize_verify_key(&stored)?)
    }

    async fn initiate_handshake(
        &mut self,
        to_address: &str,
        recipient_vk: &VerifyingKey,
    ) -> Result<()> {
        let request = {
            let identity = self.identity()?;
            self.handshake
                .create_handshake_request(&identity, to_address, recipient_vk)?
        };
        self.transport().send(&request).await?;
        self.book_mut().add_contact(
            to_address,
            &serialize_verify_key(recipient_vk),
            TrustState::HandshakeSent,
            ContactUpdate::default(),
        )?;
        debug!(peer = to_address, "handshake request sent");
        Ok(())
    }

    async fn try_send_with_failover(&self, wire: &Value, relay_urls: &[String]) -> Result<()> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        let mut last_error: Option<anyhow::Error> = None;
        for url in relay_urls {
            let send_url = format!("{}/api/v1/send", http_base_of(url));
            let attempt = client
                .post(&send_url)
                .bearer_auth(self.token.as_deref().unwrap_or(""))
                .json(&json!({"envelope": wire}))
                .send()
                .await
                .and_then(|response| response.error_for_status());
            match attempt {
                Ok(_) => {
                    debug!(relay = %url, "envelope sent via failover relay");
                    return Ok(());
                }
                Err(err) => {
                    warn!(relay = %url, "relay failed, trying next: {err}");
                    last_error = Some(err.into());
                }
            }
        }
        Err(last_error.unwrap_or_else(|| anyhow!("no relay URLs to try")))
    }

    /// Verify, decrypt, and classify one inbound envelope. `None` means
    /// the message was protocol traffic, filtered, or invalid.
    async fn process_inbound(&mut self, raw: &Value) -> Result<Option<ReceivedMessage>> {
        let envelope = match from_wire_value(raw) {
            Ok(envelope) => envelope,
            Err(err) => {
                // Relay control receipts are bare dicts, not envelopes.
                let raw_type = raw.get("type").and_then(Value::as_str).unwrap_or("");
                if is_receipt_type(raw_type) || raw_type == "ack" {
                    debug!(msg_type = raw_type, "dropping relay control frame");
                    return Ok(None);
                }
                return Err(err.into());
            }
        };

        // Block check before any crypto.
        if self.book().is_blocked(&envelope.from_address) {
            debug!(from = %envelope.from_address, "dropped message from blocked sender");
            return Ok(None);
        }

        // Sender key for verification, resolving unknown senders.
        let sender_pk = match self.book().get_public_key(&envelope.from_address)? {
            Some(pk) => pk,
            None => {
                match self
                    .resolver
                    .resolve_public_key(
                        &envelope.from_address,
                        self.token.as_deref(),
                        &self.config.relay_url,
                    )
                    .await
                {
                    Ok(pk) => pk,
                    Err(err) => {
                        warn!(
                            from = %envelope.from_address,
                            message_id = %envelope.message_id,
                            "cannot resolve sender key, skipping: {err:#}"
                        );
                        return Ok(None);
                    }
                }
            }
        };
        let sender_vk = deserialize_verify_key(&sender_pk)?;

        // Mandatory signature check; failures are dropped without signal.
        if verify_envelope(&envelope, &sender_vk).is_err() {
            warn!(
                message_id = %envelope.message_id,
                from = %envelope.from_address,
                "invalid signature on inbound message, rejecting"
            );
            return Ok(None);
        }

        // Handshake protocol messages are consumed here.
        if envelope.message_type.starts_with("handshake.") {
            let reply = {
                let identity = HandshakeIdentity {
                    address: self.address.as_deref().expect("connected"),
                    display_name: &self.config.display_name,
                    relay_ws_url: &self.relay_ws_url,
                    signing_key: self.key_manager.signing_key(),
                };
                self.handshake.handle_inbound(
                    self.contact_book.as_mut().expect("connected"),
                    &identity,
                    &envelope,
                    &sender_vk,
                )?
            };
            if let Some(reply) = reply {
                self.transport().send(&reply).await?;
            }
            return Ok(None);
        }

        // Gate unapproved senders under strict policies.
        if self.handshake.policy() != TrustPolicy::AutoAccept
            && !self.book().is_trusted_or_verified(&envelope.from_address)?
        {
            info!(
                from = %envelope.from_address,
                policy = self.handshake.policy().as_str(),
                "filtered message from unapproved sender"
            );
            return Ok(None);
        }

        // Mandatory decryption; failures are dropped without signal.
        let plaintext = match decrypt_payload(
            &envelope.payload,
            self.key_manager.signing_key(),
            &sender_vk,
        ) {
            Ok(plaintext) => plaintext,
            Err(_) => {
                warn!(
                    message_id = %envelope.message_id,
                    from = %envelope.from_address,
                    "decryption failed, skipping"
                );
                return Ok(None);
            }
        };

        Ok(Some(ReceivedMessage {
            message_id: envelope.message_id,
            from_address: envelope.from_address,
            to_address: envelope.to_address,
            content: String::from_utf8_lossy(&plaintext).into_owned(),
            timestamp: envelope.timestamp,
            message_type: envelope.message_type,
            thread_id: envelope.thread_id,
            reply_to: envelope.reply_to,
            media_type: envelope.media_type,
            verified: true,
        }))
    }

    /// Fire-and-forget `receipt.read` to the sender of a surfaced user
    /// message. Protocol messages never generate receipts (anti-loop).
    async fn send_read_receipt(&mut self, msg: &ReceivedMessage) {
        if is_protocol_type(&msg.message_type) {
            return;
        }
        let result: Result<()> = async {
            let Some(sender_pk) = self.book().get_public_key(&msg.from_address)? else {
                debug!(to = %msg.from_address, "no key for read receipt, skipping");
                return Ok(());
            };
            let sender_vk = deserialize_verify_key(&sender_pk)?;
            let payload = json!({"message_id": msg.message_id}).to_string();
            let envelope = create_envelope(
                self.address()?,
                &msg.from_address,
                MessageType::ReceiptRead,
                payload.as_bytes(),
                self.key_manager.signing_key(),
                &sender_vk,
                EnvelopeOptions::default(),
            )?;
            self.transport().send(&to_wire_value(&envelope)).await
        }
        .await;
        if let Err(err) = result {
            debug!(to = %msg.from_address, "failed to send receipt.read: {err:#}");
        }
    }

    /// Drop pending handshakes past their TTL, telling the original
    /// requester via `receipt.failed`. Failures to notify never block
    /// the sweep.
    async fn sweep_expired_handshakes(&mut self) {
        let expired = match self.book().get_expired_pending(PENDING_HANDSHAKE_TTL_DAYS) {
            Ok(expired) => expired,
            Err(err) => {
                warn!("failed to list expired handshakes: {err:#}");
                return;
            }
        };
        for entry in expired {
            let notify: Result<()> = async {
                let card_value: Value = serde_json::from_str(&entry.contact_card)?;
                let card = contact_card_from_value(&card_value)?;
                let peer_vk = deserialize_verify_key(&card.public_key)?;
                let mut payload = Map::new();
                payload.insert("reason".into(), json!("handshake_expired"));
                payload.insert("original_from".into(), json!(entry.address));
                let envelope = create_envelope(
                    self.address()?,
                    &entry.address,
                    MessageType::ReceiptFailed,
                    Value::Object(payload).to_string().as_bytes(),
                    self.key_manager.signing_key(),
                    &peer_vk,
                    EnvelopeOptions::default(),
                )?;
                self.transport().send(&to_wire_value(&envelope)).await?;
                info!(peer = %entry.address, "sent receipt.failed (handshake_expired)");
                Ok(())
            }
            .await;
            if let Err(err) = notify {
                warn!(peer = %entry.address, "failed to send receipt.failed: {err:#}");
            }
            if let Err(err) = self.book_mut().remove_pending(&entry.address) {
                warn!(peer = %entry.address, "failed to drop expired handshake: {err:#}");
            }
        }
    }
}

/// The TOFU comparison: a pinned/verified/trusted stored key that
/// disagrees with a freshly resolved key is fatal — never retried, never
/// swallowed.
pub(crate) fn enforce_pinning(
    address: &str,
    stored: &str,
    state: Option<TrustState>,
    fresh: &str,
) -> Result<(), ProtocolError> {
    if state.map(TrustState::is_trusted_or_verified).unwrap_or(false) && stored != fresh {
        return Err(ProtocolError::KeyPinning {
            address: address.to_string(),
            pinned: fingerprint_of(stored),
            observed: fingerprint_of(fresh),
        });
    }
    Ok(())
}

fn fingerprint_of(public_key_b64: &str) -> String {
    deserialize_verify_key(public_key_b64)
        .map(|vk| public_key_fingerprint(&vk))
        .unwrap_or_else(|_| public_key_b64.to_string())
}

fn http_base_of(relay_url: &str) -> String {
    let mut base = relay_url.trim_end_matches('/').to_string();
    if let Some(stripped) = base.strip_suffix("/ws") {
        base = stripped.to_string();
    }
    if let Some(rest) = base.strip_prefix("wss://") {
        base = format!("https://{rest}");
    } else if let Some(rest) = base.strip_prefix("ws://") {
        base = format!("http://{rest}");
    }
    base
}

#[cfg(test)]
#[path = "agent_tests.rs"]
mod tests;
