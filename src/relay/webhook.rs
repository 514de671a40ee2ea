//! Webhook delivery: HMAC signing, SSRF-safe URL validation, retries with
//! a per-agent circuit breaker.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::protocol::types::is_protocol_type;

use super::connections::ConnectionManager;
use super::delivery::delivered_receipt;
use super::storage::Storage;

/// Retry delays: immediate, 5 s, 5 min, 30 min, 2 h.
pub const RETRY_DELAYS: [Duration; 5] = [
    Duration::from_secs(0),
    Duration::from_secs(5),
    Duration::from_secs(300),
    Duration::from_secs(1800),
    Duration::from_secs(7200),
];

const FAILURE_THRESHOLD: u32 = 5;

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 over the compact JSON payload, keyed by the agent's bearer
/// token. Rendered as `sha256=<hex>` for the `X-UAM-Signature` header.
pub fn compute_webhook_signature(payload: &[u8], token: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(token.as_bytes()).expect("HMAC accepts any key length");
    mac.update(payload);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

// ---------------------------------------------------------------------------
// URL validation (SSRF defense)
// ---------------------------------------------------------------------------

fn is_public_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_documentation()
                // CGNAT 100.64.0.0/10
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xc0) == 64))
        }
        IpAddr::V6(v6) => {
            !(v6.is_loopback()
                || v6.is_unspecified()
                // Unique local fc00::/7
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                // Link local fe80::/10
                || (v6.segments()[0] & 0xffc0) == 0xfe80)
        }
    }
}

/// Validate a webhook URL: https only, and the host must resolve to
/// public addresses exclusively. Re-run before every delivery attempt as
/// a TOCTOU defense.
pub async fn validate_webhook_url(url: &str) -> Result<(), String> {
    let parsed: reqwest::Url = url.parse().map_err(|_| "not a valid URL".to_string())?;
    if parsed.scheme() != "https" {
        return Err(format!("scheme must be https, got '{}'", parsed.scheme()));
    }
    let Some(host) = parsed.host_str() else {
        return Err("URL has no host".to_string());
    };
    if let Ok(ip) = host.parse::<IpAddr>() {
        if !is_public_ip(ip) {
            return Err(format!("host resolves to non-public address {ip}"));
        }
        return Ok(());
    }
    let port = parsed.port_or_known_default().unwrap_or(443);
    let addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|err| format!("DNS resolution failed: {err}"))?;
    let mut any = false;
    for addr in addrs {
        any = true;
        if !is_public_ip(addr.ip()) {
            return Err(format!("host resolves to non-public address {}", addr.ip()));
        }
    }
    if !any {
        return Err("host resolved to no addresses".to_string());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
struct CircuitState {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Per-agent circuit breaker. Five consecutive exhausted deliveries open
/// the circuit; it half-opens after the cooldown, and one success closes
/// it again. Monotonic clock, so wall-clock adjustments cannot flip state.
pub struct WebhookCircuitBreaker {
    cooldown: Duration,
    circuits: Mutex<HashMap<String, CircuitState>>,
}

impl WebhookCircuitBreaker {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            circuits: Mutex::new(HashMap::new()),
        }
    }

    /// Whether delivery should be attempted for `address`.
    pub fn is_available(&self, address: &str) -> bool {
        let circuits = self.circuits.lock().expect("circuit breaker lock");
        match circuits.get(address).and_then(|s| s.opened_at) {
            None => true,
            Some(opened_at) => {
                let expired = opened_at.elapsed() >= self.cooldown;
                if expired {
                    info!(agent = address, "circuit cooldown expired, allowing probe");
                }
                expired
            }
        }
    }

    pub fn record_success(&self, address: &str) {
        let mut circuits = self.circuits.lock().expect("circuit breaker lock");
        let state = circuits.entry(address.to_string()).or_default();
        state.consecutive_failures = 0;
        if state.opened_at.take().is_some() {
            info!(agent = address, "circuit closed after successful delivery");
        }
    }

    pub fn record_failure(&self, address: &str) {
        let mut circuits = self.circuits.lock().expect("circuit breaker lock");
        let state = circuits.entry(address.to_string()).or_default();
        state.consecutive_failures += 1;
        if state.opened_at.is_none() && state.consecutive_failures >= FAILURE_THRESHOLD {
            state.opened_at = Some(Instant::now());
            warn!(
                agent = address,
                failures = state.consecutive_failures,
                "circuit OPEN"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Delivery service
// ---------------------------------------------------------------------------

enum AttemptOutcome {
    Success,
    Retriable(String),
    Fatal(String),
}

pub struct WebhookDeliveryService {
    storage: Arc<Storage>,
    breaker: Arc<WebhookCircuitBreaker>,
    manager: Arc<ConnectionManager>,
    client: reqwest::Client,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl WebhookDeliveryService {
    pub fn new(
        storage: Arc<Storage>,
        breaker: Arc<WebhookCircuitBreaker>,
        manager: Arc<ConnectionManager>,
        cancel: CancellationToken,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .expect("webhook HTTP client builds");
        Self {
            storage,
            breaker,
            manager,
            client,
            tracker: TaskTracker::new(),
            cancel,
        }
    }

    /// Attempt webhook delivery for `address`. Returns `true` if a
    /// background delivery task was scheduled — not that it succeeded.
    pub async fn try_deliver(self: &Arc<Self>, address: &str, wire: &Value) -> bool {
        if !self.breaker.is_available(address) {
            debug!(agent = address, "circuit open, skipping webhook");
            return false;
        }
        let agent = match self.storage.get_agent_with_webhook(address).await {
            Ok(Some(agent)) => agent,
            Ok(None) => return false,
            Err(err) => {
                error!(agent = address, "webhook agent lookup failed: {err:#}");
                return false;
            }
        };
        let webhook_url = agent.webhook_url.expect("query filters NULL webhook_url");

        let envelope_json = wire.to_string();
        let message_id = wire
            .get("message_id")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let delivery_id = match self
            .storage
            .create_webhook_delivery(address, &message_id, &envelope_json)
            .await
        {
            Ok(id) => id,
            Err(err) => {
                error!(agent = address, "failed to record webhook delivery: {err:#}");
                return false;
            }
        };

        let service = Arc::clone(self);
        let address = address.to_string();
        let wire = wire.clone();
        self.tracker.spawn(async move {
            service
                .deliver_with_retries(&address, &wire, &webhook_url, &agent.token, delivery_id)
                .await;
        });
        true
    }

    /// Cancel in-flight deliveries and wait for their tasks. Interrupted
    /// deliveries stay `in_progress`; boot recovery re-queues them.
    pub async fn shutdown(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }

    async fn deliver_with_retries(
        &self,
        address: &str,
        wire: &Value,
        webhook_url: &str,
        token: &str,
        delivery_id: i64,
    ) {
        let payload = wire.to_string().into_bytes();
        let signature = compute_webhook_signature(&payload, token);

        for (index, delay) in RETRY_DELAYS.iter().enumerate() {
            let attempt = (index + 1) as u32;
            if !delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(*delay) => {}
                    _ = self.cancel.cancelled() => return,
                }
            }
            if self.cancel.is_cancelled() {
                return;
            }

            // TOCTOU re-validation: the URL may have become dangerous
            // between registration and this attempt.
            if let Err(reason) = validate_webhook_url(webhook_url).await {
                warn!(agent = address, %reason, "webhook URL re-validation failed");
                self.complete(delivery_id, "failed", Some(&format!("URL re-validation failed: {reason}")))
                    .await;
                return;
            }

            match self.attempt(address, webhook_url, &payload, &signature, attempt, delivery_id).await {
                AttemptOutcome::Success => {
                    info!(agent = address, attempt, "webhook delivery succeeded");
                    self.complete(delivery_id, "succeeded", None).await;
                    self.breaker.record_success(address);
                    self.emit_delivered_receipt(address, wire).await;
                    return;
                }
                AttemptOutcome::Fatal(reason) => {
                    warn!(agent = address, %reason, "webhook delivery non-retriable");
                    self.complete(delivery_id, "failed", Some(&reason)).await;
                    return;
                }
                AttemptOutcome::Retriable(reason) => {
                    debug!(
                        agent = address,
                        attempt,
                        total = RETRY_DELAYS.len(),
                        %reason,
                        "webhook attempt failed, will retry"
                    );
                }
            }
        }

        warn!(
            agent = address,
            retries = RETRY_DELAYS.len(),
            "webhook delivery exhausted all retries"
        );
        self.complete(delivery_id, "failed", Some("all retries exhausted"))
            .await;
        self.breaker.record_failure(address);
    }

    async fn attempt(
        &self,
        address: &str,
        webhook_url: &str,
        payload: &[u8],
        signature: &str,
        attempt: u32,
        delivery_id: i64,
    ) -> AttemptOutcome {
        let response = self
            .client
            .post(webhook_url)
            .header("Content-Type", "application/json")
            .header("X-UAM-Signature", signature)
            .header("User-Agent", concat!("UAM-Relay/", env!("CARGO_PKG_VERSION")))
            .body(payload.to_vec())
            .send()
            .await;

        match response {
            Ok(resp) => {
                let status = resp.status().as_u16();
                if let Err(err) = self
                    .storage
                    .update_webhook_delivery_attempt(delivery_id, attempt, Some(status), None)
                    .await
                {
                    error!(agent = address, "failed to record webhook attempt: {err:#}");
                }
                match status {
                    200..=299 => AttemptOutcome::Success,
                    408 | 429 => AttemptOutcome::Retriable(format!("HTTP {status}")),
                    400..=499 => AttemptOutcome::Fatal(format!("non-retriable HTTP {status}")),
                    _ => AttemptOutcome::Retriable(format!("HTTP {status}")),
                }
            }
            Err(err) => {
                let reason = format!("network error: {err}");
                if let Err(db_err) = self
                    .storage
                    .update_webhook_delivery_attempt(delivery_id, attempt, None, Some(&reason))
                    .await
                {
                    error!(agent = address, "failed to record webhook attempt: {db_err:#}");
                }
                AttemptOutcome::Retriable(reason)
            }
        }
    }

    async fn complete(&self, delivery_id: i64, status: &str, error_msg: Option<&str>) {
        if let Err(err) = self
            .storage
            .complete_webhook_delivery(delivery_id, status, error_msg)
            .await
        {
            error!(delivery_id, "failed to finalize webhook delivery: {err:#}");
        }
    }

    /// Emit `receipt.delivered` to the original sender's live session —
    /// never for protocol payloads (anti-loop).
    async fn emit_delivered_receipt(&self, recipient: &str, wire: &Value) {
        let msg_type = wire.get("type").and_then(Value::as_str).unwrap_or("");
        let Some(original_from) = wire.get("from").and_then(Value::as_str) else {
            return;
        };
        if is_protocol_type(msg_type) {
            return;
        }
        let message_id = wire.get("message_id").and_then(Value::as_str).unwrap_or("");
        let receipt = delivered_receipt(message_id, recipient);
        self.manager.send_to(original_from, receipt).await;
    }
}

#[cfg(test)]
#[path = "webhook_tests.rs"]
mod tests;
