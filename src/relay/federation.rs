//! Relay-to-relay federation: discovery, signed forwarding, and inbound
//! verification with loop and replay protection.
//!
//! Discovery order: `known_relays` cache while fresh, then DNS SRV at
//! `_uam._tcp.<domain>` (public key fetched from the SRV target's
//! well-known document), then `https://<domain>/.well-known/uam-relay.json`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use ed25519_dalek::SigningKey;
use hickory_resolver::TokioResolver;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::protocol::address::domain_of;
use crate::protocol::crypto::{
    canonicalize, deserialize_verify_key, serialize_verify_key, sign_message, verify_signature,
};
use crate::protocol::envelope::from_wire_value;
use crate::protocol::types::{parse_timestamp, utc_timestamp};

use super::errors::ApiError;
use super::models::{FederationDeliverRequest, WellKnownRelay};
use super::storage::Storage;

/// Outbound retry backoff: 5 s, 30 s, 5 min, 30 min, 2 h.
pub const RETRY_SCHEDULE_SECONDS: [i64; 5] = [5, 30, 300, 1800, 7200];

/// Relay-hop freshness window: inbound bodies must carry a timestamp
/// within this many seconds of our clock.
pub const FRESHNESS_WINDOW_SECONDS: i64 = 300;

#[derive(Debug, Clone)]
pub struct ForwardResult {
    pub delivered: bool,
    pub queued: bool,
    pub error: Option<String>,
}

impl ForwardResult {
    fn failed(error: impl Into<String>) -> Self {
        Self {
            delivered: false,
            queued: false,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelayInfo {
    pub domain: String,
    pub federation_url: String,
    pub public_key: String,
}

/// Sign a federation request body with the relay's key.
pub fn sign_federation_request(body: &Value, signing_key: &SigningKey) -> String {
    sign_message(&canonicalize(body), signing_key)
}

/// Verify a federation request body against a peer's known key.
pub fn verify_federation_request(
    body: &Value,
    signature_b64: &str,
    peer_public_key_b64: &str,
) -> Result<(), ApiError> {
    let peer_vk = deserialize_verify_key(peer_public_key_b64)
        .map_err(|_| ApiError::unauthorized("peer relay key is invalid"))?;
    verify_signature(&canonicalize(body), signature_b64, &peer_vk)
        .map_err(|_| ApiError::unauthorized("federation signature verification failed"))
}

pub struct FederationService {
    storage: Arc<Storage>,
    relay_domain: String,
    discovery_ttl_hours: i64,
    signing_key: SigningKey,
    client: reqwest::Client,
    resolver: Option<TokioResolver>,
}

impl FederationService {
    pub fn new(
        storage: Arc<Storage>,
        relay_domain: String,
        discovery_ttl_hours: i64,
        signing_key: SigningKey,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("federation HTTP client builds");
        let resolver = match TokioResolver::builder_tokio() {
            Ok(builder) => Some(builder.build()),
            Err(err) => {
                warn!("system DNS config unavailable, SRV discovery disabled: {err}");
                None
            }
        };
        Self {
            storage,
            relay_domain,
            discovery_ttl_hours,
            signing_key,
            client,
            resolver,
        }
    }

    pub fn public_key_b64(&self) -> String {
        serialize_verify_key(&self.signing_key.verifying_key())
    }

    // -- Discovery -----------------------------------------------------------

    /// Discover a remote relay's federation endpoint and key. Never
    /// errors: total failure returns `None`.
    pub async fn discover_relay(&self, domain: &str) -> Option<RelayInfo> {
        // Fresh cache entry wins.
        if self.storage.known_relay_is_fresh(domain).await.unwrap_or(false)
            && let Ok(Some(cached)) = self.storage.get_known_relay(domain).await
        {
            return Some(RelayInfo {
                domain: cached.domain,
                federation_url: cached.federation_url,
                public_key: cached.public_key,
            });
        }

        // DNS SRV, with the public key from the SRV target's well-known.
        if let Some((target, port)) = self.discover_via_dns_srv(domain).await {
            let federation_url = format!("https://{target}:{port}/api/v1/federation/deliver");
            if let Some(public_key) = self.fetch_well_known_key(&target, port).await {
                if let Err(err) = self
                    .storage
                    .upsert_known_relay(
                        domain,
                        &federation_url,
                        &public_key,
                        "dns-srv",
                        self.discovery_ttl_hours,
                    )
                    .await
                {
                    warn!(domain, "failed to cache discovered relay: {err:#}");
                }
                return Some(RelayInfo {
                    domain: domain.to_string(),
                    federation_url,
                    public_key,
                });
            }
        }

        // Fallback: well-known at the domain itself.
        if let Some(well_known) = self.discover_via_well_known(domain).await {
            if let Err(err) = self
                .storage
                .upsert_known_relay(
                    domain,
                    &well_known.federation_endpoint,
                    &well_known.public_key,
                    "well-known",
                    self.discovery_ttl_hours,
                )
                .await
            {
                warn!(domain, "failed to cache discovered relay: {err:#}");
            }
            return Some(RelayInfo {
                domain: domain.to_string(),
                federation_url: well_known.federation_endpoint,
                public_key: well_known.public_key,
            });
        }

        warn!(domain, "federation discovery failed");
        None
    }

    async fn discover_via_dns_srv(&self, domain: &str) -> Option<(String, u16)> {
        let resolver = self.resolver.as_ref()?;
        let name = format!("_uam._tcp.{domain}.");
        let lookup = tokio::time::timeout(Duration::from_secs(10), resolver.srv_lookup(name))
            .await
            .ok()?
            .ok()?;
        let best = lookup
            .iter()
            .min_by_key(|record| (record.priority(), std::cmp::Reverse(record.weight())))?;
        let target = best.target().to_utf8().trim_end_matches('.').to_string();
        info!(domain, host = %target, port = best.port(), "DNS SRV discovery hit");
        Some((target, best.port()))
    }

    async fn fetch_well_known_key(&self, host: &str, port: u16) -> Option<String> {
        let url = format!("https://{host}:{port}/.well-known/uam-relay.json");
        let doc: Value = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .ok()?
            .error_for_status()
            .ok()?
            .json()
            .await
            .ok()?;
        doc.get("public_key")
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    async fn discover_via_well_known(&self, domain: &str) -> Option<WellKnownRelay> {
        let url = format!("https://{domain}/.well-known/uam-relay.json");
        let doc: Value = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .ok()?
            .error_for_status()
            .ok()?
            .json()
            .await
            .ok()?;
        let federation_endpoint = doc.get("federation_endpoint").and_then(Value::as_str)?;
        let public_key = doc.get("public_key").and_then(Value::as_str)?;
        Some(WellKnownRelay {
            federation_endpoint: federation_endpoint.to_string(),
            public_key: public_key.to_string(),
        })
    }

    // -- Outbound ------------------------------------------------------------

    /// Forward an envelope to the relay that owns its recipient domain.
    pub async fn forward(
        &self,
        wire: &Value,
        from_relay: &str,
        via: &[String],
        hop_count: u32,
    ) -> ForwardResult {
        let to_address = wire.get("to").and_then(Value::as_str).unwrap_or("");
        let Some(target_domain) = domain_of(to_address) else {
            return ForwardResult::failed("invalid_to_address");
        };
        let target_domain = target_domain.to_string();

        let Some(relay_info) = self.discover_relay(&target_domain).await else {
            return ForwardResult::failed("discovery_failed");
        };

        let mut full_via: Vec<String> = via.to_vec();
        full_via.push(from_relay.to_string());
        let body = json!({
            "envelope": wire,
            "via": full_via,
            "hop_count": hop_count + 1,
            "timestamp": utc_timestamp(),
            "from_relay": from_relay,
        });
        let signature = sign_federation_request(&body, &self.signing_key);

        let message_id = wire
            .get("message_id")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();

        let response = self
            .client
            .post(&relay_info.federation_url)
            .header("X-UAM-Relay-Signature", signature)
            .header("X-UAM-Relay-Domain", from_relay)
            .json(&body)
            .send()
            .await;

        let (status, error) = match response {
            Ok(resp) if resp.status().is_success() => ("delivered", None),
            Ok(resp) => {
                let code = resp.status().as_u16();
                let text = resp.text().await.unwrap_or_default();
                let detail: String = text.chars().take(200).collect();
                ("failed", Some(format!("HTTP {code}: {detail}")))
            }
            Err(err) => ("failed", Some(format!("request error: {err}"))),
        };

        if let Err(err) = self
            .storage
            .log_federation(
                &message_id,
                from_relay,
                &target_domain,
                "outbound",
                hop_count + 1,
                status,
                error.as_deref(),
            )
            .await
        {
            warn!(domain = %target_domain, "failed to log federation event: {err:#}");
        }

        match error {
            None => ForwardResult {
                delivered: true,
                queued: false,
                error: None,
            },
            Some(error) => ForwardResult::failed(error),
        }
    }

    // -- Inbound verification ---------------------------------------------------

    /// Run the pre-delivery inbound checks: peer identity, signature,
    /// freshness, loop, hop count, destination domain. Returns the parsed
    /// request on success.
    pub async fn verify_inbound(
        &self,
        peer_domain: &str,
        signature_b64: &str,
        raw_body: &Value,
        max_hops: u32,
    ) -> Result<FederationDeliverRequest, ApiError> {
        // 1. The peer must be known (or discoverable right now).
        let peer_key = match self.storage.get_known_relay(peer_domain).await {
            Ok(Some(relay)) => relay.public_key,
            Ok(None) => match self.discover_relay(peer_domain).await {
                Some(info) => info.public_key,
                None => {
                    return Err(ApiError::unauthorized(format!(
                        "unknown peer relay: {peer_domain}"
                    )));
                }
            },
            Err(err) => return Err(err.into()),
        };

        // 2. Body signature.
        verify_federation_request(raw_body, signature_b64, &peer_key)?;

        let request: FederationDeliverRequest = serde_json::from_value(raw_body.clone())
            .map_err(|err| ApiError::bad_request(format!("malformed federation body: {err}")))?;

        // 3. Freshness window.
        let Some(sent_at) = parse_timestamp(&request.timestamp) else {
            return Err(ApiError::bad_request("unparseable federation timestamp"));
        };
        let skew = (Utc::now() - sent_at).num_seconds().abs();
        if skew > FRESHNESS_WINDOW_SECONDS {
            return Err(ApiError::bad_request(format!(
                "stale federation timestamp ({skew}s outside ±{FRESHNESS_WINDOW_SECONDS}s window)"
            )));
        }

        // 4. Loop protection via the relay chain.
        if request.via.iter().any(|hop| hop == &self.relay_domain) {
            return Err(ApiError::bad_request(format!(
                "Loop detected: {} already in via chain",
                self.relay_domain
            )));
        }

        // 5. Hop budget.
        if request.hop_count >= max_hops {
            return Err(ApiError::bad_request(format!(
                "hop count {} exceeds maximum {max_hops}",
                request.hop_count
            )));
        }

        // 6. We must be the destination.
        let envelope = from_wire_value(&request.envelope)
            .map_err(|err| ApiError::invalid_envelope(err.to_string()))?;
        match domain_of(&envelope.to_address) {
            Some(domain) if domain == self.relay_domain => {}
            other => {
                return Err(ApiError::bad_request(format!(
                    "envelope destined for {:?}, not {}",
                    other, self.relay_domain
                )));
            }
        }

        debug!(
            peer = peer_domain,
            hops = request.hop_count,
            "federation inbound verified"
        );
        Ok(request)
    }
}

#[cfg(test)]
#[path = "federation_tests.rs"]
mod tests;
