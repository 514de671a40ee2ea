//! Recipient key resolution, tiered: local relay lookup, remote-domain
//! HTTPS/DNS lookup, then a pluggable on-chain namespace. Tier 2/3 hits
//! are cached with a TTL and can be invalidated.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use hickory_resolver::TokioResolver;
use serde_json::Value;
use tracing::{debug, warn};

use crate::dns::lookup_txt_identity;
use crate::protocol::address::parse_address;

const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

/// Resolves an address to a base64 Ed25519 public key.
#[async_trait]
pub trait AddressResolver: Send + Sync {
    async fn resolve_public_key(
        &self,
        address: &str,
        token: Option<&str>,
        relay_url: &str,
    ) -> Result<String>;
}

/// Tier-3 backend: resolves a bare (dot-free) namespace name to a public
/// key. The crate mandates no particular chain; register an
/// implementation on [`SmartResolver`] to enable tier 3.
#[async_trait]
pub trait Tier3Resolver: Send + Sync {
    async fn resolve(&self, name: &str) -> Result<String>;
}

/// Tiered resolver:
///
/// 1. target domain == own domain → authenticated lookup at the local relay
/// 2. dotted domain → the target relay's HTTPS surface, DNS TXT fallback
/// 3. dot-free domain → the registered [`Tier3Resolver`]
pub struct SmartResolver {
    own_domain: String,
    client: reqwest::Client,
    tier3: Option<Arc<dyn Tier3Resolver>>,
    cache: Mutex<HashMap<String, (String, Instant)>>,
    cache_ttl: Duration,
}

impl SmartResolver {
    pub fn new(own_domain: &str) -> Self {
        Self {
            own_domain: own_domain.to_lowercase(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("resolver HTTP client builds"),
            tier3: None,
            cache: Mutex::new(HashMap::new()),
            cache_ttl: DEFAULT_CACHE_TTL,
        }
    }

    pub fn with_tier3(mut self, tier3: Arc<dyn Tier3Resolver>) -> Self {
        self.tier3 = Some(tier3);
        self
    }

    /// Drop one cached resolution.
    pub fn invalidate(&self, address: &str) {
        self.cache.lock().expect("resolver cache lock").remove(address);
    }

    /// Drop the whole cache.
    pub fn invalidate_all(&self) {
        self.cache.lock().expect("resolver cache lock").clear();
    }

    fn cache_get(&self, key: &str) -> Option<String> {
        let cache = self.cache.lock().expect("resolver cache lock");
        cache.get(key).and_then(|(value, stored_at)| {
            (stored_at.elapsed() < self.cache_ttl).then(|| value.clone())
        })
    }

    fn cache_put(&self, key: &str, value: &str) {
        self.cache
            .lock()
            .expect("resolver cache lock")
            .insert(key.to_string(), (value.to_string(), Instant::now()));
    }

    async fn resolve_tier1(
        &self,
        address: &str,
        token: Option<&str>,
        relay_url: &str,
    ) -> Result<String> {
        let url = format!(
            "{}/api/v1/agents/{address}/public-key",
            relay_url.trim_end_matches('/')
        );
        let mut request = self.client.get(&url);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.context("tier-1 relay lookup failed")?;
        if response.status().as_u16() == 404 {
            bail!("no agent registered at {address}");
        }
        let body: Value = response
            .error_for_status()
            .context("tier-1 relay lookup rejected")?
            .json()
            .await?;
        body.get("public_key")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| anyhow!("relay response missing public_key"))
    }

    async fn resolve_tier2(&self, address: &str, domain: &str) -> Result<String> {
        if let Some(cached) = self.cache_get(address) {
            debug!(address, "tier-2 cache hit");
            return Ok(cached);
        }

        // The target relay's own lookup surface first.
        let url = format!("https://{domain}/api/v1/agents/{address}/public-key");
        match self.fetch_public_key(&url).await {
            Ok(key) => {
                self.cache_put(address, &key);
                return Ok(key);
            }
            Err(err) => {
                debug!(address, "tier-2 HTTPS lookup failed, trying DNS TXT: {err:#}");
            }
        }

        // DNS TXT fallback: the domain-level identity record.
        match TokioResolver::builder_tokio() {
            Ok(builder) => {
                let resolver = builder.build();
                if let Some(identity) = lookup_txt_identity(&resolver, domain).await {
                    self.cache_put(address, &identity.public_key);
                    return Ok(identity.public_key);
                }
            }
            Err(err) => warn!("system DNS config unavailable: {err}"),
        }
        bail!("tier-2 resolution failed for {address}");
    }

    async fn fetch_public_key(&self, url: &str) -> Result<String> {
        let body: Value = self
            .client
            .get(url)
            .timeout(Duration::from_secs(10))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        body.get("public_key")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| anyhow!("response missing public_key"))
    }

    async fn resolve_tier3(&self, address: &str, name: &str) -> Result<String> {
        if let Some(cached) = self.cache_get(address) {
            debug!(address, "tier-3 cache hit");
            return Ok(cached);
        }
        let Some(tier3) = &self.tier3 else {
            bail!("no tier-3 resolver registered for dot-free domain in {address}");
        };
        let key = tier3.resolve(name).await?;
        if key.is_empty() {
            bail!("tier-3 resolver returned an empty key for {name}");
        }
        self.cache_put(address, &key);
        Ok(key)
    }
}

#[async_trait]
impl AddressResolver for SmartResolver {
    async fn resolve_public_key(
        &self,
        address: &str,
        token: Option<&str>,
        relay_url: &str,
    ) -> Result<String> {
        let parsed = parse_address(address)?;
        if parsed.domain() == self.own_domain {
            self.resolve_tier1(address, token, relay_url).await
        } else if parsed.domain().contains('.') {
            self.resolve_tier2(address, parsed.domain()).await
        } else {
            self.resolve_tier3(address, parsed.domain()).await
        }
    }
}

#[cfg(test)]
#[path = "resolver_tests.rs"]
mod tests;
