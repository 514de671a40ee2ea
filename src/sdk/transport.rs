//! The relay transport seam. The SDK ships the HTTP transport (REST send
//! + inbox polling); tests plug in loopback implementations, and a live
//! WebSocket transport would implement the same trait.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde_json::{Value, json};

#[async_trait]
pub trait Transport: Send + Sync {
    /// Submit a wire envelope to the relay.
    async fn send(&self, wire: &Value) -> Result<()>;

    /// Fetch up to `limit` pending wire envelopes.
    async fn receive(&self, limit: usize) -> Result<Vec<Value>>;
}

pub struct HttpTransport {
    client: reqwest::Client,
    relay_url: String,
    token: String,
    address: String,
}

impl HttpTransport {
    pub fn new(relay_url: &str, token: &str, address: &str) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .expect("transport HTTP client builds"),
            relay_url: relay_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            address: address.to_string(),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, wire: &Value) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/api/v1/send", self.relay_url))
            .bearer_auth(&self.token)
            .json(&json!({"envelope": wire}))
            .send()
            .await
            .context("relay send request failed")?;
        if !response.status().is_success() {
            let status = response.status();
            let body: Value = response.json().await.unwrap_or_else(|_| json!({}));
            let detail = body
                .get("detail")
                .and_then(Value::as_str)
                .unwrap_or("no detail");
            bail!("relay rejected send ({status}): {detail}");
        }
        Ok(())
    }

    async fn receive(&self, limit: usize) -> Result<Vec<Value>> {
        let response = self
            .client
            .get(format!(
                "{}/api/v1/inbox/{}?limit={limit}",
                self.relay_url, self.address
            ))
            .bearer_auth(&self.token)
            .send()
            .await
            .context("relay inbox request failed")?
            .error_for_status()
            .context("relay inbox request rejected")?;
        let body: Value = response.json().await?;
        Ok(body
            .get("messages")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }
}
