use std::env;
use std::path::PathBuf;

use super::handshake::TrustPolicy;

/// Agent-side configuration. Construct with [`SdkConfig::new`] and adjust
/// fields before handing it to `Agent::new`; unset values fall back to
/// `UAM_*` environment variables, then defaults.
#[derive(Debug, Clone)]
pub struct SdkConfig {
    pub name: String,
    /// HTTP base URL of the agent's relay, e.g. `https://relay.example.com`.
    pub relay_url: String,
    /// Domain half of the agent's address.
    pub relay_domain: String,
    /// Directory for `<name>.key` / `<name>.token`.
    pub key_dir: PathBuf,
    /// Directory for the contact book.
    pub data_dir: PathBuf,
    pub display_name: String,
    pub trust_policy: TrustPolicy,
    pub auto_register: bool,
}

impl SdkConfig {
    pub fn new(name: &str) -> Self {
        let home = uam_home();
        let relay_url = env::var("UAM_RELAY_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "http://localhost:8420".to_string());
        let relay_domain = env::var("UAM_RELAY_DOMAIN")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| domain_from_url(&relay_url));
        Self {
            name: name.to_lowercase(),
            relay_url,
            relay_domain,
            key_dir: home.join("keys"),
            data_dir: home,
            display_name: name.to_string(),
            trust_policy: TrustPolicy::AutoAccept,
            auto_register: true,
        }
    }

    /// The relay's WebSocket URL, advertised on contact cards.
    pub fn relay_ws_url(&self) -> String {
        let base = self.relay_url.trim_end_matches('/');
        let ws = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        format!("{ws}/ws")
    }
}

fn uam_home() -> PathBuf {
    if let Ok(root) = env::var("UAM_HOME")
        && !root.trim().is_empty()
    {
        return PathBuf::from(root);
    }
    let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".uam")
}

fn domain_from_url(url: &str) -> String {
    url.parse::<reqwest::Url>()
        .ok()
        .and_then(|parsed| parsed.host_str().map(str::to_lowercase))
        .unwrap_or_else(|| "localhost".to_string())
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
