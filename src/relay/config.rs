use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Relay settings, sourced from `UAM_*` environment variables with code
/// defaults. TLS is terminated by the deployment platform; the relay
/// itself serves plain HTTP/WS.
#[derive(Debug, Clone)]
pub struct Settings {
    /// The domain this relay is authoritative for (`name::<relay_domain>`).
    pub relay_domain: String,
    /// Socket address the HTTP/WS server binds to.
    pub bind_addr: SocketAddr,
    /// Directory holding the database and the relay's federation keypair.
    pub data_dir: PathBuf,
    /// Per-minute cap applied to foreign sender domains.
    pub domain_rate_limit: usize,
    /// Per-minute cap per recipient address.
    pub recipient_rate_limit: usize,
    /// Per-minute cap on registrations.
    pub register_rate_limit: usize,
    /// Admin API key; admin routes answer 503 when unset.
    pub admin_key: Option<String>,
    pub federation_enabled: bool,
    pub federation_discovery_ttl_hours: i64,
    pub federation_max_hops: u32,
    /// Completed/failed federation queue rows older than this are swept.
    pub federation_queue_max_age_days: i64,
    pub webhook_circuit_cooldown_seconds: u64,
    /// How often domain verifications are re-checked.
    pub reverify_interval_seconds: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            relay_domain: "localhost".to_string(),
            bind_addr: "0.0.0.0:8420".parse().expect("valid default bind addr"),
            data_dir: PathBuf::from("./uam-relay"),
            domain_rate_limit: 100,
            recipient_rate_limit: 100,
            register_rate_limit: 5,
            admin_key: None,
            federation_enabled: true,
            federation_discovery_ttl_hours: 1,
            federation_max_hops: 3,
            federation_queue_max_age_days: 7,
            webhook_circuit_cooldown_seconds: 3600,
            reverify_interval_seconds: 3600,
        }
    }
}

impl Settings {
    /// Build settings from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        if let Ok(v) = env::var("UAM_RELAY_DOMAIN")
            && !v.trim().is_empty()
        {
            settings.relay_domain = v.trim().to_lowercase();
        }
        if let Ok(v) = env::var("UAM_BIND_ADDR")
            && let Ok(addr) = v.parse()
        {
            settings.bind_addr = addr;
        }
        if let Ok(v) = env::var("UAM_DATA_DIR")
            && !v.trim().is_empty()
        {
            settings.data_dir = PathBuf::from(v);
        }
        if let Ok(v) = env::var("UAM_DOMAIN_RATE_LIMIT")
            && let Ok(n) = v.parse()
        {
            settings.domain_rate_limit = n;
        }
        if let Ok(v) = env::var("UAM_ADMIN_KEY")
            && !v.trim().is_empty()
        {
            settings.admin_key = Some(v);
        }
        if let Ok(v) = env::var("UAM_FEDERATION_ENABLED") {
            settings.federation_enabled = !matches!(v.as_str(), "0" | "false" | "no");
        }
        if let Ok(v) = env::var("UAM_FEDERATION_MAX_HOPS")
            && let Ok(n) = v.parse()
        {
            settings.federation_max_hops = n;
        }
        if let Ok(v) = env::var("UAM_WEBHOOK_CIRCUIT_COOLDOWN")
            && let Ok(n) = v.parse()
        {
            settings.webhook_circuit_cooldown_seconds = n;
        }
        settings
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("relay.db")
    }

    pub fn relay_key_path(&self) -> PathBuf {
        self.data_dir.join("relay.key")
    }
}
