//! Relay boot wiring: construct shared state, start background workers,
//! serve HTTP/WS, and unwind cleanly on shutdown.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use ed25519_dalek::SigningKey;
use rand::RngCore;
use rand::rngs::OsRng;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

use super::config::Settings;
use super::connections::ConnectionManager;
use super::demo::SessionManager;
use super::federation::FederationService;
use super::rate_limit::SlidingWindowCounter;
use super::reputation::ReputationManager;
use super::routes;
use super::spam::AllowBlockList;
use super::storage::Storage;
use super::sweepers;
use super::webhook::{WebhookCircuitBreaker, WebhookDeliveryService};

/// Everything the request handlers and workers share. Constructed once at
/// boot; handlers receive it as `Arc<RelayState>`.
pub struct RelayState {
    pub settings: Settings,
    pub storage: Arc<Storage>,
    pub manager: Arc<ConnectionManager>,
    pub spam_filter: Arc<AllowBlockList>,
    pub reputation: Arc<ReputationManager>,
    pub sender_limiter: SlidingWindowCounter,
    pub recipient_limiter: SlidingWindowCounter,
    pub register_limiter: SlidingWindowCounter,
    pub domain_limiter: SlidingWindowCounter,
    pub webhook_service: Arc<WebhookDeliveryService>,
    pub federation: Arc<FederationService>,
    pub demo_sessions: SessionManager,
    pub relay_public_key: String,
    pub cancel: CancellationToken,
}

impl RelayState {
    /// Build the full state graph. Caches (spam filter, reputation) are
    /// warmed before the server accepts its first request.
    pub async fn build(settings: Settings, storage: Arc<Storage>) -> Result<Arc<Self>> {
        let cancel = CancellationToken::new();

        // Deliveries cancelled by a previous shutdown are re-queued.
        let recovered = storage.recover_inflight_webhook_deliveries().await?;
        if recovered > 0 {
            info!(recovered, "re-queued in-flight webhook deliveries from previous run");
        }

        let spam_filter = Arc::new(AllowBlockList::new());
        spam_filter.load(&storage).await?;

        let reputation = Arc::new(ReputationManager::new(Arc::clone(&storage)));
        reputation.load_cache().await?;

        let manager = Arc::new(ConnectionManager::new());

        let breaker = Arc::new(WebhookCircuitBreaker::new(Duration::from_secs(
            settings.webhook_circuit_cooldown_seconds,
        )));
        let webhook_service = Arc::new(WebhookDeliveryService::new(
            Arc::clone(&storage),
            breaker,
            Arc::clone(&manager),
            cancel.clone(),
        ));

        let signing_key = load_or_generate_relay_key(&settings.relay_key_path())?;
        let federation = Arc::new(FederationService::new(
            Arc::clone(&storage),
            settings.relay_domain.clone(),
            settings.federation_discovery_ttl_hours,
            signing_key,
        ));
        let relay_public_key = federation.public_key_b64();

        Ok(Arc::new(Self {
            sender_limiter: SlidingWindowCounter::new(60, Duration::from_secs(60)),
            recipient_limiter: SlidingWindowCounter::new(
                settings.recipient_rate_limit,
                Duration::from_secs(60),
            ),
            register_limiter: SlidingWindowCounter::new(
                settings.register_rate_limit,
                Duration::from_secs(60),
            ),
            domain_limiter: SlidingWindowCounter::new(
                settings.domain_rate_limit,
                Duration::from_secs(60),
            ),
            settings,
            storage,
            manager,
            spam_filter,
            reputation,
            webhook_service,
            federation,
            demo_sessions: SessionManager::new(Duration::from_secs(600), 1000),
            relay_public_key,
            cancel,
        }))
    }
}

/// The relay's federation signing key, persisted as a base64 seed with
/// owner-only permissions.
fn load_or_generate_relay_key(path: &Path) -> Result<SigningKey> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create data dir: {}", parent.display()))?;
    }
    if path.exists() {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read relay key: {}", path.display()))?;
        let bytes = STANDARD
            .decode(text.trim())
            .map_err(|err| anyhow!("invalid relay key at {}: {err}", path.display()))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|v: Vec<u8>| anyhow!("relay key must be 32 bytes, got {}", v.len()))?;
        Ok(SigningKey::from_bytes(&seed))
    } else {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        fs::write(path, STANDARD.encode(seed))
            .with_context(|| format!("failed to write relay key: {}", path.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))
                .with_context(|| format!("failed to set key permissions: {}", path.display()))?;
        }
        info!("generated relay federation keypair");
        Ok(SigningKey::from_bytes(&seed))
    }
}

pub struct RelayServer {
    state: Arc<RelayState>,
}

impl RelayServer {
    pub async fn new(settings: Settings) -> Result<Self> {
        let storage = Arc::new(Storage::open(&settings.database_path())?);
        let state = RelayState::build(settings, storage).await?;
        Ok(Self { state })
    }

    pub fn state(&self) -> Arc<RelayState> {
        Arc::clone(&self.state)
    }

    /// Serve until the process receives SIGINT or `cancel` fires, then
    /// cancel workers, wait for them, and close resources.
    pub async fn run(self) -> Result<()> {
        let state = self.state;
        let tracker = TaskTracker::new();
        sweepers::spawn_all(&tracker, Arc::clone(&state));

        let router = routes::router(Arc::clone(&state));
        let listener = tokio::net::TcpListener::bind(state.settings.bind_addr)
            .await
            .with_context(|| format!("failed to bind {}", state.settings.bind_addr))?;
        info!(
            addr = %state.settings.bind_addr,
            domain = %state.settings.relay_domain,
            "UAM relay listening"
        );

        let cancel = state.cancel.clone();
        let shutdown = {
            let cancel = cancel.clone();
            async move {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = cancel.cancelled() => {}
                }
            }
        };
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
            .context("relay server error")?;

        info!("shutting down: cancelling background workers");
        cancel.cancel();
        tracker.close();
        tracker.wait().await;
        state.webhook_service.shutdown().await;
        info!("relay stopped");
        Ok(())
    }
}
