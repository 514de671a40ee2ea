//! Long-lived background tasks: limiter pruning, dedup and stored-message
//! sweeps, the federation retry queue, and domain re-verification. Each
//! loop is cancellation-aware and exits promptly on shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::federation::RETRY_SCHEDULE_SECONDS;
use super::reputation::DEFAULT_SCORE;
use super::routes::verify_domain::check_domain_key;
use super::server::RelayState;

const RATE_LIMIT_CLEANUP_INTERVAL: Duration = Duration::from_secs(300);
const DEMO_SESSION_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
const DEDUP_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);
const EXPIRED_MESSAGE_SWEEP_INTERVAL: Duration = Duration::from_secs(300);
const FEDERATION_QUEUE_TICK: Duration = Duration::from_secs(10);
const DEDUP_RETENTION_DAYS: i64 = 7;

/// Ticks of the federation worker between queue sweeps (~1 h at 10 s).
const FEDERATION_SWEEP_EVERY_TICKS: u32 = 360;

pub fn spawn_all(tracker: &TaskTracker, state: Arc<RelayState>) {
    tracker.spawn(rate_limiter_cleanup_loop(Arc::clone(&state)));
    tracker.spawn(demo_session_cleanup_loop(Arc::clone(&state)));
    tracker.spawn(dedup_sweep_loop(Arc::clone(&state)));
    tracker.spawn(expired_message_sweep_loop(Arc::clone(&state)));
    tracker.spawn(federation_queue_worker(Arc::clone(&state)));
    tracker.spawn(reverification_loop(state));
}

/// Prune idle rate-limiter buckets so one-shot keys don't accumulate.
async fn rate_limiter_cleanup_loop(state: Arc<RelayState>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(RATE_LIMIT_CLEANUP_INTERVAL) => {}
            _ = state.cancel.cancelled() => return,
        }
        state.sender_limiter.cleanup();
        state.recipient_limiter.cleanup();
        state.register_limiter.cleanup();
        state.domain_limiter.cleanup();
        debug!("rate limiter buckets cleaned up");
    }
}

/// Evict expired ephemeral demo sessions.
async fn demo_session_cleanup_loop(state: Arc<RelayState>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(DEMO_SESSION_CLEANUP_INTERVAL) => {}
            _ = state.cancel.cancelled() => return,
        }
        let evicted = state.demo_sessions.cleanup_expired();
        if !evicted.is_empty() {
            info!(count = evicted.len(), "cleaned up expired demo sessions");
        }
    }
}

/// Drop dedup entries past the retention window.
async fn dedup_sweep_loop(state: Arc<RelayState>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(DEDUP_SWEEP_INTERVAL) => {}
            _ = state.cancel.cancelled() => return,
        }
        match state.storage.cleanup_expired_dedup(DEDUP_RETENTION_DAYS).await {
            Ok(count) if count > 0 => info!(count, "swept expired dedup entries"),
            Ok(_) => {}
            Err(err) => warn!("dedup sweep failed: {err:#}"),
        }
    }
}

/// Delete stored messages whose `expires` has passed before anyone
/// picked them up.
async fn expired_message_sweep_loop(state: Arc<RelayState>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(EXPIRED_MESSAGE_SWEEP_INTERVAL) => {}
            _ = state.cancel.cancelled() => return,
        }
        match state.storage.cleanup_expired_messages().await {
            Ok(count) if count > 0 => info!(count, "swept expired stored messages"),
            Ok(_) => {}
            Err(err) => warn!("expired message sweep failed: {err:#}"),
        }
    }
}

/// Drain due federation retries; periodically sweep finished rows.
async fn federation_queue_worker(state: Arc<RelayState>) {
    let mut ticks: u32 = 0;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(FEDERATION_QUEUE_TICK) => {}
            _ = state.cancel.cancelled() => return,
        }
        if let Err(err) = drain_federation_queue(&state).await {
            warn!("federation queue drain failed: {err:#}");
        }
        ticks += 1;
        if ticks >= FEDERATION_SWEEP_EVERY_TICKS {
            ticks = 0;
            match state
                .storage
                .sweep_federation_queue(state.settings.federation_queue_max_age_days)
                .await
            {
                Ok(count) if count > 0 => info!(count, "swept finished federation entries"),
                Ok(_) => {}
                Err(err) => warn!("federation queue sweep failed: {err:#}"),
            }
        }
    }
}

async fn drain_federation_queue(state: &Arc<RelayState>) -> anyhow::Result<()> {
    let entries = state.storage.due_federation_entries(50).await?;
    for entry in entries {
        let result = state
            .federation
            .forward(
                &entry.envelope,
                &state.settings.relay_domain,
                &entry.via,
                entry.hop_count,
            )
            .await;
        if result.delivered {
            state
                .storage
                .finish_federation_entry(entry.id, "delivered", None)
                .await?;
            continue;
        }
        let attempt = entry.attempt_count + 1;
        let error = result.error.as_deref();
        if attempt as usize >= RETRY_SCHEDULE_SECONDS.len() {
            warn!(
                domain = %entry.target_domain,
                attempts = attempt,
                "federation retries exhausted"
            );
            state
                .storage
                .finish_federation_entry(entry.id, "failed", error)
                .await?;
        } else {
            state
                .storage
                .update_federation_retry(
                    entry.id,
                    attempt,
                    RETRY_SCHEDULE_SECONDS[attempt as usize],
                    error,
                )
                .await?;
        }
    }
    Ok(())
}

/// Re-check domain verifications whose TTL elapsed. A domain that no
/// longer advertises the agent's key is downgraded, and the agent's
/// reputation falls back to the unverified default.
async fn reverification_loop(state: Arc<RelayState>) {
    let interval = Duration::from_secs(state.settings.reverify_interval_seconds);
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = state.cancel.cancelled() => return,
        }
        let expired = match state.storage.get_expired_verifications().await {
            Ok(expired) => expired,
            Err(err) => {
                warn!("failed to list expired verifications: {err:#}");
                continue;
            }
        };
        for verification in expired {
            let still_valid =
                check_domain_key(&verification.domain, &verification.public_key)
                    .await
                    .is_some();
            let result = if still_valid {
                state.storage.touch_verification(verification.id).await
            } else {
                info!(
                    agent = %verification.agent_address,
                    domain = %verification.domain,
                    "domain re-verification failed, downgrading"
                );
                match state.storage.downgrade_verification(verification.id).await {
                    Ok(()) => state
                        .reputation
                        .set_score(&verification.agent_address, DEFAULT_SCORE)
                        .await
                        .map(|_| ()),
                    Err(err) => Err(err),
                }
            };
            if let Err(err) = result {
                warn!("re-verification bookkeeping failed: {err:#}");
            }
        }
    }
}
