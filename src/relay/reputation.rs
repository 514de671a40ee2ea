//! Adaptive sender reputation.
//!
//! Scores live in [0, 100]; the tier bands pick the per-minute send cap
//! the ingress pipeline enforces. New agents start at 30 (throttled),
//! DNS-verified agents at 60 (reduced).

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::Result;
use std::sync::Arc;

use super::storage::Storage;

pub const DEFAULT_SCORE: i64 = 30;
pub const DNS_VERIFIED_SCORE: i64 = 60;
pub const MIN_SEND_SCORE: i64 = 20;

/// Coarse reputation classification driving the adaptive rate limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReputationTier {
    Full,
    Reduced,
    Throttled,
    Blocked,
}

impl ReputationTier {
    pub fn for_score(score: i64) -> Self {
        match score {
            s if s >= 80 => ReputationTier::Full,
            s if s >= 50 => ReputationTier::Reduced,
            s if s >= 20 => ReputationTier::Throttled,
            _ => ReputationTier::Blocked,
        }
    }

    /// Per-minute send cap for this tier.
    pub fn send_limit(self) -> usize {
        match self {
            ReputationTier::Full => 60,
            ReputationTier::Reduced => 30,
            ReputationTier::Throttled => 10,
            ReputationTier::Blocked => 0,
        }
    }
}

fn clamp(score: i64) -> i64 {
    score.clamp(0, 100)
}

/// Score cache over the reputation table. Reads hit memory; every write
/// goes through to storage with the clamped value.
pub struct ReputationManager {
    storage: Arc<Storage>,
    cache: RwLock<HashMap<String, i64>>,
}

impl ReputationManager {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Warm the cache from the database. Clears any previous contents.
    pub async fn load_cache(&self) -> Result<()> {
        let rows = self.storage.load_all_reputation().await?;
        let mut cache = self.cache.write().expect("reputation lock");
        cache.clear();
        cache.extend(rows);
        Ok(())
    }

    /// Initialize a score for a new agent. Never overwrites an existing row.
    pub async fn init_score(&self, address: &str, score: i64) -> Result<()> {
        let score = clamp(score);
        self.storage.init_reputation(address, score).await?;
        // Re-read so a pre-existing row wins over the initialization value.
        let actual = self
            .storage
            .get_reputation(address)
            .await?
            .map(|row| row.score)
            .unwrap_or(score);
        self.cache
            .write()
            .expect("reputation lock")
            .insert(address.to_string(), actual);
        Ok(())
    }

    /// Current score, defaulting for unknown agents.
    pub fn get_score(&self, address: &str) -> i64 {
        self.cache
            .read()
            .expect("reputation lock")
            .get(address)
            .copied()
            .unwrap_or(DEFAULT_SCORE)
    }

    pub fn get_tier(&self, address: &str) -> ReputationTier {
        ReputationTier::for_score(self.get_score(address))
    }

    /// The adaptive per-minute cap for this sender.
    pub fn get_send_limit(&self, address: &str) -> usize {
        self.get_tier(address).send_limit()
    }

    /// Apply a signed delta, clamped to [0, 100].
    pub async fn update_score(&self, address: &str, delta: i64) -> Result<i64> {
        let new_score = clamp(self.get_score(address) + delta);
        self.storage.set_reputation_score(address, new_score).await?;
        self.cache
            .write()
            .expect("reputation lock")
            .insert(address.to_string(), new_score);
        Ok(new_score)
    }

    /// Admin override: set an absolute score (clamped on write).
    pub async fn set_score(&self, address: &str, score: i64) -> Result<i64> {
        let score = clamp(score);
        self.storage.set_reputation_score(address, score).await?;
        self.cache
            .write()
            .expect("reputation lock")
            .insert(address.to_string(), score);
        Ok(score)
    }

    /// +1 and bump the sent counter.
    pub async fn record_message_success(&self, address: &str) -> Result<()> {
        self.update_score(address, 1).await?;
        self.storage
            .record_reputation_counters(address, 1, 0)
            .await?;
        Ok(())
    }

    /// −5 and bump the rejected counter.
    pub async fn record_message_rejected(&self, address: &str) -> Result<()> {
        self.update_score(address, -5).await?;
        self.storage
            .record_reputation_counters(address, 0, 1)
            .await?;
        Ok(())
    }

    pub async fn get_info(&self, address: &str) -> Result<Option<super::storage::ReputationRow>> {
        self.storage.get_reputation(address).await
    }
}

#[cfg(test)]
#[path = "reputation_tests.rs"]
mod tests;
