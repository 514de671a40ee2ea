//! Sliding-window rate limiting.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Per-key sliding-window counter.
///
/// Each key holds the timestamps of accepted events inside the window;
/// `check` drains expired entries from the front before deciding. Buckets
/// for idle keys are reclaimed by the periodic [`cleanup`](Self::cleanup)
/// sweep.
pub struct SlidingWindowCounter {
    default_limit: usize,
    window: Duration,
    buckets: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl SlidingWindowCounter {
    pub fn new(default_limit: usize, window: Duration) -> Self {
        Self {
            default_limit,
            window,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Accept or reject an event for `key` under the default limit.
    pub fn check(&self, key: &str) -> bool {
        self.check_with_limit(key, self.default_limit)
    }

    /// Accept or reject an event for `key` under an explicit limit
    /// (the adaptive reputation tiers pick the limit per sender).
    pub fn check_with_limit(&self, key: &str, limit: usize) -> bool {
        self.check_at(key, limit, Instant::now())
    }

    fn check_at(&self, key: &str, limit: usize, now: Instant) -> bool {
        if limit == 0 {
            return false;
        }
        let mut buckets = self.buckets.lock().expect("rate limiter lock");
        let bucket = buckets.entry(key.to_string()).or_default();
        while let Some(front) = bucket.front() {
            if now.saturating_duration_since(*front) > self.window {
                bucket.pop_front();
            } else {
                break;
            }
        }
        if bucket.len() >= limit {
            return false;
        }
        bucket.push_back(now);
        true
    }

    /// Remaining capacity for `key` under the default limit.
    pub fn remaining(&self, key: &str) -> usize {
        let now = Instant::now();
        let buckets = self.buckets.lock().expect("rate limiter lock");
        let used = buckets
            .get(key)
            .map(|bucket| {
                bucket
                    .iter()
                    .filter(|ts| now.saturating_duration_since(**ts) <= self.window)
                    .count()
            })
            .unwrap_or(0);
        self.default_limit.saturating_sub(used)
    }

    /// Drop buckets whose entries have all expired. Run periodically so
    /// one-shot keys don't accumulate.
    pub fn cleanup(&self) {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().expect("rate limiter lock");
        buckets.retain(|_, bucket| {
            while let Some(front) = bucket.front() {
                if now.saturating_duration_since(*front) > self.window {
                    bucket.pop_front();
                } else {
                    break;
                }
            }
            !bucket.is_empty()
        });
    }

    pub fn tracked_keys(&self) -> usize {
        self.buckets.lock().expect("rate limiter lock").len()
    }
}

#[cfg(test)]
#[path = "rate_limit_tests.rs"]
mod tests;
