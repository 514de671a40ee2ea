//! Ephemeral demo sessions: short-lived agents for try-it-out flows.
//! Sessions (and their agent registrations) evaporate after the TTL.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;
use rand::rngs::OsRng;

#[derive(Debug, Clone)]
pub struct DemoSession {
    pub address: String,
    created_at: Instant,
}

pub struct SessionManager {
    ttl: Duration,
    max_sessions: usize,
    sessions: Mutex<HashMap<String, DemoSession>>,
}

impl SessionManager {
    pub fn new(ttl: Duration, max_sessions: usize) -> Self {
        Self {
            ttl,
            max_sessions,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Mint a unique demo agent name, tracking it as a session. `None`
    /// when the session cap is reached.
    pub fn create(&self, relay_domain: &str) -> Option<DemoSession> {
        let mut sessions = self.sessions.lock().expect("demo session lock");
        if sessions.len() >= self.max_sessions {
            return None;
        }
        let suffix: u32 = OsRng.gen_range(0..1_000_000);
        let name = format!("demo-{suffix:06}");
        let session = DemoSession {
            address: format!("{name}::{relay_domain}"),
            created_at: Instant::now(),
        };
        sessions.insert(session.address.clone(), session.clone());
        Some(session)
    }

    pub fn is_active(&self, address: &str) -> bool {
        let sessions = self.sessions.lock().expect("demo session lock");
        sessions
            .get(address)
            .map(|session| session.created_at.elapsed() < self.ttl)
            .unwrap_or(false)
    }

    /// Remove sessions past the TTL, returning the evicted addresses so
    /// the caller can drop their agent registrations.
    pub fn cleanup_expired(&self) -> Vec<String> {
        let mut sessions = self.sessions.lock().expect("demo session lock");
        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, session)| session.created_at.elapsed() >= self.ttl)
            .map(|(address, _)| address.clone())
            .collect();
        for address in &expired {
            sessions.remove(address);
        }
        expired
    }

    pub fn active_count(&self) -> usize {
        self.sessions.lock().expect("demo session lock").len()
    }
}

#[cfg(test)]
#[path = "demo_tests.rs"]
mod tests;
