//! Live WebSocket session registry.
//!
//! One session per address: registering a new sender displaces the old
//! one, whose socket task observes its channel closing and shuts down.
//! Values are outbound channels so the registry never touches sockets
//! directly; the per-connection task owns the socket.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::RwLock;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info};

#[derive(Default)]
pub struct ConnectionManager {
    sessions: RwLock<HashMap<String, UnboundedSender<Value>>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a live session for `address`, displacing any existing one.
    pub async fn connect(&self, address: &str, sender: UnboundedSender<Value>) {
        let mut sessions = self.sessions.write().await;
        if sessions.insert(address.to_string(), sender).is_some() {
            info!(agent = address, "displaced previous live session");
        }
    }

    /// Remove a session. A reconnect may already have displaced this
    /// address with a newer sender; only remove if `sender` still owns it.
    pub async fn disconnect(&self, address: &str, sender: &UnboundedSender<Value>) {
        let mut sessions = self.sessions.write().await;
        if let Some(current) = sessions.get(address)
            && current.same_channel(sender)
        {
            sessions.remove(address);
        }
    }

    /// Push a wire frame to the live session for `address`, if any.
    /// Returns whether a live session accepted it.
    pub async fn send_to(&self, address: &str, frame: Value) -> bool {
        let sessions = self.sessions.read().await;
        match sessions.get(address) {
            Some(sender) => {
                let delivered = sender.send(frame).is_ok();
                if !delivered {
                    debug!(agent = address, "live session channel closed");
                }
                delivered
            }
            None => false,
        }
    }

    pub async fn is_connected(&self, address: &str) -> bool {
        self.sessions.read().await.contains_key(address)
    }

    pub async fn connected_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[cfg(test)]
#[path = "connections_tests.rs"]
mod tests;
