//! Allow/block pattern sets.
//!
//! Patterns are either an exact `name::domain` address or a `*::domain`
//! wildcard. Lookups are O(1): exact matches hit one set, wildcards hit a
//! domain set keyed by the stripped suffix.

use std::collections::HashSet;
use std::sync::RwLock;

use anyhow::Result;

use crate::protocol::address::domain_of;

use super::storage::{ListTable, Storage};

/// A classified block/allow pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pattern {
    Exact(String),
    Domain(String),
}

/// Classify a raw pattern string. Returns `None` for strings that are
/// neither an address nor a domain wildcard.
pub fn classify_pattern(pattern: &str) -> Option<Pattern> {
    let pattern = pattern.trim();
    if pattern.is_empty() {
        return None;
    }
    if let Some(domain) = pattern.strip_prefix("*::") {
        if domain.is_empty() {
            return None;
        }
        return Some(Pattern::Domain(domain.to_lowercase()));
    }
    if pattern.contains("::") {
        return Some(Pattern::Exact(pattern.to_lowercase()));
    }
    None
}

#[derive(Default)]
struct PatternSet {
    exact: HashSet<String>,
    domains: HashSet<String>,
}

impl PatternSet {
    fn insert(&mut self, pattern: &Pattern) {
        match pattern {
            Pattern::Exact(addr) => {
                self.exact.insert(addr.clone());
            }
            Pattern::Domain(domain) => {
                self.domains.insert(domain.clone());
            }
        }
    }

    fn remove(&mut self, pattern: &Pattern) {
        match pattern {
            Pattern::Exact(addr) => {
                self.exact.remove(addr);
            }
            Pattern::Domain(domain) => {
                self.domains.remove(domain);
            }
        }
    }

    fn matches(&self, address: &str) -> bool {
        if self.exact.contains(address) {
            return true;
        }
        match domain_of(address) {
            Some(domain) => self.domains.contains(domain),
            None => false,
        }
    }
}

/// In-memory allow/block lists, persisted through [`Storage`].
///
/// Loaded before the relay accepts requests; mutations write through to
/// the database and the cache in one call.
pub struct AllowBlockList {
    blocked: RwLock<PatternSet>,
    allowed: RwLock<PatternSet>,
}

impl Default for AllowBlockList {
    fn default() -> Self {
        Self::new()
    }
}

impl AllowBlockList {
    pub fn new() -> Self {
        Self {
            blocked: RwLock::new(PatternSet::default()),
            allowed: RwLock::new(PatternSet::default()),
        }
    }

    /// Replace the in-memory sets with the database contents.
    pub async fn load(&self, storage: &Storage) -> Result<()> {
        let mut blocked = PatternSet::default();
        for raw in storage.list_patterns(ListTable::Blocklist).await? {
            if let Some(pattern) = classify_pattern(&raw) {
                blocked.insert(&pattern);
            }
        }
        let mut allowed = PatternSet::default();
        for raw in storage.list_patterns(ListTable::Allowlist).await? {
            if let Some(pattern) = classify_pattern(&raw) {
                allowed.insert(&pattern);
            }
        }
        *self.blocked.write().expect("spam filter lock") = blocked;
        *self.allowed.write().expect("spam filter lock") = allowed;
        Ok(())
    }

    pub fn is_blocked(&self, address: &str) -> bool {
        self.blocked.read().expect("spam filter lock").matches(address)
    }

    pub fn is_allowed(&self, address: &str) -> bool {
        self.allowed.read().expect("spam filter lock").matches(address)
    }

    pub async fn add_blocked(&self, storage: &Storage, raw: &str) -> Result<bool> {
        self.add(storage, ListTable::Blocklist, raw).await
    }

    pub async fn remove_blocked(&self, storage: &Storage, raw: &str) -> Result<bool> {
        self.remove(storage, ListTable::Blocklist, raw).await
    }

    pub async fn add_allowed(&self, storage: &Storage, raw: &str) -> Result<bool> {
        self.add(storage, ListTable::Allowlist, raw).await
    }

    pub async fn remove_allowed(&self, storage: &Storage, raw: &str) -> Result<bool> {
        self.remove(storage, ListTable::Allowlist, raw).await
    }

    async fn add(&self, storage: &Storage, table: ListTable, raw: &str) -> Result<bool> {
        let Some(pattern) = classify_pattern(raw) else {
            anyhow::bail!("invalid pattern: '{raw}' (expected 'name::domain' or '*::domain')");
        };
        let added = storage.add_list_pattern(table, raw.trim()).await?;
        self.set_for(table).write().expect("spam filter lock").insert(&pattern);
        Ok(added)
    }

    async fn remove(&self, storage: &Storage, table: ListTable, raw: &str) -> Result<bool> {
        let removed = storage.remove_list_pattern(table, raw.trim()).await?;
        if let Some(pattern) = classify_pattern(raw) {
            self.set_for(table).write().expect("spam filter lock").remove(&pattern);
        }
        Ok(removed)
    }

    fn set_for(&self, table: ListTable) -> &RwLock<PatternSet> {
        match table {
            ListTable::Blocklist => &self.blocked,
            ListTable::Allowlist => &self.allowed,
        }
    }
}

#[cfg(test)]
#[path = "spam_tests.rs"]
mod tests;
