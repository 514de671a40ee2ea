//! SQLite-backed local contact storage with in-memory caches for the hot
//! `is_known` / `is_blocked` checks. Single writer: the book owns its
//! connection and callers hold `&mut` for mutations.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::info;

use crate::protocol::address::domain_of;

const SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS contacts (
    address      TEXT PRIMARY KEY,
    public_key   TEXT NOT NULL,
    display_name TEXT,
    trust_state  TEXT NOT NULL DEFAULT 'unverified',
    trust_source TEXT DEFAULT 'legacy-unknown',
    relay        TEXT,
    relays_json  TEXT,
    pinned_at    TEXT,
    first_seen   TEXT NOT NULL DEFAULT (datetime('now')),
    last_seen    TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS pending_handshakes (
    address      TEXT PRIMARY KEY,
    contact_card TEXT NOT NULL,
    received_at  TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS blocked_patterns (
    pattern     TEXT PRIMARY KEY,
    blocked_at  TEXT NOT NULL DEFAULT (datetime('now'))
);
";

/// Trust progression for a stored peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustState {
    /// First sight, not yet confirmed by any handshake.
    Provisional,
    /// TOFU-confirmed via handshake.accept; `pinned_at` is set.
    Pinned,
    /// Manually confirmed out of band.
    Verified,
    /// Grandfathered legacy trust.
    Trusted,
    Unverified,
    HandshakeSent,
    /// Opaque bridge contact (no key material to verify).
    Bridge,
}

impl TrustState {
    pub fn as_str(self) -> &'static str {
        match self {
            TrustState::Provisional => "provisional",
            TrustState::Pinned => "pinned",
            TrustState::Verified => "verified",
            TrustState::Trusted => "trusted",
            TrustState::Unverified => "unverified",
            TrustState::HandshakeSent => "handshake-sent",
            TrustState::Bridge => "bridge",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "provisional" => Some(TrustState::Provisional),
            "pinned" => Some(TrustState::Pinned),
            "verified" => Some(TrustState::Verified),
            "trusted" => Some(TrustState::Trusted),
            "unverified" => Some(TrustState::Unverified),
            "handshake-sent" => Some(TrustState::HandshakeSent),
            "bridge" => Some(TrustState::Bridge),
            _ => None,
        }
    }

    /// States in which the stored key is authoritative for sending.
    pub fn is_trusted_or_verified(self) -> bool {
        matches!(
            self,
            TrustState::Pinned | TrustState::Verified | TrustState::Trusted
        )
    }
}

impl std::fmt::Display for TrustState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fields for a contact upsert. `trust_source`, `relay`, and `relays`
/// coalesce: `None` preserves whatever the row already holds.
#[derive(Debug, Clone, Default)]
pub struct ContactUpdate {
    pub display_name: Option<String>,
    pub trust_source: Option<String>,
    pub relay: Option<String>,
    pub relays: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct ContactEntry {
    pub address: String,
    pub display_name: Option<String>,
    pub trust_state: String,
    pub first_seen: String,
    pub last_seen: String,
}

#[derive(Debug, Clone)]
pub struct PendingHandshake {
    pub address: String,
    pub contact_card: String,
    pub received_at: String,
}

pub struct ContactBook {
    conn: Connection,
    known: HashSet<String>,
    blocked_exact: HashSet<String>,
    blocked_domains: HashSet<String>,
}

impl ContactBook {
    /// Open (creating if needed) the book at `<data_dir>/contacts/contacts.db`,
    /// run migrations, and warm the in-memory caches.
    pub fn open(data_dir: &Path) -> Result<Self> {
        let db_dir = data_dir.join("contacts");
        std::fs::create_dir_all(&db_dir)
            .with_context(|| format!("failed to create {}", db_dir.display()))?;
        let conn = Connection::open(db_dir.join("contacts.db"))?;
        Self::init(conn)
    }

    /// In-memory book for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        migrate(&conn)?;

        let mut known = HashSet::new();
        {
            let mut stmt = conn.prepare("SELECT address FROM contacts")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            for row in rows {
                known.insert(row?);
            }
        }

        let mut blocked_exact = HashSet::new();
        let mut blocked_domains = HashSet::new();
        {
            let mut stmt = conn.prepare("SELECT pattern FROM blocked_patterns")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            for row in rows {
                cache_block_pattern(&row?, &mut blocked_exact, &mut blocked_domains);
            }
        }

        Ok(Self {
            conn,
            known,
            blocked_exact,
            blocked_domains,
        })
    }

    // -- Contacts ------------------------------------------------------------

    /// In-memory membership check, no I/O.
    pub fn is_known(&self, address: &str) -> bool {
        self.known.contains(address)
    }

    pub fn get_public_key(&self, address: &str) -> Result<Option<String>> {
        let row = self
            .conn
            .query_row(
                "SELECT public_key FROM contacts WHERE address = ?1",
                params![address],
                |row| row.get(0),
            )
            .optional()?;
        Ok(row)
    }

    /// Ordered relay URLs for failover: the `relays` list when present,
    /// else the primary `relay` wrapped in a list.
    pub fn get_relay_urls(&self, address: &str) -> Result<Option<Vec<String>>> {
        let row: Option<(Option<String>, Option<String>)> = self
            .conn
            .query_row(
                "SELECT relay, relays_json FROM contacts WHERE address = ?1",
                params![address],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match row {
            None => Ok(None),
            Some((_, Some(relays_json))) => Ok(Some(serde_json::from_str(&relays_json)?)),
            Some((Some(relay), None)) => Ok(Some(vec![relay])),
            Some((None, None)) => Ok(None),
        }
    }

    /// Upsert a contact. `trust_state` always takes the new value;
    /// coalescing fields keep their stored values when not provided.
    pub fn add_contact(
        &mut self,
        address: &str,
        public_key: &str,
        trust_state: TrustState,
        update: ContactUpdate,
    ) -> Result<()> {
        let relays_json = update
            .relays
            .as_ref()
            .map(|relays| serde_json::to_string(relays))
            .transpose()?;
        self.conn.execute(
            "INSERT INTO contacts
               (address, public_key, display_name, trust_state, trust_source, relay, relays_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(address) DO UPDATE SET
               public_key = excluded.public_key,
               display_name = excluded.display_name,
               trust_state = excluded.trust_state,
               trust_source = COALESCE(excluded.trust_source, contacts.trust_source),
               relay = COALESCE(excluded.relay, contacts.relay),
               relays_json = COALESCE(excluded.relays_json, contacts.relays_json),
               last_seen = datetime('now')",
            params![
                address,
                public_key,
                update.display_name,
                trust_state.as_str(),
                update.trust_source,
                update.relay,
                relays_json,
            ],
        )?;
        self.known.insert(address.to_string());
        Ok(())
    }

    pub fn get_trust_state(&self, address: &str) -> Result<Option<TrustState>> {
        let row: Option<String> = self
            .conn
            .query_row(
                "SELECT trust_state FROM contacts WHERE address = ?1",
                params![address],
                |row| row.get(0),
            )
            .optional()?;
        Ok(row.as_deref().and_then(TrustState::parse))
    }

    pub fn get_trust_source(&self, address: &str) -> Result<Option<String>> {
        let row = self
            .conn
            .query_row(
                "SELECT trust_source FROM contacts WHERE address = ?1",
                params![address],
                |row| row.get(0),
            )
            .optional()?;
        Ok(row)
    }

    /// Stamp `pinned_at` for a TOFU-confirmed contact.
    pub fn set_pinned_at(&mut self, address: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE contacts SET pinned_at = datetime('now') WHERE address = ?1",
            params![address],
        )?;
        Ok(())
    }

    pub fn get_pinned_at(&self, address: &str) -> Result<Option<String>> {
        let row: Option<Option<String>> = self
            .conn
            .query_row(
                "SELECT pinned_at FROM contacts WHERE address = ?1",
                params![address],
                |row| row.get(0),
            )
            .optional()?;
        Ok(row.flatten())
    }

    pub fn is_trusted_or_verified(&self, address: &str) -> Result<bool> {
        Ok(self
            .get_trust_state(address)?
            .map(TrustState::is_trusted_or_verified)
            .unwrap_or(false))
    }

    pub fn remove_contact(&mut self, address: &str) -> Result<bool> {
        let removed = self
            .conn
            .execute("DELETE FROM contacts WHERE address = ?1", params![address])?;
        self.known.remove(address);
        Ok(removed > 0)
    }

    pub fn list_contacts(&self) -> Result<Vec<ContactEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT address, display_name, trust_state, first_seen, last_seen
             FROM contacts ORDER BY last_seen DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(ContactEntry {
                address: row.get(0)?,
                display_name: row.get(1)?,
                trust_state: row.get(2)?,
                first_seen: row.get(3)?,
                last_seen: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // -- Pending handshakes -----------------------------------------------------

    pub fn add_pending(&mut self, address: &str, contact_card_json: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO pending_handshakes (address, contact_card) VALUES (?1, ?2)",
            params![address, contact_card_json],
        )?;
        Ok(())
    }

    pub fn get_pending(&self) -> Result<Vec<PendingHandshake>> {
        let mut stmt = self
            .conn
            .prepare("SELECT address, contact_card, received_at FROM pending_handshakes")?;
        let rows = stmt.query_map([], pending_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn remove_pending(&mut self, address: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM pending_handshakes WHERE address = ?1",
            params![address],
        )?;
        Ok(())
    }

    /// Pending handshakes older than `days` days.
    pub fn get_expired_pending(&self, days: i64) -> Result<Vec<PendingHandshake>> {
        let mut stmt = self.conn.prepare(
            "SELECT address, contact_card, received_at FROM pending_handshakes
             WHERE datetime(received_at, '+' || ?1 || ' days') < datetime('now')",
        )?;
        let rows = stmt.query_map(params![days], pending_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // -- Blocking ----------------------------------------------------------------

    /// O(1) over the in-memory sets: exact addresses and wildcard domains.
    pub fn is_blocked(&self, address: &str) -> bool {
        if self.blocked_exact.contains(address) {
            return true;
        }
        match domain_of(address) {
            Some(domain) => self.blocked_domains.contains(domain),
            None => false,
        }
    }

    pub fn add_block(&mut self, pattern: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO blocked_patterns (pattern) VALUES (?1)",
            params![pattern],
        )?;
        cache_block_pattern(pattern, &mut self.blocked_exact, &mut self.blocked_domains);
        Ok(())
    }

    pub fn remove_block(&mut self, pattern: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM blocked_patterns WHERE pattern = ?1",
            params![pattern],
        )?;
        if let Some(domain) = pattern.strip_prefix("*::") {
            self.blocked_domains.remove(domain);
        } else {
            self.blocked_exact.remove(pattern);
        }
        Ok(())
    }

    pub fn list_blocked(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT pattern FROM blocked_patterns ORDER BY blocked_at DESC")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    #[cfg(test)]
    pub(crate) fn raw_conn(&self) -> &Connection {
        &self.conn
    }
}

fn pending_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PendingHandshake> {
    Ok(PendingHandshake {
        address: row.get(0)?,
        contact_card: row.get(1)?,
        received_at: row.get(2)?,
    })
}

fn cache_block_pattern(
    pattern: &str,
    exact: &mut HashSet<String>,
    domains: &mut HashSet<String>,
) {
    if let Some(domain) = pattern.strip_prefix("*::") {
        domains.insert(domain.to_string());
    } else {
        exact.insert(pattern.to_string());
    }
}

/// Numbered, idempotent migrations guarded by `PRAGMA user_version`.
fn migrate(conn: &Connection) -> Result<()> {
    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

    if version < 1 {
        info!("contact book migration: version 1 (trust_source, blocked_patterns)");
        if !column_exists(conn, "contacts", "trust_source")? {
            conn.execute(
                "ALTER TABLE contacts ADD COLUMN trust_source TEXT DEFAULT 'legacy-unknown'",
                [],
            )?;
        }
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS blocked_patterns (
                pattern     TEXT PRIMARY KEY,
                blocked_at  TEXT NOT NULL DEFAULT (datetime('now'))
            );
            PRAGMA user_version = 1;",
        )?;
    }
    if version < 2 {
        info!("contact book migration: version 2 (relay columns)");
        for column in ["relay", "relays_json"] {
            if !column_exists(conn, "contacts", column)? {
                conn.execute(&format!("ALTER TABLE contacts ADD COLUMN {column} TEXT"), [])?;
            }
        }
        conn.execute_batch("PRAGMA user_version = 2;")?;
    }
    if version < 3 {
        info!("contact book migration: version 3 (pinned_at)");
        if !column_exists(conn, "contacts", "pinned_at")? {
            conn.execute("ALTER TABLE contacts ADD COLUMN pinned_at TEXT", [])?;
        }
        conn.execute_batch("PRAGMA user_version = 3;")?;
    }
    Ok(())
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
    for name in names {
        if name? == column {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
#[path = "contact_book_tests.rs"]
mod tests;
