//! SQLite schema, migrations, and query helpers for the relay.
//!
//! One connection guarded by an async mutex: writes are serialized per
//! spec, reads are cheap, and every helper is a single short transaction.

use std::path::Path;

use anyhow::{Context, Result};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::RngCore;
use rand::rngs::OsRng;
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::info;

const SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS agents (
    address     TEXT PRIMARY KEY,
    public_key  TEXT NOT NULL,
    token       TEXT NOT NULL UNIQUE,
    webhook_url TEXT,
    last_seen   TEXT,
    created_at  TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS messages (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    from_addr   TEXT NOT NULL,
    to_addr     TEXT NOT NULL,
    envelope    TEXT NOT NULL,
    delivered   INTEGER NOT NULL DEFAULT 0,
    expires     TEXT,
    created_at  TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_agents_token ON agents(token);
CREATE INDEX IF NOT EXISTS idx_messages_to_addr ON messages(to_addr, delivered);

CREATE TABLE IF NOT EXISTS seen_message_ids (
    message_id TEXT PRIMARY KEY,
    from_addr  TEXT NOT NULL,
    seen_at    TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS webhook_deliveries (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    agent_address    TEXT NOT NULL,
    message_id       TEXT NOT NULL,
    envelope         TEXT NOT NULL,
    status           TEXT NOT NULL DEFAULT 'pending',
    attempt_count    INTEGER NOT NULL DEFAULT 0,
    last_status_code INTEGER,
    last_error       TEXT,
    created_at       TEXT NOT NULL DEFAULT (datetime('now')),
    completed_at     TEXT
);

CREATE INDEX IF NOT EXISTS idx_webhook_deliveries_status
    ON webhook_deliveries(status, created_at);

CREATE TABLE IF NOT EXISTS reputation (
    address           TEXT PRIMARY KEY,
    score             INTEGER NOT NULL DEFAULT 30,
    messages_sent     INTEGER NOT NULL DEFAULT 0,
    messages_rejected INTEGER NOT NULL DEFAULT 0,
    created_at        TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at        TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS blocklist (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    pattern     TEXT NOT NULL UNIQUE,
    reason      TEXT,
    created_at  TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS allowlist (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    pattern     TEXT NOT NULL UNIQUE,
    reason      TEXT,
    created_at  TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS known_relays (
    domain          TEXT PRIMARY KEY,
    federation_url  TEXT NOT NULL,
    public_key      TEXT NOT NULL,
    discovered_via  TEXT NOT NULL DEFAULT 'well-known',
    last_verified   TEXT NOT NULL DEFAULT (datetime('now')),
    ttl_hours       INTEGER NOT NULL DEFAULT 1,
    status          TEXT NOT NULL DEFAULT 'active'
);

CREATE TABLE IF NOT EXISTS federation_log (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    message_id  TEXT NOT NULL,
    from_relay  TEXT NOT NULL,
    to_relay    TEXT NOT NULL,
    direction   TEXT NOT NULL,
    hop_count   INTEGER NOT NULL DEFAULT 0,
    status      TEXT NOT NULL,
    error       TEXT,
    created_at  TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_federation_log_message
    ON federation_log(message_id);

CREATE TABLE IF NOT EXISTS federation_queue (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    target_domain TEXT NOT NULL,
    envelope      TEXT NOT NULL,
    via           TEXT NOT NULL DEFAULT '[]',
    hop_count     INTEGER NOT NULL DEFAULT 0,
    attempt_count INTEGER NOT NULL DEFAULT 0,
    next_retry    TEXT NOT NULL DEFAULT (datetime('now')),
    status        TEXT NOT NULL DEFAULT 'pending',
    error         TEXT,
    created_at    TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_federation_queue_status
    ON federation_queue(status, next_retry);

CREATE TABLE IF NOT EXISTS domain_verifications (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    agent_address TEXT NOT NULL,
    domain        TEXT NOT NULL,
    public_key    TEXT NOT NULL,
    method        TEXT NOT NULL DEFAULT 'dns',
    verified_at   TEXT NOT NULL DEFAULT (datetime('now')),
    last_checked  TEXT NOT NULL DEFAULT (datetime('now')),
    ttl_hours     INTEGER NOT NULL DEFAULT 24,
    status        TEXT NOT NULL DEFAULT 'verified',
    UNIQUE(agent_address, domain)
);
";

#[derive(Debug, Clone)]
pub struct AgentRecord {
    pub address: String,
    pub public_key: String,
    pub token: String,
    pub webhook_url: Option<String>,
    pub last_seen: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: i64,
    pub envelope: Value,
}

#[derive(Debug, Clone)]
pub struct KnownRelay {
    pub domain: String,
    pub federation_url: String,
    pub public_key: String,
    pub discovered_via: String,
    pub last_verified: String,
    pub ttl_hours: i64,
    pub status: String,
}

#[derive(Debug, Clone)]
pub struct FederationQueueEntry {
    pub id: i64,
    pub target_domain: String,
    pub envelope: Value,
    pub via: Vec<String>,
    pub hop_count: u32,
    pub attempt_count: u32,
}

#[derive(Debug, Clone)]
pub struct WebhookDeliveryRecord {
    pub id: i64,
    pub message_id: String,
    pub status: String,
    pub attempt_count: i64,
    pub last_status_code: Option<i64>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DomainVerification {
    pub id: i64,
    pub agent_address: String,
    pub domain: String,
    pub public_key: String,
    pub method: String,
    pub verified_at: String,
}

#[derive(Debug, Clone)]
pub struct ReputationRow {
    pub address: String,
    pub score: i64,
    pub messages_sent: i64,
    pub messages_rejected: i64,
}

/// Generate an opaque bearer token: 32 random bytes, URL-safe base64.
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

pub struct Storage {
    conn: Mutex<Connection>,
}

impl Storage {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create data dir: {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open relay database: {}", path.display()))?;
        Self::init(conn)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "busy_timeout", 5000)?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(SCHEMA)
            .context("failed to apply relay schema")?;
        migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // -- Agents --------------------------------------------------------------

    pub async fn register_agent(
        &self,
        address: &str,
        public_key: &str,
        token: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO agents (address, public_key, token) VALUES (?1, ?2, ?3)",
            params![address, public_key, token],
        )?;
        Ok(())
    }

    pub async fn rotate_agent_token(&self, address: &str, token: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE agents SET token = ?1 WHERE address = ?2",
            params![token, address],
        )?;
        Ok(())
    }

    pub async fn get_agent_by_token(&self, token: &str) -> Result<Option<AgentRecord>> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT address, public_key, token, webhook_url, last_seen
                 FROM agents WHERE token = ?1",
                params![token],
                agent_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub async fn get_agent_by_address(&self, address: &str) -> Result<Option<AgentRecord>> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT address, public_key, token, webhook_url, last_seen
                 FROM agents WHERE address = ?1",
                params![address],
                agent_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Agent record only when a non-empty webhook URL is configured.
    pub async fn get_agent_with_webhook(&self, address: &str) -> Result<Option<AgentRecord>> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT address, public_key, token, webhook_url, last_seen
                 FROM agents WHERE address = ?1
                   AND webhook_url IS NOT NULL AND webhook_url != ''",
                params![address],
                agent_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub async fn update_agent_last_seen(&self, address: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE agents SET last_seen = datetime('now') WHERE address = ?1",
            params![address],
        )?;
        Ok(())
    }

    pub async fn update_agent_webhook_url(
        &self,
        address: &str,
        webhook_url: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE agents SET webhook_url = ?1 WHERE address = ?2",
            params![webhook_url, address],
        )?;
        Ok(())
    }

    // -- Stored messages (tier 3) --------------------------------------------

    pub async fn store_message(
        &self,
        from_addr: &str,
        to_addr: &str,
        envelope_json: &str,
        expires: Option<&str>,
    ) -> Result<i64> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO messages (from_addr, to_addr, envelope, expires)
             VALUES (?1, ?2, ?3, ?4)",
            params![from_addr, to_addr, envelope_json, expires],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Undelivered, unexpired messages for `to_addr`, FIFO by row id.
    pub async fn get_stored_messages(
        &self,
        to_addr: &str,
        limit: usize,
    ) -> Result<Vec<StoredMessage>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, envelope FROM messages
             WHERE to_addr = ?1 AND delivered = 0
               AND (expires IS NULL
                    OR datetime(replace(expires, 'Z', '+00:00')) > datetime('now'))
             ORDER BY id ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![to_addr, limit as i64], |row| {
            let id: i64 = row.get(0)?;
            let envelope: String = row.get(1)?;
            Ok((id, envelope))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, envelope) = row?;
            let envelope: Value = serde_json::from_str(&envelope)
                .with_context(|| format!("corrupt stored envelope (row {id})"))?;
            out.push(StoredMessage { id, envelope });
        }
        Ok(out)
    }

    pub async fn mark_messages_delivered(&self, ids: &[i64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let conn = self.conn.lock().await;
        let placeholders = vec!["?"; ids.len()].join(",");
        let sql = format!("UPDATE messages SET delivered = 1 WHERE id IN ({placeholders})");
        conn.execute(&sql, rusqlite::params_from_iter(ids.iter()))?;
        Ok(())
    }

    /// Delete undelivered messages whose `expires` has passed. Returns the
    /// count deleted.
    pub async fn cleanup_expired_messages(&self) -> Result<usize> {
        let conn = self.conn.lock().await;
        let count = conn.execute(
            "DELETE FROM messages WHERE delivered = 0
               AND expires IS NOT NULL
               AND datetime(replace(expires, 'Z', '+00:00')) <= datetime('now')",
            [],
        )?;
        Ok(count)
    }

    // -- Dedup ---------------------------------------------------------------

    /// Record a message id as seen. Returns `true` if new, `false` on
    /// duplicate. INSERT OR IGNORE makes the primary key the single source
    /// of truth under concurrency.
    pub async fn record_message_id(&self, message_id: &str, from_addr: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO seen_message_ids (message_id, from_addr) VALUES (?1, ?2)",
            params![message_id, from_addr],
        )?;
        Ok(inserted == 1)
    }

    pub async fn cleanup_expired_dedup(&self, max_age_days: i64) -> Result<usize> {
        let conn = self.conn.lock().await;
        let count = conn.execute(
            "DELETE FROM seen_message_ids
             WHERE datetime(seen_at, '+' || ?1 || ' days') < datetime('now')",
            params![max_age_days],
        )?;
        Ok(count)
    }

    // -- Webhook deliveries ---------------------------------------------------

    pub async fn create_webhook_delivery(
        &self,
        agent_address: &str,
        message_id: &str,
        envelope_json: &str,
    ) -> Result<i64> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO webhook_deliveries (agent_address, message_id, envelope, status)
             VALUES (?1, ?2, ?3, 'pending')",
            params![agent_address, message_id, envelope_json],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn update_webhook_delivery_attempt(
        &self,
        delivery_id: i64,
        attempt_count: u32,
        status_code: Option<u16>,
        error: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE webhook_deliveries
             SET attempt_count = ?1, last_status_code = ?2, last_error = ?3,
                 status = 'in_progress'
             WHERE id = ?4",
            params![attempt_count, status_code, error, delivery_id],
        )?;
        Ok(())
    }

    pub async fn complete_webhook_delivery(
        &self,
        delivery_id: i64,
        status: &str,
        error: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE webhook_deliveries
             SET status = ?1, last_error = ?2, completed_at = datetime('now')
             WHERE id = ?3",
            params![status, error, delivery_id],
        )?;
        Ok(())
    }

    pub async fn get_webhook_deliveries(
        &self,
        agent_address: &str,
        limit: usize,
    ) -> Result<Vec<WebhookDeliveryRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, message_id, status, attempt_count, last_status_code, last_error
             FROM webhook_deliveries WHERE agent_address = ?1
             ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![agent_address, limit as i64], |row| {
            Ok(WebhookDeliveryRecord {
                id: row.get(0)?,
                message_id: row.get(1)?,
                status: row.get(2)?,
                attempt_count: row.get(3)?,
                last_status_code: row.get(4)?,
                last_error: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Boot recovery: deliveries cancelled mid-flight stay `in_progress`;
    /// move them back to `pending` so they are retried. Idempotent.
    pub async fn recover_inflight_webhook_deliveries(&self) -> Result<usize> {
        let conn = self.conn.lock().await;
        let count = conn.execute(
            "UPDATE webhook_deliveries SET status = 'pending' WHERE status = 'in_progress'",
            [],
        )?;
        Ok(count)
    }

    // -- Reputation ----------------------------------------------------------

    pub async fn get_reputation(&self, address: &str) -> Result<Option<ReputationRow>> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT address, score, messages_sent, messages_rejected
                 FROM reputation WHERE address = ?1",
                params![address],
                |row| {
                    Ok(ReputationRow {
                        address: row.get(0)?,
                        score: row.get(1)?,
                        messages_sent: row.get(2)?,
                        messages_rejected: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Insert a reputation row if absent; existing scores are never
    /// overwritten by initialization.
    pub async fn init_reputation(&self, address: &str, score: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR IGNORE INTO reputation (address, score) VALUES (?1, ?2)",
            params![address, score],
        )?;
        Ok(())
    }

    pub async fn set_reputation_score(&self, address: &str, score: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO reputation (address, score) VALUES (?1, ?2)
             ON CONFLICT(address) DO UPDATE SET
               score = excluded.score, updated_at = datetime('now')",
            params![address, score],
        )?;
        Ok(())
    }

    pub async fn record_reputation_counters(
        &self,
        address: &str,
        sent_delta: i64,
        rejected_delta: i64,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE reputation
             SET messages_sent = messages_sent + ?1,
                 messages_rejected = messages_rejected + ?2,
                 updated_at = datetime('now')
             WHERE address = ?3",
            params![sent_delta, rejected_delta, address],
        )?;
        Ok(())
    }

    pub async fn load_all_reputation(&self) -> Result<Vec<(String, i64)>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT address, score FROM reputation")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // -- Allow/block lists ----------------------------------------------------

    pub async fn add_list_pattern(&self, table: ListTable, pattern: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "INSERT OR IGNORE INTO {} (pattern) VALUES (?1)",
            table.name()
        );
        Ok(conn.execute(&sql, params![pattern])? == 1)
    }

    pub async fn remove_list_pattern(&self, table: ListTable, pattern: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let sql = format!("DELETE FROM {} WHERE pattern = ?1", table.name());
        Ok(conn.execute(&sql, params![pattern])? > 0)
    }

    pub async fn list_patterns(&self, table: ListTable) -> Result<Vec<String>> {
        let conn = self.conn.lock().await;
        let sql = format!("SELECT pattern FROM {} ORDER BY id", table.name());
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // -- Known relays ----------------------------------------------------------

    pub async fn upsert_known_relay(
        &self,
        domain: &str,
        federation_url: &str,
        public_key: &str,
        discovered_via: &str,
        ttl_hours: i64,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO known_relays
               (domain, federation_url, public_key, discovered_via, ttl_hours)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(domain) DO UPDATE SET
               federation_url = excluded.federation_url,
               public_key = excluded.public_key,
               discovered_via = excluded.discovered_via,
               last_verified = datetime('now'),
               ttl_hours = excluded.ttl_hours,
               status = 'active'",
            params![domain, federation_url, public_key, discovered_via, ttl_hours],
        )?;
        Ok(())
    }

    pub async fn get_known_relay(&self, domain: &str) -> Result<Option<KnownRelay>> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT domain, federation_url, public_key, discovered_via,
                        last_verified, ttl_hours, status
                 FROM known_relays WHERE domain = ?1",
                params![domain],
                |row| {
                    Ok(KnownRelay {
                        domain: row.get(0)?,
                        federation_url: row.get(1)?,
                        public_key: row.get(2)?,
                        discovered_via: row.get(3)?,
                        last_verified: row.get(4)?,
                        ttl_hours: row.get(5)?,
                        status: row.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// True when the cached entry is active and within its TTL.
    pub async fn known_relay_is_fresh(&self, domain: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let fresh: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM known_relays
                 WHERE domain = ?1 AND status = 'active'
                   AND datetime(last_verified, '+' || ttl_hours || ' hours')
                       > datetime('now')",
                params![domain],
                |row| row.get(0),
            )
            .optional()?;
        Ok(fresh.is_some())
    }

    // -- Federation log and queue ----------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub async fn log_federation(
        &self,
        message_id: &str,
        from_relay: &str,
        to_relay: &str,
        direction: &str,
        hop_count: u32,
        status: &str,
        error: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO federation_log
               (message_id, from_relay, to_relay, direction, hop_count, status, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![message_id, from_relay, to_relay, direction, hop_count, status, error],
        )?;
        Ok(())
    }

    pub async fn enqueue_federation(
        &self,
        target_domain: &str,
        envelope: &Value,
        via: &[String],
        hop_count: u32,
        next_retry_seconds: i64,
    ) -> Result<i64> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO federation_queue
               (target_domain, envelope, via, hop_count, next_retry)
             VALUES (?1, ?2, ?3, ?4,
                     datetime('now', '+' || ?5 || ' seconds'))",
            params![
                target_domain,
                envelope.to_string(),
                serde_json::to_string(via).expect("via serializes"),
                hop_count,
                next_retry_seconds
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Pending entries whose `next_retry` has passed.
    pub async fn due_federation_entries(&self, limit: usize) -> Result<Vec<FederationQueueEntry>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, target_domain, envelope, via, hop_count, attempt_count
             FROM federation_queue
             WHERE status = 'pending' AND next_retry <= datetime('now')
             ORDER BY id ASC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            let id: i64 = row.get(0)?;
            let target_domain: String = row.get(1)?;
            let envelope: String = row.get(2)?;
            let via: String = row.get(3)?;
            let hop_count: u32 = row.get(4)?;
            let attempt_count: u32 = row.get(5)?;
            Ok((id, target_domain, envelope, via, hop_count, attempt_count))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, target_domain, envelope, via, hop_count, attempt_count) = row?;
            out.push(FederationQueueEntry {
                id,
                target_domain,
                envelope: serde_json::from_str(&envelope)
                    .with_context(|| format!("corrupt queued envelope (row {id})"))?,
                via: serde_json::from_str(&via).unwrap_or_default(),
                hop_count,
                attempt_count,
            });
        }
        Ok(out)
    }

    pub async fn update_federation_retry(
        &self,
        id: i64,
        attempt_count: u32,
        next_retry_seconds: i64,
        error: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE federation_queue
             SET attempt_count = ?1, error = ?2,
                 next_retry = datetime('now', '+' || ?3 || ' seconds')
             WHERE id = ?4",
            params![attempt_count, error, next_retry_seconds, id],
        )?;
        Ok(())
    }

    pub async fn finish_federation_entry(
        &self,
        id: i64,
        status: &str,
        error: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE federation_queue SET status = ?1, error = ?2 WHERE id = ?3",
            params![status, error, id],
        )?;
        Ok(())
    }

    pub async fn sweep_federation_queue(&self, max_age_days: i64) -> Result<usize> {
        let conn = self.conn.lock().await;
        let count = conn.execute(
            "DELETE FROM federation_queue
             WHERE status IN ('delivered', 'failed')
               AND datetime(created_at, '+' || ?1 || ' days') < datetime('now')",
            params![max_age_days],
        )?;
        Ok(count)
    }

    // -- Domain verifications ---------------------------------------------------

    pub async fn upsert_domain_verification(
        &self,
        agent_address: &str,
        domain: &str,
        public_key: &str,
        method: &str,
        ttl_hours: i64,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO domain_verifications
               (agent_address, domain, public_key, method, ttl_hours)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(agent_address, domain) DO UPDATE SET
               public_key = excluded.public_key,
               method = excluded.method,
               verified_at = datetime('now'),
               last_checked = datetime('now'),
               ttl_hours = excluded.ttl_hours,
               status = 'verified'",
            params![agent_address, domain, public_key, method, ttl_hours],
        )?;
        Ok(())
    }

    pub async fn get_verified_domain(&self, agent_address: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT domain FROM domain_verifications
                 WHERE agent_address = ?1 AND status = 'verified'",
                params![agent_address],
                |row| row.get(0),
            )
            .optional()?;
        Ok(row)
    }

    /// Verifications whose `last_checked + ttl_hours` has passed.
    pub async fn get_expired_verifications(&self) -> Result<Vec<DomainVerification>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, agent_address, domain, public_key, method, verified_at
             FROM domain_verifications
             WHERE status = 'verified'
               AND datetime(last_checked, '+' || ttl_hours || ' hours') < datetime('now')",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(DomainVerification {
                id: row.get(0)?,
                agent_address: row.get(1)?,
                domain: row.get(2)?,
                public_key: row.get(3)?,
                method: row.get(4)?,
                verified_at: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub async fn touch_verification(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE domain_verifications SET last_checked = datetime('now') WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    pub async fn downgrade_verification(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE domain_verifications SET status = 'expired' WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }
}

/// Which pattern list a CRUD call targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListTable {
    Blocklist,
    Allowlist,
}

impl ListTable {
    fn name(self) -> &'static str {
        match self {
            ListTable::Blocklist => "blocklist",
            ListTable::Allowlist => "allowlist",
        }
    }
}

fn agent_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AgentRecord> {
    Ok(AgentRecord {
        address: row.get(0)?,
        public_key: row.get(1)?,
        token: row.get(2)?,
        webhook_url: row.get(3)?,
        last_seen: row.get(4)?,
    })
}

/// Additive migrations guarded by `PRAGMA user_version`. On fresh
/// databases every table already exists from SCHEMA, so each step is an
/// idempotent no-op that still advances the version.
fn migrate(conn: &Connection) -> Result<()> {
    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

    if version < 1 {
        info!("relay db migration: version 1 (seen_message_ids)");
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS seen_message_ids (
                message_id TEXT PRIMARY KEY,
                from_addr  TEXT NOT NULL,
                seen_at    TEXT NOT NULL DEFAULT (datetime('now'))
            );
            PRAGMA user_version = 1;",
        )?;
    }
    if version < 2 {
        info!("relay db migration: version 2 (messages.expires)");
        if !column_exists(conn, "messages", "expires")? {
            conn.execute("ALTER TABLE messages ADD COLUMN expires TEXT", [])?;
        }
        conn.execute_batch("PRAGMA user_version = 2;")?;
    }
    if version < 3 {
        info!("relay db migration: version 3 (agents.last_seen)");
        if !column_exists(conn, "agents", "last_seen")? {
            conn.execute("ALTER TABLE agents ADD COLUMN last_seen TEXT", [])?;
        }
        conn.execute_batch("PRAGMA user_version = 3;")?;
    }
    if version < 4 {
        info!("relay db migration: version 4 (federation tables)");
        // known_relays, federation_log, federation_queue are created by
        // SCHEMA on fresh databases; this step upgrades pre-federation ones.
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS known_relays (
                domain          TEXT PRIMARY KEY,
                federation_url  TEXT NOT NULL,
                public_key      TEXT NOT NULL,
                discovered_via  TEXT NOT NULL DEFAULT 'well-known',
                last_verified   TEXT NOT NULL DEFAULT (datetime('now')),
                ttl_hours       INTEGER NOT NULL DEFAULT 1,
                status          TEXT NOT NULL DEFAULT 'active'
            );
            PRAGMA user_version = 4;",
        )?;
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
#[path = "storage_tests.rs"]
mod tests;
