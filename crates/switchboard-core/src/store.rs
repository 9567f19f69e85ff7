//! Shared control store: revocations and pending confirmations.
//!
//! A single SQLite database reachable by every gateway instance. All
//! cross-instance coordination goes through atomic SQL here — immediate
//! transactions and conditional deletes — never in-process locks, so
//! multiple gateways can point at one file safely.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use thiserror::Error;

/// Schema bootstrap, applied idempotently on open.
const CONTROL_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS revoked_tokens (
    jti         TEXT PRIMARY KEY,
    revoked_at  TEXT NOT NULL,
    expires_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS pending_confirmations (
    id          TEXT PRIMARY KEY,
    subject     TEXT NOT NULL,
    summary     TEXT NOT NULL,
    action      TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    expires_at  TEXT NOT NULL
);
"#;

/// Control store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Handle to the shared control store.
#[derive(Clone)]
pub struct ControlStore {
    conn: Arc<Mutex<Connection>>,
}

impl ControlStore {
    /// Open a file-backed store.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::init_connection(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init_connection(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_connection(conn: &Connection) -> Result<(), StoreError> {
        // WAL mode for file-backed DBs (no-op for in-memory)
        let _ = conn.execute("PRAGMA journal_mode = WAL", []);
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(CONTROL_SCHEMA)?;
        Ok(())
    }

    /// Liveness probe used by the health endpoint.
    pub fn ping(&self) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }

    pub(crate) fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // The mutex only guards short synchronous statements; a poisoned
        // lock still wraps a usable connection.
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    // =========================================================================
    // Revocations
    // =========================================================================

    /// Insert a revocation. Idempotent: re-revoking refreshes the record.
    pub fn insert_revocation(
        &self,
        jti: &str,
        revoked_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            r#"
            INSERT INTO revoked_tokens (jti, revoked_at, expires_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(jti) DO UPDATE SET
                revoked_at = excluded.revoked_at,
                expires_at = excluded.expires_at
            "#,
            params![jti, revoked_at.to_rfc3339(), expires_at.to_rfc3339()],
        )?;
        Ok(())
    }

    /// Full live revoked-id set. Called by the refresh task, never on the
    /// request hot path.
    pub fn fetch_revoked_ids(&self, now: DateTime<Utc>) -> Result<HashSet<String>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT jti FROM revoked_tokens WHERE expires_at > ?1")?;
        let ids = stmt
            .query_map([now.to_rfc3339()], |row| row.get::<_, String>(0))?
            .collect::<Result<HashSet<_>, _>>()?;
        Ok(ids)
    }

    /// Drop revocation rows whose token already expired on its own.
    pub fn sweep_expired_revocations(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let conn = self.lock();
        let n = conn.execute(
            "DELETE FROM revoked_tokens WHERE expires_at <= ?1",
            [now.to_rfc3339()],
        )?;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn schema_bootstraps() {
        let store = ControlStore::memory().unwrap();
        let conn = store.lock();
        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();
        assert!(tables.contains(&"revoked_tokens".to_string()));
        assert!(tables.contains(&"pending_confirmations".to_string()));
    }

    #[test]
    fn revocation_roundtrip_and_expiry() {
        let store = ControlStore::memory().unwrap();
        let now = Utc::now();

        store
            .insert_revocation("jti-live", now, now + ChronoDuration::hours(1))
            .unwrap();
        store
            .insert_revocation("jti-dead", now - ChronoDuration::hours(2), now - ChronoDuration::hours(1))
            .unwrap();

        let ids = store.fetch_revoked_ids(now).unwrap();
        assert!(ids.contains("jti-live"));
        assert!(!ids.contains("jti-dead"), "expired revocations are not served");

        let swept = store.sweep_expired_revocations(now).unwrap();
        assert_eq!(swept, 1);
    }

    #[test]
    fn revocation_insert_is_idempotent() {
        let store = ControlStore::memory().unwrap();
        let now = Utc::now();
        let exp = now + ChronoDuration::hours(1);

        store.insert_revocation("jti-1", now, exp).unwrap();
        store.insert_revocation("jti-1", now, exp).unwrap();

        let ids = store.fetch_revoked_ids(now).unwrap();
        assert_eq!(ids.len(), 1);
    }
}
