//! Confirmation gating for sensitive writes.
//!
//! A pending confirmation is a deferred, not-yet-executed mutation. The
//! entry lives in the shared control store so any gateway instance can
//! resolve it, and resolution is a single conditional delete inside an
//! immediate transaction — the winner of a concurrent approve/deny/expiry
//! race takes the row, everyone else finds it gone. Double execution is
//! structurally impossible: only the claimant holds the action.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use crate::errors::GatewayError;
use crate::model::DeferredAction;
use crate::store::{ControlStore, StoreError};

/// Fixed confirmation lifetime.
pub const CONFIRMATION_TTL_MINUTES: i64 = 5;

/// A stored pending confirmation, as returned on creation.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingConfirmation {
    pub id: String,
    pub subject: String,
    pub summary: String,
    pub action: DeferredAction,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// How a claimed confirmation was resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedConfirmation {
    pub id: String,
    pub summary: String,
    pub action: DeferredAction,
}

/// Pending-confirmation lifecycle over the shared control store.
#[derive(Clone)]
pub struct ConfirmationStore {
    store: ControlStore,
}

impl ConfirmationStore {
    pub fn new(store: ControlStore) -> Self {
        Self { store }
    }

    /// Record a deferred action under a fresh unguessable id. The
    /// mutation has not happened yet.
    pub fn create(
        &self,
        subject: &str,
        summary: &str,
        action: DeferredAction,
        now: DateTime<Utc>,
    ) -> Result<PendingConfirmation, GatewayError> {
        let id = Uuid::new_v4().to_string();
        let expires_at = now + Duration::minutes(CONFIRMATION_TTL_MINUTES);
        let action_json = serde_json::to_string(&action)
            .map_err(|e| GatewayError::Store(format!("serializing action: {}", e)))?;

        let conn = self.store.lock();
        conn.execute(
            r#"
            INSERT INTO pending_confirmations (id, subject, summary, action, created_at, expires_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                id,
                subject,
                summary,
                action_json,
                now.to_rfc3339(),
                expires_at.to_rfc3339(),
            ],
        )
        .map_err(StoreError::from)
        .map_err(|e| GatewayError::Store(e.to_string()))?;

        tracing::info!(event = "confirmation_created", id = %id, subject = subject);

        Ok(PendingConfirmation {
            id,
            subject: subject.to_string(),
            summary: summary.to_string(),
            action,
            created_at: now,
            expires_at,
        })
    }

    /// Atomically claim a confirmation for resolution (approve and deny
    /// share this path; only the caller decides whether to execute).
    ///
    /// Exactly one concurrent claimant wins. Owner mismatch leaves the
    /// row untouched so the real owner can still act on it.
    pub fn claim(
        &self,
        id: &str,
        subject: &str,
        now: DateTime<Utc>,
    ) -> Result<ClaimedConfirmation, GatewayError> {
        let conn = self.store.lock();

        // BEGIN IMMEDIATE acquires the write lock up front, serializing
        // racing claimants across connections and processes.
        conn.execute("BEGIN IMMEDIATE", [])
            .map_err(|e| GatewayError::Store(e.to_string()))?;

        let result = Self::claim_inner(&conn, id, subject, now);

        match &result {
            Ok(_) => {
                conn.execute("COMMIT", [])
                    .map_err(|e| GatewayError::Store(e.to_string()))?;
            }
            Err(_) => {
                let _ = conn.execute("ROLLBACK", []);
            }
        }

        result
    }

    fn claim_inner(
        conn: &rusqlite::Connection,
        id: &str,
        subject: &str,
        now: DateTime<Utc>,
    ) -> Result<ClaimedConfirmation, GatewayError> {
        let row: Option<(String, String, String, String)> = conn
            .query_row(
                "SELECT subject, summary, action, expires_at FROM pending_confirmations WHERE id = ?1",
                [id],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| GatewayError::Store(e.to_string()))?;

        let (owner, summary, action_json, expires_at) = match row {
            Some(r) => r,
            // Unknown id and already-resolved id are indistinguishable by
            // design: the loser of a race learns nothing extra.
            None => return Err(GatewayError::ConfirmationExpired),
        };

        // Owner check before expiry: a foreign subject must not be able to
        // consume (or even expire-probe) someone else's confirmation.
        if owner != subject {
            return Err(GatewayError::ConfirmationForbidden);
        }

        let expires_at = DateTime::parse_from_rfc3339(&expires_at)
            .map_err(|e| GatewayError::Store(format!("corrupt expires_at: {}", e)))?
            .with_timezone(&Utc);

        if now >= expires_at {
            // Expiry wins: the entry is destroyed and the action is gone.
            conn.execute("DELETE FROM pending_confirmations WHERE id = ?1", [id])
                .map_err(|e| GatewayError::Store(e.to_string()))?;
            return Err(GatewayError::ConfirmationExpired);
        }

        let deleted = conn
            .execute(
                "DELETE FROM pending_confirmations WHERE id = ?1 AND subject = ?2",
                params![id, subject],
            )
            .map_err(|e| GatewayError::Store(e.to_string()))?;
        if deleted != 1 {
            return Err(GatewayError::ConfirmationExpired);
        }

        let action: DeferredAction = serde_json::from_str(&action_json)
            .map_err(|e| GatewayError::Store(format!("corrupt action: {}", e)))?;

        Ok(ClaimedConfirmation {
            id: id.to_string(),
            summary,
            action,
        })
    }

    #[cfg(test)]
    pub(crate) fn pending_count(&self) -> usize {
        let conn = self.store.lock();
        conn.query_row("SELECT COUNT(*) FROM pending_confirmations", [], |row| {
            row.get::<_, i64>(0)
        })
        .map(|n| n as usize)
        .unwrap_or(0)
    }
}

/// Drop expired rows; called opportunistically by the background refresh
/// task. Resolution paths also expire lazily, so this is hygiene, not
/// correctness.
pub fn sweep_expired(store: &ControlStore, now: DateTime<Utc>) -> Result<usize, StoreError> {
    let conn = store.lock();
    let n = conn.execute(
        "DELETE FROM pending_confirmations WHERE expires_at <= ?1",
        [now.to_rfc3339()],
    )?;
    Ok(n)
}
