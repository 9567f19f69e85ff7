//! Gateway error taxonomy.
//!
//! Variants map one-to-one onto caller-facing statuses at the transport
//! layer; abuse and unexpected errors deliberately carry a separate public
//! message so internal detail only reaches the audit log.

use thiserror::Error;

/// Errors surfaced by the gateway core.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Bad, expired, or revoked credential.
    #[error("authentication failed: {reason}")]
    Auth { reason: String },

    /// Caller's role set does not grant access to the named server.
    #[error("role set does not grant access to server '{server}'")]
    Forbidden { server: String },

    /// Input rejected by the abuse filter. `public` is safe to show the
    /// caller; `detail` is audit-only.
    #[error("query rejected: {public}")]
    Abuse {
        public: String,
        detail: String,
        stage: &'static str,
    },

    /// Confirmation id unknown, already resolved, or past expiry.
    #[error("confirmation not found or expired")]
    ConfirmationExpired,

    /// Confirmation exists but belongs to another subject.
    #[error("confirmation belongs to another subject")]
    ConfirmationForbidden,

    /// A downstream dependency is unavailable (timeout or open circuit).
    #[error("server '{server}' unavailable: {message}")]
    ServiceDegraded { server: String, message: String },

    /// Shared control store failure.
    #[error("control store failure: {0}")]
    Store(String),

    /// Anything else; the caller sees a generic message only.
    #[error("internal error")]
    Unexpected(#[source] anyhow::Error),
}

impl GatewayError {
    pub fn auth(reason: impl Into<String>) -> Self {
        Self::Auth {
            reason: reason.into(),
        }
    }

    pub fn forbidden(server: impl Into<String>) -> Self {
        Self::Forbidden {
            server: server.into(),
        }
    }

    pub fn abuse(stage: &'static str, public: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Abuse {
            public: public.into(),
            detail: detail.into(),
            stage,
        }
    }

    pub fn degraded(server: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ServiceDegraded {
            server: server.into(),
            message: message.into(),
        }
    }

    /// True when the variant must never leak internal detail to callers.
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Unexpected(_) | Self::Store(_))
    }
}

impl From<anyhow::Error> for GatewayError {
    fn from(err: anyhow::Error) -> Self {
        Self::Unexpected(err)
    }
}

impl From<rusqlite::Error> for GatewayError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Store(err.to_string())
    }
}
