//! Shared data model: caller identity, downstream descriptors, the stream
//! event union, and the downstream tool-envelope contract.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Authenticated caller identity, derived once per request and immutable
/// afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserContext {
    /// Stable subject identifier from the credential (`sub`).
    pub subject: String,
    /// Display name when the credential carries one.
    pub display_name: Option<String>,
    /// Role labels extracted from the credential. Empty when the roles
    /// claim is absent or malformed — an authenticated-but-roleless state.
    pub roles: BTreeSet<String>,
    /// Credential expiry.
    pub expires_at: DateTime<Utc>,
}

impl UserContext {
    /// Role set as a comma-separated header value for downstream metadata.
    pub fn roles_csv(&self) -> String {
        self.roles.iter().cloned().collect::<Vec<_>>().join(",")
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }
}

/// One tool exposed by a downstream server, advertised to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool arguments.
    #[serde(default = "empty_object")]
    pub parameters: Value,
}

fn empty_object() -> Value {
    serde_json::json!({"type": "object", "properties": {}})
}

/// A downstream tool server as registered at startup. Health lives in the
/// circuit breaker, not here.
#[derive(Debug, Clone)]
pub struct ToolServerDescriptor {
    pub name: String,
    pub base_url: String,
    /// Roles that grant access to this server.
    pub required_roles: BTreeSet<String>,
    /// Tools this server exposes (advertised to the model).
    pub tools: Vec<ToolDescriptor>,
    /// Tool names classified as writes (longer timeout, confirmation-prone).
    pub write_tools: BTreeSet<String>,
}

/// Events emitted over one streamed turn. Ordering is significant; events
/// are never reordered or batched across tool boundaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    TextDelta {
        text: String,
    },
    ToolInvocationStarted {
        server: String,
        tool: String,
        call_id: String,
    },
    ToolResult {
        server: String,
        tool: String,
        call_id: String,
        #[serde(default)]
        truncated: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cursor: Option<String>,
        data: Value,
    },
    PendingConfirmation {
        id: String,
        summary: String,
        expires_at: DateTime<Utc>,
    },
    ServiceUnavailable {
        server: String,
        message: String,
    },
    Error {
        code: String,
        message: String,
    },
    /// Terminal event; nothing follows it.
    Done,
}

/// Deferred action recorded by a pending-confirmation envelope. The
/// mutation happens only when the owning subject approves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeferredAction {
    pub server: String,
    pub tool: String,
    pub arguments: Value,
}

/// Discriminated response envelope every downstream tool server returns.
///
/// Structured errors pass through the gateway unmodified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolEnvelope {
    Ok {
        data: Value,
        /// Set when the server capped the result before completeness.
        #[serde(default)]
        truncated: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cursor: Option<String>,
    },
    PendingConfirmation {
        summary: String,
        /// Tool + arguments to re-invoke once approved.
        action: PendingAction,
    },
    Error {
        code: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        remediation: Option<String>,
    },
}

/// The action part of a downstream pending-confirmation envelope. The
/// server name is supplied by the gateway, which knows whom it called.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingAction {
    pub tool: String,
    #[serde(default)]
    pub arguments: Value,
}
