//! Role routing: which downstream servers a role set may reach.
//!
//! The table is built once from configuration and injected; the router
//! itself holds no mutable state. Server health is the circuit breaker's
//! business, not routing's.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::errors::GatewayError;
use crate::model::{ToolServerDescriptor, UserContext};

/// Immutable role → server mapping.
pub struct RoleRouter {
    /// role → server names granted by that role.
    table: BTreeMap<String, BTreeSet<String>>,
    /// Composite role that expands to every registered server.
    all_access_role: String,
    /// All registered servers by name.
    servers: BTreeMap<String, Arc<ToolServerDescriptor>>,
}

impl RoleRouter {
    /// Invert the per-server role lists into a role → servers table.
    pub fn new(servers: Vec<Arc<ToolServerDescriptor>>, all_access_role: impl Into<String>) -> Self {
        let mut table: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut by_name = BTreeMap::new();
        for server in servers {
            for role in &server.required_roles {
                table
                    .entry(role.clone())
                    .or_default()
                    .insert(server.name.clone());
            }
            by_name.insert(server.name.clone(), server);
        }
        Self {
            table,
            all_access_role: all_access_role.into(),
            servers: by_name,
        }
    }

    /// Resolve a role set to its authorized servers: union over each
    /// role's servers, deduplicated, in stable name order. An empty role
    /// set resolves to an empty list, not an error.
    pub fn resolve(&self, roles: &BTreeSet<String>) -> Vec<Arc<ToolServerDescriptor>> {
        if roles.contains(&self.all_access_role) {
            return self.servers.values().map(Arc::clone).collect();
        }

        let mut names: BTreeSet<&str> = BTreeSet::new();
        for role in roles {
            if let Some(servers) = self.table.get(role) {
                names.extend(servers.iter().map(String::as_str));
            }
        }
        names
            .into_iter()
            .filter_map(|n| self.servers.get(n).map(Arc::clone))
            .collect()
    }

    /// Authorize one named server for this caller. Unknown servers and
    /// unauthorized servers both resolve to Forbidden — fail-secure, and
    /// no name-probing oracle.
    pub fn authorize(
        &self,
        ctx: &UserContext,
        server_name: &str,
    ) -> Result<Arc<ToolServerDescriptor>, GatewayError> {
        let authorized = self
            .resolve(&ctx.roles)
            .into_iter()
            .find(|s| s.name == server_name);
        authorized.ok_or_else(|| GatewayError::forbidden(server_name))
    }

    /// All registered server names (for health reporting).
    pub fn server_names(&self) -> Vec<String> {
        self.servers.keys().cloned().collect()
    }
}
