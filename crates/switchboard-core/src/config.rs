//! Gateway configuration: YAML file plus `SWITCHBOARD_*` environment
//! overrides, validated once at startup.

use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use serde::Deserialize;
use url::Url;

use crate::model::{ToolDescriptor, ToolServerDescriptor};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Shared control store (revocations + pending confirmations).
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,

    /// JSONL audit trail; disabled when unset.
    #[serde(default)]
    pub audit_log: Option<PathBuf>,

    /// Composite role that expands to every registered server.
    #[serde(default = "default_all_access_role")]
    pub all_access_role: String,

    pub auth: AuthSettings,

    #[serde(default)]
    pub revocation: RevocationSettings,

    pub model: ModelSettings,

    #[serde(default)]
    pub filter: FilterSettings,

    #[serde(default)]
    pub breaker: BreakerSettings,

    #[serde(default)]
    pub timeouts: TimeoutSettings,

    #[serde(default)]
    pub turn: TurnSettings,

    pub servers: Vec<ServerSettings>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthSettings {
    /// JWKS endpoint of the identity provider.
    pub jwks_uri: Option<Url>,
    pub issuer: Option<String>,
    #[serde(default)]
    pub audience: Vec<String>,
    #[serde(default = "default_leeway_secs")]
    pub clock_skew_leeway_secs: u64,
    /// Reject requests while revocation data is stale (default: serve the
    /// last-known set).
    #[serde(default)]
    pub fail_closed: bool,
    /// Skip the private-address check on the JWKS URI (development only).
    #[serde(default)]
    pub allow_private_jwks: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RevocationSettings {
    #[serde(default = "default_refresh_ms")]
    pub refresh_interval_ms: u64,
}

impl Default for RevocationSettings {
    fn default() -> Self {
        Self {
            refresh_interval_ms: default_refresh_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelSettings {
    #[serde(default = "default_model_base_url")]
    pub base_url: String,
    pub model: String,
    /// Name of the environment variable holding the provider API key. The
    /// key itself never lives in the config file.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_model_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilterSettings {
    #[serde(default = "default_max_query_chars")]
    pub max_query_chars: usize,
    /// Deployment-specific patterns appended to the built-in blocklist.
    #[serde(default)]
    pub extra_blocklist: Vec<String>,
}

impl Default for FilterSettings {
    fn default() -> Self {
        Self {
            max_query_chars: default_max_query_chars(),
            extra_blocklist: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BreakerSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeoutSettings {
    /// Read-class tool calls.
    #[serde(default = "default_read_ms")]
    pub read_ms: u64,
    /// Write-class tool calls.
    #[serde(default = "default_write_ms")]
    pub write_ms: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            read_ms: default_read_ms(),
            write_ms: default_write_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TurnSettings {
    /// Whole-turn ceiling, independent of per-tool timeouts.
    #[serde(default = "default_turn_timeout_secs")]
    pub timeout_secs: u64,
    /// Upper bound on model → tool → model rounds in one turn.
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: usize,
}

impl Default for TurnSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_turn_timeout_secs(),
            max_tool_rounds: default_max_tool_rounds(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSettings {
    pub name: String,
    pub base_url: Url,
    /// Roles that grant access to this server.
    pub roles: Vec<String>,
    #[serde(default)]
    pub tools: Vec<ToolDescriptor>,
    /// Tool names classified as writes.
    #[serde(default)]
    pub write_tools: Vec<String>,
    /// Per-tool timeout overrides (escape hatch over the read/write
    /// category defaults).
    #[serde(default)]
    pub tool_timeouts_ms: BTreeMap<String, u64>,
}

fn default_listen_addr() -> String {
    "127.0.0.1:8080".to_string()
}
fn default_store_path() -> PathBuf {
    PathBuf::from("switchboard.db")
}
fn default_all_access_role() -> String {
    "admin".to_string()
}
fn default_leeway_secs() -> u64 {
    30
}
fn default_refresh_ms() -> u64 {
    2_000
}
fn default_model_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_api_key_env() -> String {
    "SWITCHBOARD_MODEL_API_KEY".to_string()
}
fn default_model_timeout_secs() -> u64 {
    120
}
fn default_max_query_chars() -> usize {
    10_000
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_cooldown_secs() -> u64 {
    30
}
fn default_read_ms() -> u64 {
    10_000
}
fn default_write_ms() -> u64 {
    30_000
}
fn default_turn_timeout_secs() -> u64 {
    120
}
fn default_max_tool_rounds() -> usize {
    8
}

impl GatewayConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let mut cfg = Self::from_yaml(&content)?;
        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(content).context("parsing gateway config")
    }

    /// Environment overrides, applied after file parsing.
    pub fn apply_env(&mut self) {
        if let Ok(v) = env::var("SWITCHBOARD_LISTEN_ADDR") {
            self.listen_addr = v;
        }
        if let Ok(v) = env::var("SWITCHBOARD_STORE_PATH") {
            self.store_path = PathBuf::from(v);
        }
        if let Ok(v) = env::var("SWITCHBOARD_JWKS_URI") {
            match Url::parse(&v) {
                Ok(u) => self.auth.jwks_uri = Some(u),
                Err(e) => tracing::warn!(event = "config_env_ignored", var = "SWITCHBOARD_JWKS_URI", error = %e),
            }
        }
        if let Ok(v) = env::var("SWITCHBOARD_AUTH_ISSUER") {
            self.auth.issuer = Some(v);
        }
        if let Ok(v) = env::var("SWITCHBOARD_AUTH_AUDIENCE") {
            self.auth.audience = v.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Ok(v) = env::var("SWITCHBOARD_MODEL_BASE_URL") {
            self.model.base_url = v;
        }
        if let Ok(v) = env::var("SWITCHBOARD_AUDIT_LOG") {
            self.audit_log = Some(PathBuf::from(v));
        }
    }

    /// Startup validation with actionable messages. Fail-secure: a config
    /// that cannot be trusted refuses to start.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.servers.is_empty() {
            anyhow::bail!("no tool servers configured; at least one `servers` entry is required");
        }

        let mut seen = std::collections::BTreeSet::new();
        for server in &self.servers {
            if !seen.insert(&server.name) {
                anyhow::bail!("duplicate tool server name '{}'", server.name);
            }
            if server.roles.is_empty() {
                anyhow::bail!(
                    "server '{}' has no roles; it would be reachable only via the all-access role — list that intent explicitly",
                    server.name
                );
            }
            let tool_names: std::collections::BTreeSet<&str> =
                server.tools.iter().map(|t| t.name.as_str()).collect();
            for w in &server.write_tools {
                if !tool_names.contains(w.as_str()) {
                    anyhow::bail!(
                        "server '{}' marks unknown tool '{}' as a write tool",
                        server.name,
                        w
                    );
                }
            }
        }

        if self.auth.jwks_uri.is_none() {
            anyhow::bail!("auth.jwks_uri is required; the gateway cannot validate tokens without a key set");
        }
        if self.revocation.refresh_interval_ms == 0 {
            anyhow::bail!("revocation.refresh_interval_ms must be positive");
        }
        Ok(())
    }

    /// Immutable server descriptors, built once and shared.
    pub fn descriptors(&self) -> Vec<Arc<ToolServerDescriptor>> {
        self.servers
            .iter()
            .map(|s| {
                Arc::new(ToolServerDescriptor {
                    name: s.name.clone(),
                    base_url: s.base_url.as_str().trim_end_matches('/').to_string(),
                    required_roles: s.roles.iter().cloned().collect(),
                    tools: s.tools.clone(),
                    write_tools: s.write_tools.iter().cloned().collect(),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
auth:
  jwks_uri: "https://auth.example.com/jwks.json"
  issuer: "https://auth.example.com"
  audience: ["switchboard"]
model:
  model: "gpt-4o"
servers:
  - name: finance
    base_url: "http://finance.internal:9000/"
    roles: [finance-read, finance-write]
    tools:
      - name: list_invoices
        description: "List invoices"
      - name: delete_invoice
        description: "Delete one invoice"
    write_tools: [delete_invoice]
"#;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let cfg = GatewayConfig::from_yaml(MINIMAL).unwrap();
        cfg.validate().unwrap();

        assert_eq!(cfg.listen_addr, "127.0.0.1:8080");
        assert_eq!(cfg.revocation.refresh_interval_ms, 2_000);
        assert_eq!(cfg.filter.max_query_chars, 10_000);
        assert_eq!(cfg.breaker.failure_threshold, 5);
        assert_eq!(cfg.turn.max_tool_rounds, 8);
        assert_eq!(cfg.all_access_role, "admin");
    }

    #[test]
    fn descriptors_strip_trailing_slash() {
        let cfg = GatewayConfig::from_yaml(MINIMAL).unwrap();
        let descs = cfg.descriptors();
        assert_eq!(descs.len(), 1);
        assert_eq!(descs[0].base_url, "http://finance.internal:9000");
        assert!(descs[0].write_tools.contains("delete_invoice"));
    }

    #[test]
    fn unknown_write_tool_is_rejected() {
        let broken = MINIMAL.replace("write_tools: [delete_invoice]", "write_tools: [drop_table]");
        let cfg = GatewayConfig::from_yaml(&broken).unwrap();
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("drop_table"));
    }

    #[test]
    fn empty_server_list_is_rejected() {
        let broken = r#"
auth:
  jwks_uri: "https://auth.example.com/jwks.json"
model:
  model: "gpt-4o"
servers: []
"#;
        let cfg = GatewayConfig::from_yaml(broken).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn missing_jwks_uri_is_rejected() {
        let broken = MINIMAL.replace("  jwks_uri: \"https://auth.example.com/jwks.json\"\n", "");
        let cfg = GatewayConfig::from_yaml(&broken).unwrap();
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("jwks_uri"));
    }
}
