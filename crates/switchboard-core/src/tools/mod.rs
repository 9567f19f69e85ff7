//! Downstream tool invocation.
//!
//! The client forwards calls with the caller's identity as metadata,
//! applies per-operation timeouts, and converts every failure mode into a
//! structured outcome instead of an error — a dead server must cost one
//! degraded result, not the whole turn.

pub mod breaker;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::{BreakerSettings, ServerSettings, TimeoutSettings};
use crate::model::{PendingAction, ToolEnvelope, ToolServerDescriptor, UserContext};
use breaker::CircuitBreaker;
pub use breaker::BreakerState;

/// Read calls get the short timeout, writes the longer one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationClass {
    Read,
    Write,
}

/// What one tool call produced. Degradations are data, not errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    /// The server answered with data.
    Success {
        data: Value,
        truncated: bool,
        cursor: Option<String>,
    },
    /// The server deferred a mutation pending explicit approval.
    NeedsConfirmation {
        summary: String,
        action: PendingAction,
    },
    /// The server answered with a structured error; passed through
    /// unmodified.
    Failed {
        code: String,
        message: String,
        remediation: Option<String>,
    },
    /// Timeout, transport failure, or open circuit. The turn continues.
    Unavailable { message: String },
}

/// Seam between the orchestrator and the HTTP client, mirroring the
/// model-provider seam: tests swap in a scripted invoker.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn invoke(
        &self,
        ctx: &UserContext,
        server: &ToolServerDescriptor,
        tool: &str,
        arguments: &Value,
    ) -> ToolOutcome;
}

/// HTTP tool client with per-server circuit breakers.
pub struct ToolClient {
    http: reqwest::Client,
    breakers: BTreeMap<String, CircuitBreaker>,
    timeouts: TimeoutSettings,
    /// "server/tool" → override, the escape hatch over the category
    /// defaults.
    tool_overrides: BTreeMap<String, Duration>,
}

impl ToolClient {
    pub fn new(
        servers: &[ServerSettings],
        timeouts: TimeoutSettings,
        breaker_settings: &BreakerSettings,
    ) -> anyhow::Result<Self> {
        // Per-request timeouts are set explicitly; the builder timeout is
        // a backstop for anything that slips through.
        let http = reqwest::Client::builder()
            .user_agent(concat!("switchboard/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(120))
            .build()?;

        let mut breakers = BTreeMap::new();
        let mut tool_overrides = BTreeMap::new();
        for server in servers {
            breakers.insert(
                server.name.clone(),
                CircuitBreaker::new(
                    server.name.clone(),
                    breaker_settings.failure_threshold,
                    Duration::from_secs(breaker_settings.cooldown_secs),
                ),
            );
            for (tool, ms) in &server.tool_timeouts_ms {
                tool_overrides.insert(
                    format!("{}/{}", server.name, tool),
                    Duration::from_millis(*ms),
                );
            }
        }

        Ok(Self {
            http,
            breakers,
            timeouts,
            tool_overrides,
        })
    }

    /// Classify a tool call against the server's declared write set.
    pub fn operation_class(server: &ToolServerDescriptor, tool: &str) -> OperationClass {
        if server.write_tools.contains(tool) {
            OperationClass::Write
        } else {
            OperationClass::Read
        }
    }

    fn deadline(&self, server: &ToolServerDescriptor, tool: &str) -> Duration {
        if let Some(d) = self.tool_overrides.get(&format!("{}/{}", server.name, tool)) {
            return *d;
        }
        match Self::operation_class(server, tool) {
            OperationClass::Read => Duration::from_millis(self.timeouts.read_ms),
            OperationClass::Write => Duration::from_millis(self.timeouts.write_ms),
        }
    }

    /// Breaker states for health reporting.
    pub fn breaker_states(&self) -> BTreeMap<String, BreakerState> {
        self.breakers
            .iter()
            .map(|(name, b)| (name.clone(), b.state()))
            .collect()
    }

    fn breaker(&self, server: &str) -> Option<&CircuitBreaker> {
        self.breakers.get(server)
    }
}

#[async_trait]
impl ToolInvoker for ToolClient {
    async fn invoke(
        &self,
        ctx: &UserContext,
        server: &ToolServerDescriptor,
        tool: &str,
        arguments: &Value,
    ) -> ToolOutcome {
        let breaker = match self.breaker(&server.name) {
            Some(b) => b,
            None => {
                return ToolOutcome::Unavailable {
                    message: format!("server '{}' is not registered", server.name),
                }
            }
        };

        if breaker.try_acquire().is_err() {
            tracing::debug!(event = "tool_short_circuit", server = %server.name, tool = tool);
            return ToolOutcome::Unavailable {
                message: format!("server '{}' circuit is open", server.name),
            };
        }

        let url = format!("{}/tools/{}", server.base_url, tool);
        let deadline = self.deadline(server, tool);

        tracing::debug!(
            event = "tool_call",
            server = %server.name,
            tool = tool,
            timeout_ms = deadline.as_millis() as u64
        );

        // UserContext rides along as metadata; row filtering is the
        // downstream server's job, never the gateway's.
        let result = self
            .http
            .post(&url)
            .header("x-caller-subject", &ctx.subject)
            .header("x-caller-roles", ctx.roles_csv())
            .timeout(deadline)
            .json(arguments)
            .send()
            .await;

        let response = match result {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                breaker.record_failure();
                return ToolOutcome::Unavailable {
                    message: format!(
                        "'{}' timed out after {} ms",
                        tool,
                        deadline.as_millis()
                    ),
                };
            }
            Err(e) => {
                breaker.record_failure();
                return ToolOutcome::Unavailable {
                    message: format!("'{}' transport failure: {}", server.name, e),
                };
            }
        };

        let status = response.status();
        let envelope: Result<ToolEnvelope, _> = response.json().await;
        match envelope {
            Ok(env) => {
                breaker.record_success();
                match env {
                    ToolEnvelope::Ok {
                        data,
                        truncated,
                        cursor,
                    } => ToolOutcome::Success {
                        data,
                        truncated,
                        cursor,
                    },
                    ToolEnvelope::PendingConfirmation { summary, action } => {
                        ToolOutcome::NeedsConfirmation { summary, action }
                    }
                    ToolEnvelope::Error {
                        code,
                        message,
                        remediation,
                    } => ToolOutcome::Failed {
                        code,
                        message,
                        remediation,
                    },
                }
            }
            Err(e) => {
                // Not speaking the envelope contract counts as a server
                // failure for breaker purposes.
                breaker.record_failure();
                ToolOutcome::Unavailable {
                    message: format!(
                        "'{}' returned an invalid envelope (status {}): {}",
                        server.name, status, e
                    ),
                }
            }
        }
    }
}

/// Supplementary context handed to the model when a result was truncated:
/// the model must tell the user the data is incomplete and suggest
/// narrowing. Injected as accompanying context, never altering the data.
pub fn truncation_notice(tool: &str, cursor: Option<&str>) -> String {
    let mut notice = format!(
        "Note: the result of '{}' was truncated by the server and is incomplete. \
         You must tell the user the list is incomplete and suggest narrowing the query.",
        tool
    );
    if let Some(c) = cursor {
        notice.push_str(&format!(
            " Further rows can be fetched with pagination cursor '{}'.",
            c
        ));
    }
    notice
}
