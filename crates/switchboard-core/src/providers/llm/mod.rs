//! Model-provider seam.
//!
//! The orchestrator only ever sees [`LlmClient`]: one streamed model turn
//! in, deltas out through a channel, and the assembled turn (text + tool
//! calls) as the return value. Tests swap in a scripted client.

pub mod openai;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

pub use openai::OpenAiClient;

/// One message of model context.
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Present on assistant messages that requested tool calls.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Value>,
    /// Present on tool-result messages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system",
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user",
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn assistant(content: Option<String>, tool_calls: Option<Value>) -> Self {
        Self {
            role: "assistant",
            content,
            tool_calls,
            tool_call_id: None,
        }
    }

    pub fn tool(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: "tool",
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(call_id.into()),
        }
    }
}

/// A tool advertised to the model. `name` is the namespaced
/// `server__tool` form, since function names cannot carry slashes.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Join a server and tool name into the advertised function name.
pub fn qualified_tool_name(server: &str, tool: &str) -> String {
    format!("{}__{}", server, tool)
}

/// Split an advertised function name back into (server, tool).
pub fn split_tool_name(name: &str) -> Option<(&str, &str)> {
    name.split_once("__")
}

/// One tool call the model requested.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    pub call_id: String,
    /// Namespaced `server__tool` function name.
    pub name: String,
    pub arguments: Value,
}

/// The assembled result of one streamed model turn.
#[derive(Debug, Clone)]
pub struct ModelTurn {
    /// Full text of the turn (deltas were already streamed out).
    pub text: String,
    /// Tool calls in the model's original call order.
    pub tool_calls: Vec<ToolCallRequest>,
}

/// Streaming completion client.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Run one model turn. Content deltas are pushed into `deltas` as
    /// they arrive, unbuffered; the assembled turn is returned when the
    /// model finishes. A closed `deltas` receiver means the caller has
    /// gone away and the implementation should stop promptly.
    async fn stream_turn(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
        deltas: mpsc::Sender<String>,
    ) -> anyhow::Result<ModelTurn>;

    fn provider_name(&self) -> &'static str;
}
