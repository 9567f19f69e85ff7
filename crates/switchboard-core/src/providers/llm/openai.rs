//! OpenAI-compatible streaming chat client.
//!
//! Speaks the `/chat/completions` SSE protocol: `data:` lines carrying
//! delta chunks, tool-call fragments keyed by index, and a `[DONE]`
//! sentinel. Any provider exposing the same surface (the common case for
//! self-hosted gateways) works unchanged.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::{ChatMessage, LlmClient, ModelTurn, ToolCallRequest, ToolSpec};
use crate::config::ModelSettings;

pub struct OpenAiClient {
    base_url: String,
    model: String,
    api_key: String,
    client: reqwest::Client,
}

/// Partially accumulated tool call, keyed by the provider's index field.
#[derive(Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

impl OpenAiClient {
    pub fn from_settings(settings: &ModelSettings) -> anyhow::Result<Self> {
        let api_key = std::env::var(&settings.api_key_env).with_context(|| {
            format!(
                "model API key not found in environment variable {}",
                settings.api_key_env
            )
        })?;
        Ok(Self {
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            model: settings.model.clone(),
            api_key,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(settings.request_timeout_secs))
                .user_agent(concat!("switchboard/", env!("CARGO_PKG_VERSION")))
                .build()?,
        })
    }

    /// Test/dev constructor with an explicit key.
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key: api_key.into(),
            client: reqwest::Client::new(),
        }
    }

    fn request_body(&self, messages: &[ChatMessage], tools: &[ToolSpec]) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
        });
        if !tools.is_empty() {
            body["tools"] = Value::Array(
                tools
                    .iter()
                    .map(|t| {
                        json!({
                            "type": "function",
                            "function": {
                                "name": t.name,
                                "description": t.description,
                                "parameters": t.parameters,
                            }
                        })
                    })
                    .collect(),
            );
        }
        body
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn stream_turn(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
        deltas: mpsc::Sender<String>,
    ) -> anyhow::Result<ModelTurn> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.request_body(messages, tools);

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("sending completion request")?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("model provider error (status {}): {}", status, text);
        }

        let mut text = String::new();
        let mut calls: BTreeMap<u64, PartialCall> = BTreeMap::new();
        let mut buffer = String::new();

        let mut stream = resp.bytes_stream();
        'read: while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("reading completion stream")?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(pos) = buffer.find('\n') {
                let line: String = buffer.drain(..=pos).collect();
                let line = line.trim();
                let Some(payload) = line.strip_prefix("data:") else {
                    continue;
                };
                let payload = payload.trim();
                if payload == "[DONE]" {
                    break 'read;
                }
                let value: Value = match serde_json::from_str(payload) {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!(event = "model_chunk_unparsed", error = %e);
                        continue;
                    }
                };

                let delta = &value["choices"][0]["delta"];
                if let Some(content) = delta["content"].as_str() {
                    text.push_str(content);
                    if deltas.send(content.to_string()).await.is_err() {
                        // Receiver gone: the caller disconnected. Stop
                        // consuming provider output.
                        break 'read;
                    }
                }
                if let Some(fragments) = delta["tool_calls"].as_array() {
                    for fragment in fragments {
                        let index = fragment["index"].as_u64().unwrap_or(0);
                        let entry = calls.entry(index).or_default();
                        if let Some(id) = fragment["id"].as_str() {
                            entry.id = id.to_string();
                        }
                        if let Some(name) = fragment["function"]["name"].as_str() {
                            entry.name.push_str(name);
                        }
                        if let Some(args) = fragment["function"]["arguments"].as_str() {
                            entry.arguments.push_str(args);
                        }
                    }
                }
            }
        }

        // BTreeMap iteration keeps the provider's index order — the
        // model's original call order.
        let tool_calls = calls
            .into_values()
            .map(|c| {
                let arguments = if c.arguments.trim().is_empty() {
                    json!({})
                } else {
                    serde_json::from_str(&c.arguments).unwrap_or_else(|e| {
                        tracing::warn!(event = "tool_arguments_unparsed", call_id = %c.id, error = %e);
                        json!({})
                    })
                };
                ToolCallRequest {
                    call_id: c.id,
                    name: c.name,
                    arguments,
                }
            })
            .collect();

        Ok(ModelTurn { text, tool_calls })
    }

    fn provider_name(&self) -> &'static str {
        "openai"
    }
}
