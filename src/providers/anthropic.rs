//! Native Anthropic Messages API client.
//!
//! Speaks `POST /v1/messages` directly, translating between the flat wire
//! forms used internally and the Anthropic-native format (top-level system
//! field, `input_schema` tool definitions, content blocks).

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use backon::Retryable;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::base::{
    ChatMessage, CompletionOptions, CompletionResponse, LLMClient, TokenUsage, ToolCall,
};
use super::retry::{adjust_for_rate_limit, provider_backoff};
use crate::errors::ProviderError;

const ANTHROPIC_API_BASE: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Client for the Anthropic Messages API.
pub struct AnthropicClient {
    api_key: String,
    api_base: String,
    default_model: String,
    client: Client,
}

impl AnthropicClient {
    pub fn new(api_key: &str, api_base: Option<&str>, model: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            api_base: api_base
                .unwrap_or(ANTHROPIC_API_BASE)
                .trim_end_matches('/')
                .to_string(),
            default_model: model.to_string(),
            client: Client::new(),
        }
    }

    fn build_body(&self, messages: &[ChatMessage], options: &CompletionOptions) -> Value {
        let mut body = json!({
            "model": self.default_model,
            "max_tokens": options.max_tokens,
            "messages": translate_messages(messages),
        });

        if let Some(system) = &options.system_prompt {
            body["system"] = json!(system);
        }

        if !options.tools.is_empty() {
            let tool_defs: Vec<Value> = options
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t["name"],
                        "description": t["description"],
                        "input_schema": t["parameters"],
                    })
                })
                .collect();
            body["tools"] = Value::Array(tool_defs);
        }

        if let Some(budget) = options.thinking_budget {
            body["thinking"] = json!({"type": "enabled", "budget_tokens": budget});
        } else {
            body["temperature"] = json!(options.temperature);
        }

        body
    }

    async fn request_once(&self, body: &Value) -> Result<CompletionResponse, ProviderError> {
        let url = format!("{}/v1/messages", self.api_base);
        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(e.to_string())
                } else {
                    ProviderError::Unknown(format!("HTTP request failed: {}", e))
                }
            })?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let text = response
            .text()
            .await
            .map_err(|e| ProviderError::Unknown(format!("failed to read response body: {}", e)))?;

        if !status.is_success() {
            return Err(classify_status(status.as_u16(), retry_after, &text));
        }

        let data: Value = serde_json::from_str(&text)
            .map_err(|e| ProviderError::Unknown(format!("failed to parse response JSON: {}", e)))?;
        Ok(parse_response(&data))
    }
}

/// Translate flat role/content messages to Anthropic format, merging
/// consecutive same-role messages (the API requires alternation).
fn translate_messages(messages: &[ChatMessage]) -> Vec<Value> {
    let mut out: Vec<(String, String)> = Vec::new();
    for msg in messages {
        let role = if msg.role == "assistant" {
            "assistant"
        } else {
            "user"
        };
        match out.last_mut() {
            Some((last_role, content)) if last_role == role => {
                content.push_str("\n\n");
                content.push_str(&msg.content);
            }
            _ => out.push((role.to_string(), msg.content.clone())),
        }
    }
    out.into_iter()
        .map(|(role, content)| json!({"role": role, "content": content}))
        .collect()
}

fn classify_status(status: u16, retry_after: Option<u64>, body: &str) -> ProviderError {
    let message = crate::utils::helpers::truncate_string(body, 300);
    match status {
        401 | 403 => ProviderError::AuthError { status, message },
        408 => ProviderError::Timeout(message),
        429 => ProviderError::RateLimit {
            status,
            retry_after_secs: retry_after.unwrap_or(5),
        },
        400 | 413 => {
            if body.contains("prompt is too long") || body.contains("max_tokens") {
                ProviderError::ContextOverflow(message)
            } else {
                ProviderError::InvalidRequest { status, message }
            }
        }
        500..=599 => ProviderError::ServiceUnavailable { status, message },
        _ => ProviderError::Unknown(format!("HTTP {}: {}", status, message)),
    }
}

/// Parse a Messages API response document: content blocks + usage.
fn parse_response(data: &Value) -> CompletionResponse {
    let mut content = String::new();
    let mut thinking: Option<String> = None;
    let mut tool_calls: Vec<ToolCall> = Vec::new();

    if let Some(blocks) = data["content"].as_array() {
        for block in blocks {
            match block["type"].as_str() {
                Some("text") => {
                    content.push_str(block["text"].as_str().unwrap_or(""));
                }
                Some("thinking") => {
                    thinking = block["thinking"].as_str().map(String::from);
                }
                Some("tool_use") => {
                    let name = block["name"].as_str().unwrap_or("").to_string();
                    let arguments: HashMap<String, Value> = block["input"]
                        .as_object()
                        .map(|o| o.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                        .unwrap_or_default();
                    if !name.is_empty() {
                        tool_calls.push(ToolCall { name, arguments });
                    }
                }
                _ => {}
            }
        }
    }

    let usage = data.get("usage").map(|u| {
        let cached = u["cache_read_input_tokens"].as_u64();
        TokenUsage {
            input_tokens: u["input_tokens"].as_u64().unwrap_or(0),
            output_tokens: u["output_tokens"].as_u64().unwrap_or(0),
            cache_hit: cached.map(|c| c > 0),
            cached_tokens: cached,
        }
    });

    CompletionResponse {
        content,
        tool_calls,
        usage,
        thinking,
    }
}

#[async_trait]
impl LLMClient for AnthropicClient {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<CompletionResponse> {
        let body = self.build_body(messages, options);
        debug!(
            "messages request: model={}, messages={}, tools={}",
            self.default_model,
            messages.len(),
            options.tools.len()
        );

        let response = (|| async { self.request_once(&body).await })
            .retry(provider_backoff())
            .when(|e: &ProviderError| e.recoverable())
            .adjust(adjust_for_rate_limit)
            .notify(|err: &ProviderError, dur| {
                warn!("LLM request failed ({}), retrying in {:?}", err, dur);
            })
            .await?;

        Ok(response)
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_translate_merges_consecutive_same_role() {
        let messages = vec![
            ChatMessage::user("question"),
            ChatMessage::assistant("thought"),
            ChatMessage::user("tool result 1"),
            ChatMessage::user("tool result 2"),
        ];
        let translated = translate_messages(&messages);
        assert_eq!(translated.len(), 3);
        assert_eq!(translated[2]["role"], "user");
        let merged = translated[2]["content"].as_str().unwrap();
        assert!(merged.contains("tool result 1"));
        assert!(merged.contains("tool result 2"));
    }

    #[test]
    fn test_build_body_tools_use_input_schema() {
        let client = AnthropicClient::new("sk-ant-x", None, "claude-sonnet-4-5-20250929");
        let options = CompletionOptions {
            tools: vec![json!({
                "name": "read_file",
                "description": "read",
                "parameters": {"type": "object", "properties": {}, "required": []}
            })],
            ..Default::default()
        };
        let body = client.build_body(&[ChatMessage::user("hi")], &options);
        assert_eq!(body["tools"][0]["name"], "read_file");
        assert!(body["tools"][0]["input_schema"].is_object());
        assert!(body["tools"][0].get("parameters").is_none());
    }

    #[test]
    fn test_build_body_thinking_replaces_temperature() {
        let client = AnthropicClient::new("sk-ant-x", None, "claude-sonnet-4-5-20250929");
        let options = CompletionOptions {
            thinking_budget: Some(2048),
            ..Default::default()
        };
        let body = client.build_body(&[ChatMessage::user("hi")], &options);
        assert_eq!(body["thinking"]["budget_tokens"], 2048);
        assert!(body.get("temperature").is_none());
    }

    #[test]
    fn test_parse_response_blocks() {
        let data = json!({
            "content": [
                {"type": "thinking", "thinking": "check the repo"},
                {"type": "text", "text": "I found it."},
                {"type": "tool_use", "id": "tu_1", "name": "read_file", "input": {"path": "a.rs"}}
            ],
            "usage": {"input_tokens": 50, "output_tokens": 9, "cache_read_input_tokens": 40}
        });
        let resp = parse_response(&data);
        assert_eq!(resp.content, "I found it.");
        assert_eq!(resp.thinking.as_deref(), Some("check the repo"));
        assert_eq!(resp.tool_calls[0].name, "read_file");
        let usage = resp.usage.unwrap();
        assert_eq!(usage.cached_tokens, Some(40));
        assert_eq!(usage.cache_hit, Some(true));
    }
}
