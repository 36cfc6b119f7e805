//! A single chat-completion call with `tool_choice: "required"`, forcing the model to return
//! exactly one tool call.
//!
//! Grounded on `vault/llm.rs`'s `OpenRouterClient::chat_completion` (bearer-auth `reqwest`
//! POST, `Instant`-measured latency, typed request/response structs) generalized from a plain
//! content-only completion against a hardcoded OpenRouter URL to a tool-calling completion
//! against a configurable `llm_api_base`, since the spec requires structured tool output rather
//! than free-text content.

use crate::error::AppError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::warn;

#[derive(Debug, Clone)]
pub struct ToolCall {
    pub id: String,
    pub function_name: String,
    pub arguments_json: String,
}

#[derive(Debug, Clone)]
pub struct LlmCallOutput {
    pub model: String,
    pub tool_calls: Vec<ToolCall>,
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub latency_ms: u64,
    /// The provider's own completion id, if it returned one. Stored alongside the decision so
    /// an operator can cross-reference a provider-side trace without this core interpreting it.
    pub trace_id: Option<String>,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn call(&self, model: &str, system: &str, user: &str, tools: &serde_json::Value) -> Result<LlmCallOutput, AppError>;
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: String,
    messages: Vec<ChatMessage>,
    tools: &'a serde_json::Value,
    tool_choice: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: Option<ChatMessageOut>,
}

#[derive(Debug, Deserialize)]
struct ChatMessageOut {
    #[serde(default)]
    tool_calls: Vec<ChatToolCall>,
}

#[derive(Debug, Deserialize)]
struct ChatToolCall {
    id: String,
    function: ChatFunctionCall,
}

#[derive(Debug, Deserialize)]
struct ChatFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: Option<u64>,
    #[serde(default)]
    completion_tokens: Option<u64>,
}

/// Talks to any OpenAI-compatible chat-completions endpoint.
pub struct HttpLlmClient {
    http: reqwest::Client,
    api_base: String,
    api_key: String,
    timeout: Duration,
}

impl HttpLlmClient {
    pub fn new(http: reqwest::Client, api_base: String, api_key: String, timeout: Duration) -> Self {
        Self {
            http,
            api_base,
            api_key,
            timeout,
        }
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn call(&self, model: &str, system: &str, user: &str, tools: &serde_json::Value) -> Result<LlmCallOutput, AppError> {
        let start = Instant::now();

        let req = ChatCompletionRequest {
            model: model.to_string(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user.to_string(),
                },
            ],
            tools,
            tool_choice: "required",
        };

        let url = format!("{}/chat/completions", self.api_base);
        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .timeout(self.timeout)
            .json(&req)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    AppError::LlmTimeout
                } else {
                    warn!(error = %err, "llm transport error");
                    AppError::LlmTransport(err.into())
                }
            })?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| AppError::LlmTransport(e.into()))?;
        if !status.is_success() {
            warn!(status = status.as_u16(), body = %body.chars().take(500).collect::<String>(), "llm call returned a non-success status");
            return Err(AppError::LlmTransport(anyhow::anyhow!(
                "status {status}: {}",
                body.chars().take(500).collect::<String>()
            )));
        }

        let parsed: ChatCompletionResponse = serde_json::from_str(&body)
            .map_err(|e| AppError::LlmFormat(format!("response body did not parse: {e}")))?;
        let message = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .ok_or_else(|| AppError::LlmFormat("response had no choices/message".to_string()))?;

        if message.tool_calls.is_empty() {
            return Err(AppError::LlmFormat(
                "response contained no tool calls despite tool_choice=required".to_string(),
            ));
        }

        let tool_calls = message
            .tool_calls
            .into_iter()
            .map(|tc| ToolCall {
                id: tc.id,
                function_name: tc.function.name,
                arguments_json: tc.function.arguments,
            })
            .collect();

        Ok(LlmCallOutput {
            model: model.to_string(),
            tool_calls,
            prompt_tokens: parsed.usage.as_ref().and_then(|u| u.prompt_tokens),
            completion_tokens: parsed.usage.as_ref().and_then(|u| u.completion_tokens),
            latency_ms: start.elapsed().as_millis() as u64,
            trace_id: parsed.id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_call_extraction_ignores_extras() {
        // Only the first tool call is ever honored downstream (decision::into_decision takes
        // one (name, args) pair); this just documents that extraction itself keeps every call
        // the API returned rather than silently dropping them before that point.
        let raw = r#"{
            "choices": [{
                "message": {
                    "tool_calls": [
                        {"id": "call_1", "function": {"name": "skip_signal", "arguments": "{\"reason\":\"x\",\"category\":\"other\"}"}},
                        {"id": "call_2", "function": {"name": "place_bracket_order", "arguments": "{}"}}
                    ]
                }
            }],
            "usage": {"prompt_tokens": 100, "completion_tokens": 20}
        }"#;
        let parsed: ChatCompletionResponse = serde_json::from_str(raw).unwrap();
        let message = parsed.choices.into_iter().next().unwrap().message.unwrap();
        assert_eq!(message.tool_calls.len(), 2);
        assert_eq!(message.tool_calls[0].function.name, "skip_signal");
    }

    #[test]
    fn empty_tool_calls_response_parses_without_panicking() {
        let raw = r#"{"choices": [{"message": {"tool_calls": []}}]}"#;
        let parsed: ChatCompletionResponse = serde_json::from_str(raw).unwrap();
        assert!(parsed.choices[0].message.as_ref().unwrap().tool_calls.is_empty());
    }
}
