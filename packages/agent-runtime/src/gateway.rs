//! Provider Gateway (§4.5) — canonical request/response shapes plus a
//! registry of per-provider adapters translating to each vendor's wire
//! protocol. Grounded in the teacher's `OpenAIClient::chat_completion`
//! (request building, bearer auth, status-code handling, response
//! parsing) generalized to a `provider_id -> adapter` map instead of one
//! hardcoded vendor (§9: "Provider Gateway is an interface with one
//! operation; each adapter is a value implementing it").

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::error::ProviderError;
use crate::tool::ToolDefinition;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

/// One block of message content. Separate variants for text, a tool
/// invocation the model requested, and a tool's result, matching the
/// canonical response shape from §6 (`text | tool_use(name, input, id)`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    ToolUse { id: String, name: String, input: serde_json::Value },
    ToolResult { tool_use_id: String, content: String, is_error: bool },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderMessage {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl ProviderMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self { role: Role::User, content: vec![ContentBlock::Text { text: text.into() }] }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    EndOfTurn,
    ToolUse,
    Length,
    Error,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ProviderUsage {
    pub in_tokens: i64,
    pub out_tokens: i64,
}

/// `{system_prompt, messages[], tools[]}` from §4.5/§6.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub system: Option<String>,
    pub messages: Vec<ProviderMessage>,
    pub tools: Vec<ToolDefinition>,
    /// Advisory only; the Agent Loop is the one that enforces the cap
    /// (§6: "advisory, enforced by Agent Loop").
    pub max_iterations: Option<u32>,
}

/// `{content_blocks[], tool_calls[], finish_reason, usage}` from §4.5.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub blocks: Vec<ContentBlock>,
    pub finish_reason: FinishReason,
    pub usage: ProviderUsage,
}

impl ProviderResponse {
    pub fn text(&self) -> String {
        self.blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn tool_uses(&self) -> Vec<(&str, &str, &serde_json::Value)> {
        self.blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, name, input } => Some((id.as_str(), name.as_str(), input)),
                _ => None,
            })
            .collect()
    }
}

/// One LLM provider, reachable by `invoke(model, request)`. §4.5 requires
/// every call to consult the Circuit Breaker before and after; that is
/// the caller's responsibility (the Agent Loop), not the adapter's, so
/// the same adapter can be exercised in tests without a breaker.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider_id(&self) -> &str;
    async fn invoke(&self, model: &str, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError>;
}

/// `provider_id -> adapter` map (§9). No base-class inheritance, just a
/// registry of trait objects.
#[derive(Default)]
pub struct ProviderRegistry {
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.adapters.insert(adapter.provider_id().to_string(), adapter);
        self
    }

    pub fn get(&self, provider_id: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(provider_id).cloned()
    }
}

// =============================================================================
// Anthropic adapter
// =============================================================================

pub struct AnthropicAdapter {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl AnthropicAdapter {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self { http: reqwest::Client::new(), api_key: api_key.into(), base_url: "https://api.anthropic.com/v1".to_string() }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn provider_id(&self) -> &str {
        "anthropic"
    }

    async fn invoke(&self, model: &str, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let messages: Vec<serde_json::Value> = request.messages.iter().map(to_anthropic_message).collect();

        let mut body = json!({
            "model": model,
            "max_tokens": 4096,
            "messages": messages,
        });
        if let Some(system) = &request.system {
            body["system"] = json!(system);
        }
        if !request.tools.is_empty() {
            let tools: Vec<serde_json::Value> = request
                .tools
                .iter()
                .map(|t| json!({"name": t.name, "description": t.description, "input_schema": t.input_schema}))
                .collect();
            body["tools"] = json!(tools);
        }

        let response = self
            .http
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ProviderError::RateLimited("anthropic rate limit".to_string()));
        }
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(ProviderError::Unauthorized(response.text().await.unwrap_or_default()));
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ProviderError::ModelNotFound(model.to_string()));
        }
        if status.is_server_error() {
            let text = response.text().await.unwrap_or_default();
            warn!(status = %status, "anthropic server error");
            return Err(ProviderError::Network(text));
        }
        if !status.is_success() {
            return Err(ProviderError::Api(response.text().await.unwrap_or_default()));
        }

        let raw: AnthropicResponse = response.json().await.map_err(|e| ProviderError::Parse(e.to_string()))?;
        debug!(model, stop_reason = %raw.stop_reason, "anthropic response received");
        Ok(raw.into_canonical())
    }
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicBlock>,
    stop_reason: String,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicBlock {
    Text { text: String },
    ToolUse { id: String, name: String, input: serde_json::Value },
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: i64,
    output_tokens: i64,
}

impl AnthropicResponse {
    fn into_canonical(self) -> ProviderResponse {
        let finish_reason = match self.stop_reason.as_str() {
            "end_turn" | "stop_sequence" => FinishReason::EndOfTurn,
            "tool_use" => FinishReason::ToolUse,
            "max_tokens" => FinishReason::Length,
            _ => FinishReason::Error,
        };
        let blocks = self
            .content
            .into_iter()
            .map(|b| match b {
                AnthropicBlock::Text { text } => ContentBlock::Text { text },
                AnthropicBlock::ToolUse { id, name, input } => ContentBlock::ToolUse { id, name, input },
            })
            .collect();
        ProviderResponse {
            blocks,
            finish_reason,
            usage: ProviderUsage { in_tokens: self.usage.input_tokens, out_tokens: self.usage.output_tokens },
        }
    }
}

fn to_anthropic_message(msg: &ProviderMessage) -> serde_json::Value {
    let role = match msg.role {
        Role::User | Role::Tool => "user",
        Role::Assistant => "assistant",
    };
    let content: Vec<serde_json::Value> = msg
        .content
        .iter()
        .map(|b| match b {
            ContentBlock::Text { text } => json!({"type": "text", "text": text}),
            ContentBlock::ToolUse { id, name, input } => json!({"type": "tool_use", "id": id, "name": name, "input": input}),
            ContentBlock::ToolResult { tool_use_id, content, is_error } => {
                json!({"type": "tool_result", "tool_use_id": tool_use_id, "content": content, "is_error": is_error})
            }
        })
        .collect();
    json!({"role": role, "content": content})
}

// =============================================================================
// OpenAI adapter
// =============================================================================

pub struct OpenAiAdapter {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl OpenAiAdapter {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self { http: reqwest::Client::new(), api_key: api_key.into(), base_url: "https://api.openai.com/v1".to_string() }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn provider_id(&self) -> &str {
        "openai"
    }

    async fn invoke(&self, model: &str, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.extend(request.messages.iter().map(to_openai_message));

        let mut body = json!({"model": model, "messages": messages});
        if !request.tools.is_empty() {
            let tools: Vec<serde_json::Value> = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {"name": t.name, "description": t.description, "parameters": t.input_schema}
                    })
                })
                .collect();
            body["tools"] = json!(tools);
            body["tool_choice"] = json!("auto");
        }

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ProviderError::RateLimited("openai rate limit".to_string()));
        }
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(ProviderError::Unauthorized(response.text().await.unwrap_or_default()));
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ProviderError::ModelNotFound(model.to_string()));
        }
        if status.is_server_error() {
            let text = response.text().await.unwrap_or_default();
            warn!(status = %status, "openai server error");
            return Err(ProviderError::Network(text));
        }
        if !status.is_success() {
            return Err(ProviderError::Api(response.text().await.unwrap_or_default()));
        }

        let raw: OpenAiResponse = response.json().await.map_err(|e| ProviderError::Parse(e.to_string()))?;
        raw.into_canonical()
    }
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
    finish_reason: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<OpenAiToolCall>,
}

#[derive(Debug, Deserialize)]
struct OpenAiToolCall {
    id: String,
    function: OpenAiFunctionCall,
}

#[derive(Debug, Deserialize)]
struct OpenAiFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    prompt_tokens: i64,
    completion_tokens: i64,
}

impl OpenAiResponse {
    fn into_canonical(self) -> Result<ProviderResponse, ProviderError> {
        let choice = self.choices.into_iter().next().ok_or_else(|| ProviderError::Parse("no choices in response".to_string()))?;

        let mut blocks = Vec::new();
        if let Some(text) = choice.message.content.filter(|c| !c.is_empty()) {
            blocks.push(ContentBlock::Text { text });
        }
        for tc in choice.message.tool_calls {
            let input: serde_json::Value = serde_json::from_str(&tc.function.arguments)
                .map_err(|e| ProviderError::Parse(format!("invalid tool call arguments: {e}")))?;
            blocks.push(ContentBlock::ToolUse { id: tc.id, name: tc.function.name, input });
        }

        let has_tool_use = blocks.iter().any(|b| matches!(b, ContentBlock::ToolUse { .. }));
        let finish_reason = match choice.finish_reason.as_str() {
            "tool_calls" => FinishReason::ToolUse,
            "length" => FinishReason::Length,
            "stop" if has_tool_use => FinishReason::ToolUse,
            "stop" => FinishReason::EndOfTurn,
            _ => FinishReason::Error,
        };

        let usage = self
            .usage
            .map(|u| ProviderUsage { in_tokens: u.prompt_tokens, out_tokens: u.completion_tokens })
            .unwrap_or_default();

        Ok(ProviderResponse { blocks, finish_reason, usage })
    }
}

fn to_openai_message(msg: &ProviderMessage) -> serde_json::Value {
    match msg.role {
        Role::User => {
            let text = msg
                .content
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.clone()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n");
            json!({"role": "user", "content": text})
        }
        Role::Assistant => {
            let text: Vec<String> = msg
                .content
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.clone()),
                    _ => None,
                })
                .collect();
            let tool_calls: Vec<serde_json::Value> = msg
                .content
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolUse { id, name, input } => {
                        Some(json!({"id": id, "type": "function", "function": {"name": name, "arguments": input.to_string()}}))
                    }
                    _ => None,
                })
                .collect();
            let mut value = json!({
                "role": "assistant",
                "content": if text.is_empty() { serde_json::Value::Null } else { json!(text.join("\n")) }
            });
            if !tool_calls.is_empty() {
                value["tool_calls"] = json!(tool_calls);
            }
            value
        }
        Role::Tool => {
            let found = msg.content.iter().find_map(|b| match b {
                ContentBlock::ToolResult { tool_use_id, content, .. } => Some((tool_use_id.clone(), content.clone())),
                _ => None,
            });
            match found {
                Some((id, content)) => json!({"role": "tool", "tool_call_id": id, "content": content}),
                None => json!({"role": "tool", "content": ""}),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_resolves_by_provider_id() {
        let registry = ProviderRegistry::new()
            .register(Arc::new(AnthropicAdapter::new("key")))
            .register(Arc::new(OpenAiAdapter::new("key")));

        assert!(registry.get("anthropic").is_some());
        assert!(registry.get("openai").is_some());
        assert!(registry.get("mistral").is_none());
    }

    #[test]
    fn anthropic_stop_reason_maps_to_canonical_finish_reason() {
        let raw = AnthropicResponse {
            content: vec![AnthropicBlock::Text { text: "hi".to_string() }],
            stop_reason: "end_turn".to_string(),
            usage: AnthropicUsage { input_tokens: 10, output_tokens: 5 },
        };
        let response = raw.into_canonical();
        assert_eq!(response.finish_reason, FinishReason::EndOfTurn);
        assert_eq!(response.text(), "hi");
        assert_eq!(response.usage.in_tokens, 10);
    }

    #[test]
    fn anthropic_tool_use_stop_reason_preserves_tool_calls() {
        let raw = AnthropicResponse {
            content: vec![AnthropicBlock::ToolUse {
                id: "call_1".to_string(),
                name: "read_file".to_string(),
                input: json!({"path": "a.txt"}),
            }],
            stop_reason: "tool_use".to_string(),
            usage: AnthropicUsage { input_tokens: 1, output_tokens: 1 },
        };
        let response = raw.into_canonical();
        assert_eq!(response.finish_reason, FinishReason::ToolUse);
        assert_eq!(response.tool_uses().len(), 1);
    }

    #[test]
    fn openai_finish_reason_tool_calls_maps_to_tool_use() {
        let raw = OpenAiResponse {
            choices: vec![OpenAiChoice {
                message: OpenAiMessage {
                    content: None,
                    tool_calls: vec![OpenAiToolCall {
                        id: "call_1".to_string(),
                        function: OpenAiFunctionCall { name: "read_file".to_string(), arguments: "{\"path\":\"a.txt\"}".to_string() },
                    }],
                },
                finish_reason: "tool_calls".to_string(),
            }],
            usage: Some(OpenAiUsage { prompt_tokens: 12, completion_tokens: 3 }),
        };
        let response = raw.into_canonical().unwrap();
        assert_eq!(response.finish_reason, FinishReason::ToolUse);
        assert_eq!(response.usage.out_tokens, 3);
    }

    #[test]
    fn openai_plain_stop_maps_to_end_of_turn() {
        let raw = OpenAiResponse {
            choices: vec![OpenAiChoice {
                message: OpenAiMessage { content: Some("done".to_string()), tool_calls: vec![] },
                finish_reason: "stop".to_string(),
            }],
            usage: None,
        };
        let response = raw.into_canonical().unwrap();
        assert_eq!(response.finish_reason, FinishReason::EndOfTurn);
        assert_eq!(response.text(), "done");
    }
}
