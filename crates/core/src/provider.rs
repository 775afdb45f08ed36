//! Model endpoint contracts.
//!
//! Two calls reach a language model:
//! - the **chat call**: messages in, `{content}` out, used by the prompt
//!   optimizer, summaries and the memory writer;
//! - the **agent step**: the same request plus the tools offered for the
//!   turn, answered with a stream of [`StepEvent`]s ending in
//!   [`StepEvent::End`].
//!
//! Implementations: the OpenAI-compatible client (in-process) and the HTTP
//! client for a remote `/api/agent` endpoint.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::ProviderError;
use crate::message::Message;
use crate::tool::{ToolDefinition, ToolSettings};

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// Request for the plain chat call.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    /// May be empty for local endpoints that need no key.
    #[serde(default)]
    pub api_key: String,
    pub base_url: String,
    pub messages: Vec<Message>,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl std::fmt::Debug for ChatRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatRequest")
            .field("api_key", &if self.api_key.is_empty() { "" } else { "***" })
            .field("base_url", &self.base_url)
            .field("messages", &self.messages.len())
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

impl ChatRequest {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            api_key: String::new(),
            base_url: base_url.into(),
            messages,
            model: model.into(),
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = api_key.into();
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Reject malformed payloads before anything goes over the wire.
    pub fn validate(&self) -> std::result::Result<(), ProviderError> {
        let base = self.base_url.trim();
        if base.is_empty() {
            return Err(ProviderError::InvalidRequest("baseUrl is required".into()));
        }
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(ProviderError::InvalidRequest(format!(
                "baseUrl must be an http(s) URL, got '{base}'"
            )));
        }
        if self.model.trim().is_empty() {
            return Err(ProviderError::InvalidRequest("model is required".into()));
        }
        if self.messages.is_empty() {
            return Err(ProviderError::InvalidRequest("messages must not be empty".into()));
        }
        if let Some(t) = self.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(ProviderError::InvalidRequest(format!(
                    "temperature must be within 0.0..=2.0, got {t}"
                )));
            }
        }
        if self.max_tokens == Some(0) {
            return Err(ProviderError::InvalidRequest("maxTokens must be positive".into()));
        }
        Ok(())
    }
}

/// Response of the chat call, and of a non-streamed agent step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
}

/// Request for one agent step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStepRequest {
    #[serde(flatten)]
    pub chat: ChatRequest,
    /// Tool identifiers offered for this turn.
    #[serde(default)]
    pub tool_uses: Vec<String>,
    #[serde(default)]
    pub tool_settings: ToolSettings,
    /// Definitions for `tool_uses`. When empty the endpoint falls back to
    /// its built-in catalog.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_definitions: Vec<ToolDefinition>,
    #[serde(default = "default_stream")]
    pub stream: bool,
}

fn default_stream() -> bool {
    true
}

impl AgentStepRequest {
    pub fn new(chat: ChatRequest) -> Self {
        Self {
            chat,
            tool_uses: Vec::new(),
            tool_settings: ToolSettings::default(),
            tool_definitions: Vec::new(),
            stream: true,
        }
    }

    pub fn validate(&self) -> std::result::Result<(), ProviderError> {
        self.chat.validate()?;
        if let Some(blank) = self.tool_uses.iter().find(|t| t.trim().is_empty()) {
            return Err(ProviderError::InvalidRequest(format!(
                "toolUses contains a blank entry: '{blank}'"
            )));
        }
        for def in &self.tool_definitions {
            if !self.tool_uses.contains(&def.name) {
                return Err(ProviderError::InvalidRequest(format!(
                    "tool definition '{}' is not listed in toolUses",
                    def.name
                )));
            }
        }
        Ok(())
    }
}

/// One event of a streamed agent step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepEvent {
    /// Partial content; appended to the running answer.
    AssistantDelta { delta: String },
    /// Authoritative content; replaces whatever deltas accumulated.
    AssistantFinal { content: String },
    ToolCall { call: ToolCallRequest },
    /// No more events. Encoded on the wire as the `[DONE]` sentinel.
    #[serde(skip)]
    End,
}

/// Receiving half of a step stream. A stream error ends the step.
pub type StepStream = mpsc::Receiver<std::result::Result<StepEvent, ProviderError>>;

/// Wrap a complete response as a step stream.
pub fn response_stream(response: ChatResponse) -> StepStream {
    let (tx, rx) = mpsc::channel(response.tool_calls.len() + 2);
    let mut events: Vec<StepEvent> = response
        .tool_calls
        .into_iter()
        .map(|call| StepEvent::ToolCall { call })
        .collect();
    events.insert(0, StepEvent::AssistantFinal { content: response.content });
    events.push(StepEvent::End);
    for event in events {
        // capacity covers every event
        let _ = tx.try_send(Ok(event));
    }
    rx
}

/// The model endpoint used by the agent loop and the helpers.
#[async_trait]
pub trait ModelEndpoint: Send + Sync {
    /// A human-readable name (e.g., "openai-compat", "remote-agent").
    fn name(&self) -> &str;

    async fn chat(&self, request: ChatRequest) -> std::result::Result<ChatResponse, ProviderError>;

    /// Run one agent step. Default implementation performs a chat call and
    /// wraps the answer as a single final event.
    async fn agent_step(
        &self,
        request: AgentStepRequest,
    ) -> std::result::Result<StepStream, ProviderError> {
        request.validate()?;
        let response = self.chat(request.chat).await?;
        Ok(response_stream(response))
    }
}

/// Computes embedding vectors for texts.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// One vector per input, in input order.
    async fn embed(
        &self,
        model: &str,
        inputs: &[String],
    ) -> std::result::Result<Vec<Vec<f32>>, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ChatRequest {
        ChatRequest::new("https://api.example.com/v1", "gpt-4o", vec![Message::user("hi")])
    }

    #[test]
    fn valid_request_passes() {
        assert!(request().with_api_key("sk").validate().is_ok());
    }

    #[test]
    fn validation_rejects_malformed_payloads() {
        let mut r = request();
        r.messages.clear();
        assert!(matches!(r.validate(), Err(ProviderError::InvalidRequest(_))));

        let r = ChatRequest::new("ftp://x", "m", vec![Message::user("hi")]);
        assert!(r.validate().is_err());

        assert!(request().with_temperature(3.5).validate().is_err());
        assert!(request().with_max_tokens(0).validate().is_err());
    }

    #[test]
    fn debug_redacts_api_key() {
        let dbg = format!("{:?}", request().with_api_key("sk-secret"));
        assert!(!dbg.contains("sk-secret"));
        assert!(dbg.contains("***"));
    }

    #[test]
    fn agent_request_wire_shape_is_flat() {
        let mut req = AgentStepRequest::new(request().with_api_key("k"));
        req.tool_uses = vec!["web_search".into()];
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["apiKey"], "k");
        assert_eq!(json["baseUrl"], "https://api.example.com/v1");
        assert_eq!(json["toolUses"][0], "web_search");
        assert!(json.get("chat").is_none());
    }

    #[test]
    fn agent_request_rejects_unlisted_definition() {
        let mut req = AgentStepRequest::new(request());
        req.tool_definitions.push(ToolDefinition {
            name: "code_exec".into(),
            description: "d".into(),
            parameters: serde_json::json!({}),
        });
        assert!(req.validate().is_err());
        req.tool_uses.push("code_exec".into());
        assert!(req.validate().is_ok());
    }

    #[test]
    fn step_events_use_type_tag() {
        let ev: StepEvent = serde_json::from_str(r#"{"type":"assistant_delta","delta":"He"}"#).unwrap();
        assert_eq!(ev, StepEvent::AssistantDelta { delta: "He".into() });

        let ev: StepEvent = serde_json::from_str(
            r#"{"type":"tool_call","call":{"id":"c1","name":"web_search","arguments":{"query":"x"}}}"#,
        )
        .unwrap();
        assert!(matches!(ev, StepEvent::ToolCall { ref call } if call.name == "web_search"));
    }

    #[tokio::test]
    async fn response_stream_ends_with_end() {
        let mut rx = response_stream(ChatResponse {
            content: "done".into(),
            tool_calls: vec![],
        });
        assert_eq!(rx.recv().await.unwrap().unwrap(), StepEvent::AssistantFinal { content: "done".into() });
        assert_eq!(rx.recv().await.unwrap().unwrap(), StepEvent::End);
        assert!(rx.recv().await.is_none());
    }
}
