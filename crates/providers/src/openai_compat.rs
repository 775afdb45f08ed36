//! OpenAI-compatible model client.
//!
//! Works with: OpenAI, OpenRouter, Ollama, vLLM, LM Studio, Together AI and
//! any endpoint exposing `/chat/completions` and `/embeddings`.
//!
//! Supports:
//! - Chat completions (non-streaming)
//! - Streamed agent steps with tool calling, decoded into [`StepEvent`]s
//! - Embeddings and model listing
//!
//! Base URL and API key travel with each [`ChatRequest`], so one client
//! serves every configured endpoint.

use crate::sse::SseLineBuffer;
use async_trait::async_trait;
use canopy_core::error::ProviderError;
use canopy_core::message::{Message, MessageContent, Role};
use canopy_core::provider::{
    AgentStepRequest, ChatRequest, ChatResponse, Embedder, ModelEndpoint, StepEvent, StepStream,
    ToolCallRequest, response_stream,
};
use canopy_core::tool::ToolDefinition;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

type StepSender = mpsc::Sender<Result<StepEvent, ProviderError>>;

pub struct OpenAiCompatClient {
    name: String,
    client: reqwest::Client,
    embedding_base_url: String,
    embedding_api_key: String,
}

impl OpenAiCompatClient {
    pub fn new(name: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .unwrap_or_default();

        Self {
            name: name.into(),
            client,
            embedding_base_url: "https://api.openai.com/v1".into(),
            embedding_api_key: String::new(),
        }
    }

    /// Where [`Embedder::embed`] sends its requests.
    pub fn with_embedding_endpoint(mut self, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        self.embedding_base_url = base_url.into();
        self.embedding_api_key = api_key.into();
        self
    }

    /// Model ids the endpoint advertises.
    pub async fn list_models(&self, base_url: &str, api_key: &str) -> Result<Vec<String>, ProviderError> {
        let url = endpoint(base_url, "models");
        let mut req = self.client.get(&url);
        if !api_key.is_empty() {
            req = req.bearer_auth(api_key);
        }
        let response = req.send().await.map_err(|e| ProviderError::Network(e.to_string()))?;
        let response = check_status(response).await?;
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProviderError::MalformedResponse(e.to_string()))?;

        Ok(body["data"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|m| m["id"].as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Convert our messages to the OpenAI wire format.
    fn to_api_messages(messages: &[Message]) -> Vec<ApiMessage> {
        messages
            .iter()
            .map(|m| ApiMessage {
                role: m.role.as_str().into(),
                content: Some(m.content.clone()),
                tool_calls: if m.tool_calls.is_empty() {
                    None
                } else {
                    Some(m.tool_calls.iter().map(ApiToolCall::from_request).collect())
                },
                tool_call_id: m.tool_call_id.clone(),
                name: (m.role == Role::Tool).then(|| m.name.clone()).flatten(),
            })
            .collect()
    }

    fn to_api_tools(tools: &[ToolDefinition]) -> Vec<ApiToolDefinition> {
        tools
            .iter()
            .map(|t| ApiToolDefinition {
                r#type: "function".into(),
                function: ApiToolFunction {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.parameters.clone(),
                },
            })
            .collect()
    }

    fn body(request: &ChatRequest, tools: &[ToolDefinition], stream: bool) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": request.model,
            "messages": Self::to_api_messages(&request.messages),
            "stream": stream,
        });
        if let Some(t) = request.temperature {
            body["temperature"] = serde_json::json!(t);
        }
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }
        if !tools.is_empty() {
            body["tools"] = serde_json::json!(Self::to_api_tools(tools));
        }
        body
    }

    async fn post(
        &self,
        request: &ChatRequest,
        body: &serde_json::Value,
        stream: bool,
    ) -> Result<reqwest::Response, ProviderError> {
        let url = endpoint(&request.base_url, "chat/completions");
        let mut req = self.client.post(&url).json(body);
        if !request.api_key.is_empty() {
            req = req.bearer_auth(&request.api_key);
        }
        if stream {
            req = req.header("Accept", "text/event-stream");
        }
        let response = req.send().await.map_err(|e| ProviderError::Network(e.to_string()))?;
        check_status(response).await
    }

    async fn complete(&self, request: &ChatRequest, tools: &[ToolDefinition]) -> Result<ChatResponse, ProviderError> {
        debug!(provider = %self.name, model = %request.model, "Sending completion request");
        let response = self.post(request, &Self::body(request, tools, false), false).await?;
        let api_response: ApiResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::MalformedResponse(format!("Failed to parse response: {e}")))?;

        let choice = api_response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::MalformedResponse("No choices in response".into()))?;

        Ok(ChatResponse {
            content: choice.message.content.unwrap_or_default(),
            tool_calls: choice
                .message
                .tool_calls
                .unwrap_or_default()
                .into_iter()
                .map(ApiToolCall::into_request)
                .collect(),
        })
    }
}

impl Default for OpenAiCompatClient {
    fn default() -> Self {
        Self::new("openai-compat")
    }
}

#[async_trait]
impl ModelEndpoint for OpenAiCompatClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        request.validate()?;
        self.complete(&request, &[]).await
    }

    async fn agent_step(&self, request: AgentStepRequest) -> Result<StepStream, ProviderError> {
        request.validate()?;
        if !request.stream {
            let response = self.complete(&request.chat, &request.tool_definitions).await?;
            return Ok(response_stream(response));
        }

        debug!(
            provider = %self.name,
            model = %request.chat.model,
            tools = request.tool_definitions.len(),
            "Sending streaming request"
        );
        let body = Self::body(&request.chat, &request.tool_definitions, true);
        let response = self.post(&request.chat, &body, true).await?;

        let (tx, rx) = mpsc::channel(64);
        let provider = self.name.clone();
        tokio::spawn(pump_completion_stream(response.bytes_stream(), tx, provider));
        Ok(rx)
    }
}

#[async_trait]
impl Embedder for OpenAiCompatClient {
    async fn embed(&self, model: &str, inputs: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }
        let url = endpoint(&self.embedding_base_url, "embeddings");
        let body = serde_json::json!({
            "model": model,
            "input": inputs,
            "encoding_format": "float",
        });
        debug!(provider = %self.name, model, count = inputs.len(), "Sending embedding request");

        let mut req = self.client.post(&url).json(&body);
        if !self.embedding_api_key.is_empty() {
            req = req.bearer_auth(&self.embedding_api_key);
        }
        let response = req.send().await.map_err(|e| ProviderError::Network(e.to_string()))?;
        let response = check_status(response).await?;
        let api_resp: EmbeddingApiResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::MalformedResponse(format!("Failed to parse embedding response: {e}")))?;
        Ok(api_resp.into_vectors())
    }
}

fn endpoint(base_url: &str, path: &str) -> String {
    format!("{}/{path}", base_url.trim_end_matches('/'))
}

/// Non-2xx responses surface verbatim.
pub(crate) async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    warn!(status = status.as_u16(), body = %body, "Upstream returned an error");
    Err(ProviderError::Upstream {
        status: status.as_u16(),
        body,
    })
}

/// Decode an OpenAI completion stream into step events. Tool calls are
/// emitted once the stream is complete, followed by [`StepEvent::End`].
async fn pump_completion_stream<S, B, E>(stream: S, tx: StepSender, provider: String)
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let mut stream = std::pin::pin!(stream);
    let mut lines = SseLineBuffer::new();
    let mut state = StreamState::default();

    while let Some(chunk) = stream.next().await {
        let bytes = match chunk {
            Ok(b) => b,
            Err(e) => {
                let _ = tx.send(Err(ProviderError::StreamInterrupted(e.to_string()))).await;
                return;
            }
        };
        for data in lines.push(bytes.as_ref()) {
            if data == "[DONE]" {
                finish(state, &tx).await;
                return;
            }
            for event in state.apply(&data, &provider) {
                if tx.send(Ok(event)).await.is_err() {
                    return; // receiver dropped
                }
            }
        }
    }
    if let Some(data) = lines.finish() {
        if data != "[DONE]" {
            for event in state.apply(&data, &provider) {
                if tx.send(Ok(event)).await.is_err() {
                    return;
                }
            }
        }
    }
    finish(state, &tx).await;
}

async fn finish(state: StreamState, tx: &StepSender) {
    for event in state.finish() {
        if tx.send(Ok(event)).await.is_err() {
            return;
        }
    }
}

/// Accumulates tool call fragments across chunks, keyed by index.
#[derive(Debug, Default)]
struct StreamState {
    calls: BTreeMap<u32, ToolCallAccumulator>,
}

impl StreamState {
    fn apply(&mut self, data: &str, provider: &str) -> Vec<StepEvent> {
        let chunk: StreamResponse = match serde_json::from_str(data) {
            Ok(c) => c,
            Err(e) => {
                trace!(provider, data, error = %e, "Ignoring unparseable SSE chunk");
                return Vec::new();
            }
        };
        let mut events = Vec::new();
        for choice in chunk.choices {
            for delta in choice.delta.tool_calls.unwrap_or_default() {
                let acc = self.calls.entry(delta.index).or_default();
                if let Some(id) = delta.id {
                    acc.id = id;
                }
                if let Some(func) = delta.function {
                    if let Some(name) = func.name {
                        acc.name = name;
                    }
                    if let Some(args) = func.arguments {
                        acc.arguments.push_str(&args);
                    }
                }
            }
            if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
                events.push(StepEvent::AssistantDelta { delta: content });
            }
        }
        events
    }

    fn finish(self) -> Vec<StepEvent> {
        let mut events: Vec<StepEvent> = self
            .calls
            .into_iter()
            .filter(|(_, acc)| !acc.name.is_empty())
            .map(|(index, acc)| StepEvent::ToolCall {
                call: acc.into_request(index),
            })
            .collect();
        events.push(StepEvent::End);
        events
    }
}

#[derive(Debug, Default)]
struct ToolCallAccumulator {
    id: String,
    name: String,
    arguments: String,
}

impl ToolCallAccumulator {
    fn into_request(self, index: u32) -> ToolCallRequest {
        ToolCallRequest {
            id: if self.id.is_empty() { format!("call_{index}") } else { self.id },
            name: self.name,
            arguments: parse_arguments(self.arguments),
        }
    }
}

/// Arguments arrive as a JSON string; unparseable text is kept verbatim.
fn parse_arguments(raw: String) -> serde_json::Value {
    if raw.trim().is_empty() {
        return serde_json::json!({});
    }
    serde_json::from_str(&raw).unwrap_or(serde_json::Value::String(raw))
}

// --- OpenAI API types (internal) ---

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<MessageContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ApiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolCall {
    id: String,
    #[serde(default = "function_type")]
    r#type: String,
    function: ApiFunction,
}

fn function_type() -> String {
    "function".into()
}

impl ApiToolCall {
    fn from_request(call: &ToolCallRequest) -> Self {
        Self {
            id: call.id.clone(),
            r#type: function_type(),
            function: ApiFunction {
                name: call.name.clone(),
                arguments: call.arguments.to_string(),
            },
        }
    }

    fn into_request(self) -> ToolCallRequest {
        ToolCallRequest {
            id: self.id,
            name: self.function.name,
            arguments: parse_arguments(self.function.arguments),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Serialize)]
struct ApiToolDefinition {
    r#type: String,
    function: ApiToolFunction,
}

#[derive(Debug, Serialize)]
struct ApiToolFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    choices: Vec<ApiChoice>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ApiResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ApiToolCall>>,
}

// --- Embedding API types ---

#[derive(Debug, Deserialize)]
struct EmbeddingApiResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: Option<usize>,
}

impl EmbeddingApiResponse {
    /// Vectors in input order.
    fn into_vectors(mut self) -> Vec<Vec<f32>> {
        if self.data.iter().all(|d| d.index.is_some()) {
            self.data.sort_by_key(|d| d.index);
        }
        self.data.into_iter().map(|d| d.embedding).collect()
    }
}

// --- Streaming SSE types ---

/// A single SSE `data: {...}` chunk from a streaming response.
#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<StreamToolCallDelta>>,
}

/// A tool call delta, arriving incrementally across chunks.
#[derive(Debug, Deserialize)]
struct StreamToolCallDelta {
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<StreamFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn drain(mut rx: StepStream) -> Vec<Result<StepEvent, ProviderError>> {
        let mut out = Vec::new();
        while let Some(event) = rx.recv().await {
            out.push(event);
        }
        out
    }

    async fn run(chunks: Vec<Result<&'static str, String>>) -> Vec<Result<StepEvent, ProviderError>> {
        let (tx, rx) = mpsc::channel(64);
        let stream = futures::stream::iter(chunks.into_iter().map(|c| c.map(str::as_bytes)));
        pump_completion_stream(stream, tx, "test".into()).await;
        drain(rx).await
    }

    #[test]
    fn message_conversion() {
        let messages = vec![
            Message::system("You are helpful"),
            Message::user("Hello"),
            Message::tool_result("call_1", "web_search", "3 results"),
        ];
        let api = OpenAiCompatClient::to_api_messages(&messages);
        assert_eq!(api[0].role, "system");
        assert_eq!(api[1].role, "user");
        assert_eq!(api[2].role, "tool");
        assert_eq!(api[2].tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(api[2].name.as_deref(), Some("web_search"));
        assert!(api[1].name.is_none());
    }

    #[test]
    fn assistant_tool_calls_encode_arguments_as_string() {
        let msg = Message::assistant_tool_calls(
            "",
            vec![ToolCallRequest {
                id: "call_1".into(),
                name: "web_search".into(),
                arguments: serde_json::json!({"query": "rust"}),
            }],
        );
        let api = OpenAiCompatClient::to_api_messages(&[msg]);
        let json = serde_json::to_value(&api[0]).unwrap();
        assert_eq!(json["tool_calls"][0]["type"], "function");
        assert_eq!(json["tool_calls"][0]["function"]["arguments"], r#"{"query":"rust"}"#);
    }

    #[test]
    fn body_includes_tools_only_when_offered() {
        let request = ChatRequest::new("http://x/v1", "m", vec![Message::user("hi")]).with_max_tokens(50);
        let body = OpenAiCompatClient::body(&request, &[], true);
        assert!(body.get("tools").is_none());
        assert!(body.get("temperature").is_none());
        assert_eq!(body["max_tokens"], 50);

        let tools = vec![ToolDefinition {
            name: "code_exec".into(),
            description: "Run code".into(),
            parameters: serde_json::json!({"type": "object"}),
        }];
        let body = OpenAiCompatClient::body(&request, &tools, false);
        assert_eq!(body["tools"][0]["function"]["name"], "code_exec");
        assert_eq!(body["stream"], false);
    }

    #[test]
    fn endpoint_joins_without_double_slash() {
        assert_eq!(endpoint("http://h/v1/", "models"), "http://h/v1/models");
    }

    #[tokio::test]
    async fn stream_yields_deltas_then_tool_calls_then_end() {
        let events = run(vec![
            Ok("data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n"),
            Ok("data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n: ping\n"),
            Ok("data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"call_a\",\"function\":{\"name\":\"web_search\",\"arguments\":\"{\\\"query\\\"\"}}]}}]}\n"),
            Ok("data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\":\\\"rust\\\"}\"}}]}}]}\n"),
            Ok("data: not json\n"),
            Ok("data: [DONE]\n"),
        ])
        .await;
        let events: Vec<StepEvent> = events.into_iter().map(Result::unwrap).collect();
        assert_eq!(
            events,
            vec![
                StepEvent::AssistantDelta { delta: "Hel".into() },
                StepEvent::AssistantDelta { delta: "lo".into() },
                StepEvent::ToolCall {
                    call: ToolCallRequest {
                        id: "call_a".into(),
                        name: "web_search".into(),
                        arguments: serde_json::json!({"query": "rust"}),
                    }
                },
                StepEvent::End,
            ]
        );
    }

    #[tokio::test]
    async fn stream_without_done_still_ends() {
        let events = run(vec![Ok("data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}")]).await;
        let events: Vec<StepEvent> = events.into_iter().map(Result::unwrap).collect();
        assert_eq!(events, vec![StepEvent::AssistantDelta { delta: "x".into() }, StepEvent::End]);
    }

    #[tokio::test]
    async fn transport_error_interrupts_the_stream() {
        let events = run(vec![
            Ok("data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n"),
            Err("connection reset".into()),
        ])
        .await;
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], Err(ProviderError::StreamInterrupted(ref m)) if m.contains("reset")));
    }

    #[test]
    fn tool_call_ids_and_arguments_are_defaulted() {
        let call = ToolCallAccumulator {
            id: String::new(),
            name: "code_exec".into(),
            arguments: "not json".into(),
        }
        .into_request(2);
        assert_eq!(call.id, "call_2");
        assert_eq!(call.arguments, serde_json::json!("not json"));
        assert_eq!(parse_arguments(String::new()), serde_json::json!({}));
    }

    #[test]
    fn parse_chat_response_with_tool_calls() {
        let data = r#"{"choices":[{"message":{"content":null,"tool_calls":[{"id":"c1","type":"function","function":{"name":"web_search","arguments":"{\"query\":\"x\"}"}}]}}]}"#;
        let parsed: ApiResponse = serde_json::from_str(data).unwrap();
        let msg = parsed.choices.into_iter().next().unwrap().message;
        assert!(msg.content.is_none());
        let call = msg.tool_calls.unwrap().pop().unwrap().into_request();
        assert_eq!(call.arguments["query"], "x");
    }

    #[test]
    fn embeddings_are_reordered_by_index() {
        let data = r#"{"data": [
            {"embedding": [0.4], "index": 1},
            {"embedding": [0.1], "index": 0}
        ], "model": "text-embedding-3-small"}"#;
        let parsed: EmbeddingApiResponse = serde_json::from_str(data).unwrap();
        assert_eq!(parsed.into_vectors(), vec![vec![0.1], vec![0.4]]);
    }

    #[tokio::test]
    async fn invalid_request_fails_before_network() {
        let client = OpenAiCompatClient::default();
        let err = client
            .chat(ChatRequest::new("ftp://nope", "m", vec![Message::user("x")]))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::InvalidRequest(_)));
    }
}
