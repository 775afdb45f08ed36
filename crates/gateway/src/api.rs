//! Chat and agent-step handlers.
//!
//! Both validate before anything reaches the upstream endpoint. Failures
//! come back as `{error, status}`; an upstream non-2xx keeps its status and
//! body text.

use axum::{
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::sse::{Event as SseEvent, Sse},
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use std::convert::Infallible;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use canopy_core::error::ProviderError;
use canopy_core::provider::{AgentStepRequest, ChatRequest, ChatResponse, StepEvent, StepStream};

use crate::SharedState;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub status: u16,
}

/// A failed request, rendered as `{error, status}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<ProviderError> for ApiError {
    fn from(err: ProviderError) -> Self {
        let status = match &err {
            ProviderError::InvalidRequest(_) | ProviderError::NotConfigured(_) => StatusCode::BAD_REQUEST,
            ProviderError::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            ProviderError::StreamInterrupted(_)
            | ProviderError::MalformedResponse(_)
            | ProviderError::Network(_) => StatusCode::BAD_GATEWAY,
        };
        let message = match err {
            ProviderError::Upstream { body, .. } => body,
            other => other.to_string(),
        };
        Self { status, message }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
                status: self.status.as_u16(),
            }),
        )
            .into_response()
    }
}

/// `POST /api/chat`
pub async fn chat_handler(
    State(state): State<SharedState>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<ChatResponse>, ApiError> {
    let Json(request) = payload?;
    request.validate()?;
    info!(model = %request.model, messages = request.messages.len(), "Chat request");

    let response = state.upstream.chat(request).await.inspect_err(|e| {
        warn!(error = %e, "Upstream chat failed");
    })?;
    Ok(Json(ChatResponse {
        content: response.content,
        tool_calls: Vec::new(),
    }))
}

/// `POST /api/agent`
///
/// When the request lists tools but carries no definitions, definitions
/// come from the gateway's catalog and every listed tool must exist there.
pub async fn agent_handler(
    State(state): State<SharedState>,
    payload: Result<Json<AgentStepRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(mut request) = payload?;
    request.validate()?;
    if request.tool_definitions.is_empty() && !request.tool_uses.is_empty() {
        if let Some(unknown) = request.tool_uses.iter().find(|t| !state.tools.contains(t)) {
            return Err(ApiError::bad_request(format!("unknown tool '{unknown}'")));
        }
        request.tool_definitions = state.tools.definitions_for(&request.tool_uses);
    }
    info!(
        model = %request.chat.model,
        tools = request.tool_definitions.len(),
        stream = request.stream,
        "Agent step request"
    );

    let stream = request.stream;
    let events = state.upstream.agent_step(request).await.inspect_err(|e| {
        warn!(error = %e, "Upstream agent step failed");
    })?;
    if stream {
        Ok(sse_response(events).into_response())
    } else {
        Ok(Json(collect_response(events).await?).into_response())
    }
}

/// Wire name of a step event.
fn event_name(event: &StepEvent) -> &'static str {
    match event {
        StepEvent::AssistantDelta { .. } => "assistant_delta",
        StepEvent::AssistantFinal { .. } => "assistant_final",
        StepEvent::ToolCall { .. } => "tool_call",
        StepEvent::End => "end",
    }
}

/// Re-encode step events as SSE. The stream always finishes with
/// `data: [DONE]`; an upstream failure mid-stream is sent as an `error`
/// event first.
fn sse_response(events: StepStream) -> Sse<impl futures::Stream<Item = Result<SseEvent, Infallible>>> {
    let stream = ReceiverStream::new(events)
        .take_while(|item| !matches!(item, Ok(StepEvent::End)))
        .map(|item| {
            let event = match item {
                Ok(event) => {
                    let data = serde_json::to_string(&event).unwrap_or_default();
                    SseEvent::default().event(event_name(&event)).data(data)
                }
                Err(e) => {
                    warn!(error = %e, "Agent stream failed");
                    let data = serde_json::json!({ "type": "error", "error": e.to_string() });
                    SseEvent::default().event("error").data(data.to_string())
                }
            };
            Ok(event)
        })
        .chain(tokio_stream::once(Ok(SseEvent::default().data("[DONE]"))));
    Sse::new(stream)
}

/// Fold a step into one response body.
async fn collect_response(mut events: StepStream) -> Result<ChatResponse, ProviderError> {
    let mut response = ChatResponse::default();
    while let Some(event) = events.recv().await {
        match event? {
            StepEvent::AssistantDelta { delta } => response.content.push_str(&delta),
            StepEvent::AssistantFinal { content } => response.content = content,
            StepEvent::ToolCall { call } => response.tool_calls.push(call),
            StepEvent::End => break,
        }
    }
    debug!(tool_calls = response.tool_calls.len(), "Collected agent step");
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{GatewayState, build_router};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use canopy_core::provider::{ModelEndpoint, ToolCallRequest, response_stream};
    use canopy_core::tool::{Tool, ToolRegistry, ToolResult};
    use http_body_util::BodyExt;
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    /// Upstream double: answers with fixed events and remembers requests.
    struct MockUpstream {
        events: Vec<StepEvent>,
        failure: Option<ProviderError>,
        seen: Mutex<Vec<AgentStepRequest>>,
    }

    impl MockUpstream {
        fn new(events: Vec<StepEvent>) -> Self {
            Self {
                events,
                failure: None,
                seen: Mutex::new(Vec::new()),
            }
        }

        fn failing(err: ProviderError) -> Self {
            Self {
                failure: Some(err),
                ..Self::new(Vec::new())
            }
        }
    }

    #[async_trait]
    impl ModelEndpoint for MockUpstream {
        fn name(&self) -> &str {
            "mock-upstream"
        }

        async fn chat(&self, _request: ChatRequest) -> Result<ChatResponse, ProviderError> {
            if let Some(err) = &self.failure {
                return Err(err.clone());
            }
            Ok(ChatResponse {
                content: "Hello from upstream".into(),
                tool_calls: Vec::new(),
            })
        }

        async fn agent_step(&self, request: AgentStepRequest) -> Result<StepStream, ProviderError> {
            if let Some(err) = &self.failure {
                return Err(err.clone());
            }
            let stream = request.stream;
            self.seen.lock().unwrap().push(request);
            if !stream {
                return Ok(response_stream(ChatResponse {
                    content: "folded".into(),
                    tool_calls: Vec::new(),
                }));
            }
            let (tx, rx) = mpsc::channel(self.events.len() + 1);
            for event in &self.events {
                tx.try_send(Ok(event.clone())).unwrap();
            }
            tx.try_send(Ok(StepEvent::End)).unwrap();
            Ok(rx)
        }
    }

    struct LookupTool;

    #[async_trait]
    impl Tool for LookupTool {
        fn name(&self) -> &str {
            "lookup"
        }
        fn description(&self) -> &str {
            "Look something up"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object", "properties": {"q": {"type": "string"}}})
        }
        async fn execute(
            &self,
            call_id: &str,
            _arguments: serde_json::Value,
        ) -> Result<ToolResult, canopy_core::error::ToolError> {
            Ok(ToolResult::ok(call_id, "found"))
        }
    }

    fn app(upstream: Arc<MockUpstream>) -> axum::Router {
        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(LookupTool));
        build_router(Arc::new(GatewayState::new(upstream, Arc::new(tools))))
    }

    fn post(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn chat_body() -> serde_json::Value {
        serde_json::json!({
            "apiKey": "sk-test",
            "baseUrl": "https://api.example.com/v1",
            "model": "gpt-4o-mini",
            "messages": [{"role": "user", "content": "Hi"}],
        })
    }

    async fn body_text(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn chat_returns_content() {
        let response = app(Arc::new(MockUpstream::new(Vec::new())))
            .oneshot(post("/api/chat", chat_body()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(json["content"], "Hello from upstream");
    }

    #[tokio::test]
    async fn invalid_requests_are_rejected_before_upstream() {
        let upstream = Arc::new(MockUpstream::new(Vec::new()));
        let mut body = chat_body();
        body["messages"] = serde_json::json!([]);
        let response = app(upstream.clone()).oneshot(post("/api/agent", body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(json["status"], 400);
        assert!(json["error"].as_str().unwrap().contains("messages"));

        let garbage = Request::builder()
            .method("POST")
            .uri("/api/chat")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let response = app(upstream.clone()).oneshot(garbage).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(upstream.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn upstream_status_and_body_pass_through() {
        let upstream = Arc::new(MockUpstream::failing(ProviderError::Upstream {
            status: 401,
            body: "invalid api key".into(),
        }));
        let response = app(upstream).oneshot(post("/api/chat", chat_body())).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let json: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(json["error"], "invalid api key");
        assert_eq!(json["status"], 401);
    }

    #[tokio::test]
    async fn agent_streams_events_then_done() {
        let upstream = Arc::new(MockUpstream::new(vec![
            StepEvent::AssistantDelta { delta: "Look".into() },
            StepEvent::ToolCall {
                call: ToolCallRequest {
                    id: "c1".into(),
                    name: "lookup".into(),
                    arguments: serde_json::json!({"q": "rust"}),
                },
            },
        ]));
        let mut body = chat_body();
        body["toolUses"] = serde_json::json!(["lookup"]);
        let response = app(upstream.clone()).oneshot(post("/api/agent", body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let text = body_text(response).await;
        let data: Vec<&str> = text
            .lines()
            .filter_map(|l| l.strip_prefix("data: "))
            .collect();
        assert_eq!(data.len(), 3);
        assert!(data[0].contains("\"assistant_delta\""));
        assert!(data[1].contains("\"tool_call\""));
        assert_eq!(data[2], "[DONE]");
        assert!(text.contains("event: tool_call"));

        let seen = upstream.seen.lock().unwrap();
        assert_eq!(seen[0].tool_definitions.len(), 1);
        assert_eq!(seen[0].tool_definitions[0].name, "lookup");
    }

    #[tokio::test]
    async fn agent_rejects_unknown_tools() {
        let mut body = chat_body();
        body["toolUses"] = serde_json::json!(["teleport"]);
        let response = app(Arc::new(MockUpstream::new(Vec::new())))
            .oneshot(post("/api/agent", body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn agent_without_stream_returns_json() {
        let mut body = chat_body();
        body["stream"] = serde_json::json!(false);
        let response = app(Arc::new(MockUpstream::new(Vec::new())))
            .oneshot(post("/api/agent", body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(json["content"], "folded");
    }
}
