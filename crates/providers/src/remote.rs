//! HTTP client for a remote agent-step endpoint.
//!
//! Talks to a Canopy gateway (or anything speaking the same protocol):
//! `POST {base}/api/chat` answers `{content}`; `POST {base}/api/agent`
//! answers an SSE stream of step events terminated by `data: [DONE]`, or a
//! plain `{content}` body when streaming is off.

use crate::openai_compat::check_status;
use crate::sse::SseLineBuffer;
use async_trait::async_trait;
use canopy_core::error::ProviderError;
use canopy_core::provider::{
    AgentStepRequest, ChatRequest, ChatResponse, ModelEndpoint, StepEvent, StepStream, response_stream,
};
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, trace};

pub struct RemoteAgentClient {
    base_url: String,
    client: reqwest::Client,
}

impl RemoteAgentClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .unwrap_or_default();
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post<T: serde::Serialize>(&self, path: &str, body: &T) -> Result<reqwest::Response, ProviderError> {
        let url = format!("{}/{path}", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;
        check_status(response).await
    }
}

#[async_trait]
impl ModelEndpoint for RemoteAgentClient {
    fn name(&self) -> &str {
        "remote-agent"
    }

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        request.validate()?;
        let response = self.post("api/chat", &request).await?;
        response
            .json()
            .await
            .map_err(|e| ProviderError::MalformedResponse(e.to_string()))
    }

    async fn agent_step(&self, request: AgentStepRequest) -> Result<StepStream, ProviderError> {
        request.validate()?;
        debug!(url = %self.base_url, tools = request.tool_uses.len(), stream = request.stream, "Requesting agent step");
        let response = self.post("api/agent", &request).await?;
        if !request.stream {
            let body: ChatResponse = response
                .json()
                .await
                .map_err(|e| ProviderError::MalformedResponse(e.to_string()))?;
            return Ok(response_stream(body));
        }

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(pump_step_stream(response.bytes_stream(), tx));
        Ok(rx)
    }
}

/// Forward wire-encoded step events. Malformed events are skipped; a
/// stream that closes without `[DONE]` still ends with [`StepEvent::End`].
/// An `error` event ends the stream with the upstream failure.
async fn pump_step_stream<S, B, E>(stream: S, tx: mpsc::Sender<Result<StepEvent, ProviderError>>)
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let mut stream = std::pin::pin!(stream);
    let mut lines = SseLineBuffer::new();

    while let Some(chunk) = stream.next().await {
        let bytes = match chunk {
            Ok(b) => b,
            Err(e) => {
                let _ = tx.send(Err(ProviderError::StreamInterrupted(e.to_string()))).await;
                return;
            }
        };
        for data in lines.push(bytes.as_ref()) {
            if let Some(message) = error_payload(&data) {
                let _ = tx.send(Err(ProviderError::StreamInterrupted(message))).await;
                return;
            }
            match decode(&data) {
                Some(StepEvent::End) => {
                    let _ = tx.send(Ok(StepEvent::End)).await;
                    return;
                }
                Some(event) => {
                    if tx.send(Ok(event)).await.is_err() {
                        return;
                    }
                }
                None => {}
            }
        }
    }
    if let Some(event) = lines.finish().as_deref().and_then(decode) {
        if event != StepEvent::End && tx.send(Ok(event)).await.is_err() {
            return;
        }
    }
    debug!("Agent stream closed without [DONE]");
    let _ = tx.send(Ok(StepEvent::End)).await;
}

fn error_payload(data: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(data).ok()?;
    if value["type"] != "error" {
        return None;
    }
    Some(value["error"].as_str().unwrap_or("upstream stream failed").to_string())
}

fn decode(data: &str) -> Option<StepEvent> {
    if data == "[DONE]" {
        return Some(StepEvent::End);
    }
    match serde_json::from_str(data) {
        Ok(event) => Some(event),
        Err(e) => {
            trace!(data, error = %e, "Ignoring malformed step event");
            None
        }
    }
}
