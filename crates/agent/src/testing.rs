//! Scripted stand-ins shared by the unit tests.

use async_trait::async_trait;
use canopy_core::error::{ProviderError, ToolError};
use canopy_core::provider::{AgentStepRequest, ChatRequest, ChatResponse, ModelEndpoint, StepEvent, StepStream};
use canopy_core::tool::{Tool, ToolRegistry, ToolResult};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Replays one scripted event list per model call and records requests.
/// An exhausted script answers with an empty final.
pub struct ScriptedEndpoint {
    steps: Mutex<VecDeque<Vec<StepEvent>>>,
    requests: Mutex<Vec<AgentStepRequest>>,
    chats: Mutex<Vec<ChatRequest>>,
    failure: Mutex<Option<ProviderError>>,
    abort_after_first: Option<Arc<AtomicBool>>,
}

impl ScriptedEndpoint {
    pub fn new(steps: Vec<Vec<StepEvent>>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            requests: Mutex::new(Vec::new()),
            chats: Mutex::new(Vec::new()),
            failure: Mutex::new(None),
            abort_after_first: None,
        }
    }

    pub fn failing(err: ProviderError) -> Self {
        let endpoint = Self::new(Vec::new());
        *endpoint.failure.lock().unwrap() = Some(err);
        endpoint
    }

    /// Raise `flag` once the first step has been served.
    pub fn abort_after_first(mut self, flag: Arc<AtomicBool>) -> Self {
        self.abort_after_first = Some(flag);
        self
    }

    pub fn requests(&self) -> Vec<AgentStepRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn chats(&self) -> Vec<ChatRequest> {
        self.chats.lock().unwrap().clone()
    }

    fn next_script(&self) -> Result<Vec<StepEvent>, ProviderError> {
        if let Some(err) = self.failure.lock().unwrap().clone() {
            return Err(err);
        }
        Ok(self
            .steps
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| vec![StepEvent::AssistantFinal { content: String::new() }]))
    }
}

#[async_trait]
impl ModelEndpoint for ScriptedEndpoint {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        self.chats.lock().unwrap().push(request);
        let mut content = String::new();
        for event in self.next_script()? {
            match event {
                StepEvent::AssistantDelta { delta } => content.push_str(&delta),
                StepEvent::AssistantFinal { content: c } => content = c,
                _ => {}
            }
        }
        Ok(ChatResponse {
            content,
            tool_calls: Vec::new(),
        })
    }

    async fn agent_step(&self, request: AgentStepRequest) -> Result<StepStream, ProviderError> {
        self.requests.lock().unwrap().push(request);
        let script = self.next_script()?;
        if let Some(flag) = &self.abort_after_first {
            flag.store(true, Ordering::SeqCst);
        }
        let (tx, rx) = mpsc::channel(script.len() + 1);
        for event in script {
            tx.try_send(Ok(event)).unwrap();
        }
        tx.try_send(Ok(StepEvent::End)).unwrap();
        Ok(rx)
    }
}

/// Echoes its `text` argument; fails without one.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo the input text"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {"text": {"type": "string"}},
            "required": ["text"]
        })
    }

    async fn execute(&self, call_id: &str, arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
        let text = arguments["text"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'text' argument".into()))?;
        Ok(ToolResult::ok(call_id, text))
    }
}

pub fn echo_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(EchoTool));
    registry
}
