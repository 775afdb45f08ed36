//! The multi-step tool-use loop.
//!
//! One call to [`AgentLoop::run`] is one user turn:
//!
//! ```text
//! Idle -> AwaitingModel -> (ToolCallsPending | Final)
//!      -> [ToolExecuting -> AwaitingModel]* -> Done | Failed
//! ```
//!
//! Each step streams typed events from the endpoint until the end marker.
//! Deltas accumulate into the answer buffer and a final-content event
//! replaces it. Tool calls captured during the step run after the end
//! marker, one at a time, and their results go back to the model for the
//! next step. Reaching the step limit ends the turn as `Done` with whatever
//! content exists.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use canopy_core::event::{DomainEvent, EventBus};
use canopy_core::message::Message;
use canopy_core::node::{ToolCallLog, ToolCallStatus};
use canopy_core::provider::{AgentStepRequest, ChatRequest, ModelEndpoint, StepEvent, ToolCallRequest};
use canopy_core::tool::{ToolRegistry, ToolSettings};
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::error::AgentError;
use crate::stream_event::{EventSink, TurnEvent};

pub const DEFAULT_MAX_STEPS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    AwaitingModel,
    ToolCallsPending,
    Final,
    ToolExecuting,
    Done,
    Failed,
}

/// What a finished turn produced.
#[derive(Debug, Clone)]
pub struct LoopOutcome {
    pub content: String,
    /// Logs from every step, in call order.
    pub tool_logs: Vec<ToolCallLog>,
    /// Model calls made.
    pub steps: usize,
    pub hit_step_limit: bool,
    /// The conversation as sent to the model on the last step, including
    /// the tool exchanges.
    pub messages: Vec<Message>,
}

/// Caller-side controls for one run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Checked before every step; a set flag stops the turn.
    pub abort: Option<Arc<AtomicBool>>,
    pub events: EventSink,
}

impl RunOptions {
    fn aborted(&self) -> bool {
        self.abort.as_ref().is_some_and(|a| a.load(Ordering::SeqCst))
    }
}

/// Drives model calls and tool execution for one turn at a time.
pub struct AgentLoop {
    endpoint: Arc<dyn ModelEndpoint>,
    tools: Arc<ToolRegistry>,
    events: EventBus,
    max_steps: usize,
    stream: bool,
}

impl AgentLoop {
    pub fn new(endpoint: Arc<dyn ModelEndpoint>, tools: Arc<ToolRegistry>, events: EventBus) -> Self {
        Self {
            endpoint,
            tools,
            events,
            max_steps: DEFAULT_MAX_STEPS,
            stream: true,
        }
    }

    /// Set the maximum number of model calls per turn.
    pub fn with_max_steps(mut self, max: usize) -> Self {
        self.max_steps = max.max(1);
        self
    }

    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Run one turn. `request.messages` is the assembled context ending
    /// with the user message; `tool_uses` names the tools offered.
    pub async fn run(
        &self,
        request: ChatRequest,
        tool_uses: &[String],
        tool_settings: &ToolSettings,
        options: &RunOptions,
    ) -> Result<LoopOutcome, AgentError> {
        if let Some(unknown) = tool_uses.iter().find(|t| !self.tools.contains(t)) {
            return Err(AgentError::Invalid(format!("unknown tool '{unknown}'")));
        }
        let definitions = self.tools.definitions_for(tool_uses);
        let mut messages = request.messages.clone();
        let mut tool_logs = Vec::new();
        let mut state = LoopState::Idle;
        let mut step = 0;

        loop {
            if options.aborted() {
                info!(step = step + 1, "Turn aborted before next step");
                return Err(AgentError::Aborted { step: step + 1 });
            }
            step += 1;
            state = transition(state, LoopState::AwaitingModel, step);
            options.events.emit(TurnEvent::StepStarted { step }).await;

            let step_request = AgentStepRequest {
                chat: ChatRequest {
                    messages: messages.clone(),
                    ..request.clone()
                },
                tool_uses: tool_uses.to_vec(),
                tool_settings: tool_settings.clone(),
                tool_definitions: definitions.clone(),
                stream: self.stream,
            };

            let (content, calls) = match self.consume_step(step_request, &options.events).await {
                Ok(out) => out,
                Err(e) => {
                    transition(state, LoopState::Failed, step);
                    options.events.emit(TurnEvent::Error { message: e.to_string() }).await;
                    return Err(e);
                }
            };

            if calls.is_empty() {
                transition(state, LoopState::Final, step);
                return Ok(self
                    .finish(content, tool_logs, step, false, messages, &options.events)
                    .await);
            }

            state = transition(state, LoopState::ToolCallsPending, step);
            messages.push(Message::assistant_tool_calls(content.clone(), calls.clone()));

            state = transition(state, LoopState::ToolExecuting, step);
            for call in &calls {
                let log = self.execute_tool(call).await;
                messages.push(Message::tool_result(
                    &call.id,
                    &call.name,
                    tool_message_text(&log),
                ));
                options.events.emit(TurnEvent::ToolResult { log: log.clone() }).await;
                tool_logs.push(log);
            }

            if step >= self.max_steps {
                warn!(steps = step, "Max agent steps reached, ending turn");
                return Ok(self
                    .finish(content, tool_logs, step, true, messages, &options.events)
                    .await);
            }
        }
    }

    /// Consume one step stream to its end marker. Returns the answer buffer
    /// and the tool calls captured.
    async fn consume_step(
        &self,
        request: AgentStepRequest,
        sink: &EventSink,
    ) -> Result<(String, Vec<ToolCallRequest>), AgentError> {
        let mut stream = self.endpoint.agent_step(request).await?;
        let mut buffer = String::new();
        let mut calls = Vec::new();

        while let Some(event) = stream.recv().await {
            match event? {
                StepEvent::AssistantDelta { delta } => {
                    buffer.push_str(&delta);
                    sink.emit(TurnEvent::Delta { delta }).await;
                }
                StepEvent::AssistantFinal { content } => buffer = content,
                StepEvent::ToolCall { call } => {
                    debug!(tool = %call.name, call_id = %call.id, "Model requested tool");
                    sink.emit(TurnEvent::ToolCall { call: call.clone() }).await;
                    calls.push(call);
                }
                StepEvent::End => return Ok((buffer, calls)),
            }
        }
        debug!("Step stream closed without end marker");
        Ok((buffer, calls))
    }

    async fn execute_tool(&self, call: &ToolCallRequest) -> ToolCallLog {
        let start = Instant::now();
        let result = self.tools.execute(call).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let log = match result {
            Ok(result) => ToolCallLog {
                id: call.id.clone(),
                tool_name: call.name.clone(),
                arguments: call.arguments.clone(),
                status: ToolCallStatus::Success,
                output: Some(result.output),
                error: None,
                duration_ms,
            },
            Err(e) => {
                warn!(tool = %call.name, error = %e, "Tool execution failed");
                ToolCallLog {
                    id: call.id.clone(),
                    tool_name: call.name.clone(),
                    arguments: call.arguments.clone(),
                    status: ToolCallStatus::Error,
                    output: None,
                    error: Some(e.to_string()),
                    duration_ms,
                }
            }
        };

        self.events.publish(DomainEvent::ToolExecuted {
            tool_name: call.name.clone(),
            success: log.status == ToolCallStatus::Success,
            duration_ms,
            timestamp: Utc::now(),
        });
        log
    }

    async fn finish(
        &self,
        content: String,
        tool_logs: Vec<ToolCallLog>,
        steps: usize,
        hit_step_limit: bool,
        messages: Vec<Message>,
        sink: &EventSink,
    ) -> LoopOutcome {
        debug!(steps, tool_calls = tool_logs.len(), hit_step_limit, "Turn done");
        sink.emit(TurnEvent::Done {
            content: content.clone(),
            steps,
            tool_calls: tool_logs.len(),
            hit_step_limit,
        })
        .await;
        LoopOutcome {
            content,
            tool_logs,
            steps,
            hit_step_limit,
            messages,
        }
    }
}

fn transition(from: LoopState, to: LoopState, step: usize) -> LoopState {
    debug!(step, ?from, ?to, "Agent loop transition");
    to
}

/// Text the model sees for a tool result. Errors are reported so the model
/// can recover.
fn tool_message_text(log: &ToolCallLog) -> String {
    match (&log.status, &log.output, &log.error) {
        (ToolCallStatus::Success, Some(output), _) => output.clone(),
        (_, _, Some(error)) => format!("Error: {error}"),
        _ => String::new(),
    }
}
