//! Turn-level streaming events.
//!
//! `TurnEvent` lifts step-stream events and tool activity into what a live
//! view needs to render a turn as it happens. The CLI prints them as they
//! arrive.

use canopy_core::node::ToolCallLog;
use canopy_core::provider::ToolCallRequest;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    /// A model call is about to be made. Steps count from 1.
    StepStarted { step: usize },

    /// Partial assistant text.
    Delta { delta: String },

    /// The model asked for a tool.
    ToolCall { call: ToolCallRequest },

    /// A tool finished (successfully or not).
    ToolResult { log: ToolCallLog },

    /// The turn finished.
    Done {
        content: String,
        steps: usize,
        tool_calls: usize,
        hit_step_limit: bool,
    },

    Error { message: String },
}

impl TurnEvent {
    /// SSE event name for this event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::StepStarted { .. } => "step_started",
            Self::Delta { .. } => "delta",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
        }
    }
}

/// Optional event sink. Sending never fails the turn: a receiver that went
/// away just stops getting events.
#[derive(Debug, Clone, Default)]
pub struct EventSink(Option<mpsc::Sender<TurnEvent>>);

impl EventSink {
    pub fn new(tx: mpsc::Sender<TurnEvent>) -> Self {
        Self(Some(tx))
    }

    pub fn none() -> Self {
        Self(None)
    }

    pub async fn emit(&self, event: TurnEvent) {
        if let Some(tx) = &self.0 {
            let _ = tx.send(event).await;
        }
    }
}
