//! Prompt optimization.
//!
//! Only one optimization runs at a time. A second call while one is in
//! flight fails with [`AgentError::AlreadyRunning`] instead of queueing.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use canopy_core::message::Message;
use canopy_core::provider::ModelEndpoint;
use canopy_core::think::strip_thinking;
use tracing::debug;

use crate::error::AgentError;
use crate::model::ModelSettings;

const OPTIMIZER_PROMPT: &str = "Rewrite the user's prompt so it is clear, specific and self-contained. \
Keep the user's intent, language and any constraints they gave. \
Return only the rewritten prompt, with no preamble.";

pub struct PromptOptimizer {
    endpoint: Arc<dyn ModelEndpoint>,
    settings: ModelSettings,
    running: AtomicBool,
}

/// Clears the running flag however the call ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl PromptOptimizer {
    pub fn new(endpoint: Arc<dyn ModelEndpoint>, settings: ModelSettings) -> Self {
        Self {
            endpoint,
            settings,
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Rewrite `prompt`. An empty model answer leaves the prompt unchanged.
    pub async fn optimize(&self, prompt: &str) -> Result<String, AgentError> {
        if prompt.trim().is_empty() {
            return Err(AgentError::Invalid("prompt is empty".into()));
        }
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| AgentError::AlreadyRunning)?;
        let _guard = RunningGuard(&self.running);

        let request = self
            .settings
            .request(vec![Message::system(OPTIMIZER_PROMPT), Message::user(prompt)]);
        let response = self.endpoint.chat(request).await?;
        let rewritten = strip_thinking(&response.content).visible.trim().to_string();
        if rewritten.is_empty() {
            debug!("Optimizer returned nothing; keeping prompt");
            return Ok(prompt.to_string());
        }
        Ok(rewritten)
    }
}
