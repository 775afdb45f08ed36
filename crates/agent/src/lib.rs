//! The turn engine.
//!
//! A turn runs in four stages:
//!
//! 1. **Assemble** the open tree's context box plus read-only synthetic
//!    blocks (profile, folder notes, memories, recent messages)
//! 2. **Persist** the user node
//! 3. **Loop** model steps; each step either answers or requests tools,
//!    whose results feed the next step
//! 4. **Persist** one assistant node carrying every tool log of the turn
//!
//! The loop stops at the first step without tool calls or at the step cap.

pub mod chat;
pub mod context;
pub mod error;
pub mod loop_runner;
pub mod model;
pub mod optimizer;
pub mod stream_event;
pub mod summarize;

#[cfg(test)]
pub(crate) mod testing;

pub use canopy_core::think;
pub use chat::{ChatService, MemorySources, TurnOutcome, TurnRequest};
pub use context::{AssembledContext, AssemblyInput, ContextAssembler, SyntheticBlock};
pub use error::{AgentError, TurnFailure};
pub use loop_runner::{AgentLoop, LoopOutcome, RunOptions};
pub use model::ModelSettings;
pub use optimizer::PromptOptimizer;
pub use stream_event::{EventSink, TurnEvent};
pub use summarize::summarize_nodes;
