//! # Canopy Core
//!
//! Domain types, traits, and error definitions for Canopy, a branching
//! conversation runtime. Conversations are trees of [`Node`]s; prompts are
//! assembled from [`ContextBox`]es; long-term facts live in [`MemoryItem`]s.
//!
//! ## Design Philosophy
//!
//! Every collaborator (model endpoint, embedder, tool) is defined as a trait
//! here. Implementations live in their respective crates, so the services can
//! be exercised with scripted stand-ins in tests.

pub mod context_box;
pub mod docs;
pub mod error;
pub mod event;
pub mod memory;
pub mod message;
pub mod node;
pub mod provider;
pub mod think;
pub mod tool;
pub mod token;
pub mod tree;

// Re-export key types at crate root for ergonomics
pub use context_box::{ContextBlock, ContextBox, FileBlock, FileKind, NodeBlock};
pub use docs::{FolderDoc, UserProfileDoc};
pub use error::{Error, MemoryError, ProviderError, Result, StoreError, ToolError};
pub use event::{DomainEvent, EventBus};
pub use memory::{Confidence, MemoryItem, MemoryScope, MemorySource, MemoryStatus};
pub use message::{ContentPart, Message, MessageContent, Role};
pub use node::{Node, NodeMetadata, NodeType, Position, ToolCallLog, ToolCallStatus};
pub use provider::{
    AgentStepRequest, ChatRequest, ChatResponse, Embedder, ModelEndpoint, StepEvent, StepStream,
    ToolCallRequest,
};
pub use tool::{
    CodeSettings, McpServerConfig, SearchSettings, Tool, ToolDefinition, ToolRegistry, ToolResult,
    ToolSettings,
};
pub use tree::{ConversationFolder, ConversationTree, FolderMemorySettings};
