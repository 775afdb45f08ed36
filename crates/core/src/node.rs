//! Conversation nodes: one turn or artifact in a tree.
//!
//! Nodes form a tree via `parent_id`. Exactly one node per tree (the root,
//! always of type `system`) has no parent. Children of a parent are ordered
//! by `created_at` ascending, ties broken by id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::token;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    System,
    User,
    Assistant,
    /// A summary standing in for a range of earlier nodes.
    Compressed,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::System => "system",
            NodeType::User => "user",
            NodeType::Assistant => "assistant",
            NodeType::Compressed => "compressed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "system" => Some(NodeType::System),
            "user" => Some(NodeType::User),
            "assistant" => Some(NodeType::Assistant),
            "compressed" => Some(NodeType::Compressed),
            _ => None,
        }
    }
}

/// Manual layout position set by the user (overrides auto-layout).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCallStatus {
    Success,
    Error,
}

/// One tool invocation made while producing an assistant node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallLog {
    pub id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
    pub status: ToolCallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeMetadata {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// Free-form instructions attached by the user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,

    /// Tool identifiers offered for the turn (recorded on user nodes).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_uses: Vec<String>,

    /// Every tool call made while producing this node (assistant nodes).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_logs: Vec<ToolCallLog>,

    /// Reasoning blocks stripped from the visible content.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub thinking: Vec<String>,

    /// Nodes summarized by a compressed node.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub compressed_node_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: String,

    #[serde(rename = "type")]
    pub node_type: NodeType,

    pub parent_id: Option<String>,

    pub content: String,

    /// Summary text for compressed nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    pub token_count: usize,

    #[serde(default)]
    pub metadata: NodeMetadata,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
}

impl Node {
    /// Build a node with a fresh id, current timestamps and estimated tokens.
    pub fn new(node_type: NodeType, parent_id: Option<String>, content: impl Into<String>) -> Self {
        let content = content.into();
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            node_type,
            parent_id,
            token_count: token::estimate_tokens(&content),
            content,
            summary: None,
            created_at: now,
            updated_at: now,
            metadata: NodeMetadata::default(),
            position: None,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Text used when this node is rendered into a prompt.
    pub fn prompt_text(&self) -> &str {
        match (self.node_type, &self.summary) {
            (NodeType::Compressed, Some(summary)) if !summary.is_empty() => summary,
            _ => &self.content,
        }
    }
}
