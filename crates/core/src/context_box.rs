//! Context boxes: the token-budgeted set of references that become a prompt.
//!
//! One box per tree, keyed by the tree id. A box is an ordered list of
//! [`ContextBlock`]s; `total_tokens` is always the sum of the block counts
//! and is only compared against `max_tokens` for warnings.
//!
//! Boxes are persisted as JSON. Older data stored a bare list of node ids;
//! [`ContextBox::decode`] recognises that shape and upgrades it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::node::{Node, NodeType};
use crate::token;

pub const DEFAULT_MAX_TOKENS: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Text,
    Image,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeBlock {
    pub id: String,
    pub node_id: String,
    pub token_count: usize,
}

impl NodeBlock {
    pub fn for_node(node: &Node) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            node_id: node.id.clone(),
            token_count: token::estimate_tokens(&render_node_text(node)),
        }
    }
}

/// An attached file. Text files carry their content; images carry base64 data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileBlock {
    pub id: String,
    pub file_name: String,
    pub mime_type: String,
    pub kind: FileKind,
    pub content: String,
    pub token_count: usize,
    pub created_at: DateTime<Utc>,
}

impl FileBlock {
    pub fn text(file_name: impl Into<String>, mime_type: impl Into<String>, content: impl Into<String>) -> Self {
        Self::build(file_name.into(), mime_type.into(), FileKind::Text, content.into())
    }

    /// `base64_data` is the raw base64 payload without a `data:` prefix.
    pub fn image(file_name: impl Into<String>, mime_type: impl Into<String>, base64_data: impl Into<String>) -> Self {
        Self::build(file_name.into(), mime_type.into(), FileKind::Image, base64_data.into())
    }

    fn build(file_name: String, mime_type: String, kind: FileKind, content: String) -> Self {
        let mut block = Self {
            id: Uuid::new_v4().to_string(),
            file_name,
            mime_type,
            kind,
            content,
            token_count: 0,
            created_at: Utc::now(),
        };
        block.token_count = block.rendered_tokens();
        block
    }

    /// Caption used for image parts and headers.
    pub fn caption(&self) -> String {
        match self.kind {
            FileKind::Text => format!("[File: {} ({})]", self.file_name, self.mime_type),
            FileKind::Image => format!("[Image: {} ({})]", self.file_name, self.mime_type),
        }
    }

    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.content)
    }

    pub fn rendered_tokens(&self) -> usize {
        match self.kind {
            FileKind::Text => token::estimate_tokens(&render_file_text(self)),
            FileKind::Image => token::estimate_tokens(&self.caption()) + token::IMAGE_PART_TOKENS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ContextBlock {
    Node(NodeBlock),
    File(FileBlock),
}

impl ContextBlock {
    pub fn id(&self) -> &str {
        match self {
            ContextBlock::Node(b) => &b.id,
            ContextBlock::File(b) => &b.id,
        }
    }

    pub fn token_count(&self) -> usize {
        match self {
            ContextBlock::Node(b) => b.token_count,
            ContextBlock::File(b) => b.token_count,
        }
    }

    pub fn node_id(&self) -> Option<&str> {
        match self {
            ContextBlock::Node(b) => Some(&b.node_id),
            ContextBlock::File(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextBox {
    /// Same as the owning tree id.
    pub id: String,
    pub blocks: Vec<ContextBlock>,
    pub total_tokens: usize,
    pub max_tokens: usize,
    /// Memories the user pinned for this tree.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pinned_memory_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// The pre-block shape: a plain list of node ids.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyContextBox {
    id: String,
    node_ids: Vec<String>,
    #[serde(default)]
    max_tokens: Option<usize>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
}

impl LegacyContextBox {
    fn upgrade(self) -> ContextBox {
        let blocks = self
            .node_ids
            .into_iter()
            .map(|node_id| {
                ContextBlock::Node(NodeBlock {
                    id: Uuid::new_v4().to_string(),
                    node_id,
                    token_count: 0,
                })
            })
            .collect();
        ContextBox {
            id: self.id,
            blocks,
            total_tokens: 0,
            max_tokens: self.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            pinned_memory_ids: Vec::new(),
            created_at: self.created_at.unwrap_or_else(Utc::now),
        }
    }
}

impl ContextBox {
    pub fn new(id: impl Into<String>, max_tokens: usize) -> Self {
        Self {
            id: id.into(),
            blocks: Vec::new(),
            total_tokens: 0,
            max_tokens,
            pinned_memory_ids: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Decode a stored box. Tries the canonical shape first, then each legacy
    /// shape in order. The flag is `true` when a legacy shape was upgraded and
    /// the caller should persist the result (legacy node blocks carry a zero
    /// token count until refreshed against the node map).
    pub fn decode(value: serde_json::Value) -> Result<(ContextBox, bool), serde_json::Error> {
        match serde_json::from_value::<ContextBox>(value.clone()) {
            Ok(mut context_box) => {
                context_box.recompute_total();
                Ok((context_box, false))
            }
            Err(canonical_err) => match serde_json::from_value::<LegacyContextBox>(value) {
                Ok(legacy) => Ok((legacy.upgrade(), true)),
                Err(_) => Err(canonical_err),
            },
        }
    }

    pub fn contains_node(&self, node_id: &str) -> bool {
        self.blocks.iter().any(|b| b.node_id() == Some(node_id))
    }

    /// Append a node block. Returns `false` if the node is already referenced.
    pub fn add_node_block(&mut self, node: &Node) -> bool {
        if self.contains_node(&node.id) {
            return false;
        }
        self.push(ContextBlock::Node(NodeBlock::for_node(node)));
        true
    }

    pub fn add_file_block(&mut self, file: FileBlock) {
        self.push(ContextBlock::File(file));
    }

    fn push(&mut self, block: ContextBlock) {
        self.blocks.push(block);
        self.recompute_total();
    }

    pub fn remove_block(&mut self, block_id: &str) -> Option<ContextBlock> {
        let index = self.blocks.iter().position(|b| b.id() == block_id)?;
        let removed = self.blocks.remove(index);
        self.recompute_total();
        Some(removed)
    }

    /// Drop every block referencing one of `node_ids`. Returns how many went.
    pub fn remove_nodes(&mut self, node_ids: &[String]) -> usize {
        let before = self.blocks.len();
        self.blocks
            .retain(|b| b.node_id().is_none_or(|id| !node_ids.iter().any(|n| n == id)));
        self.recompute_total();
        before - self.blocks.len()
    }

    /// Move a block to `to_index` (clamped to the end).
    pub fn move_block(&mut self, block_id: &str, to_index: usize) -> bool {
        let Some(from) = self.blocks.iter().position(|b| b.id() == block_id) else {
            return false;
        };
        let block = self.blocks.remove(from);
        let to = to_index.min(self.blocks.len());
        self.blocks.insert(to, block);
        true
    }

    /// Re-derive node block counts from the current node contents.
    pub fn refresh_node_tokens<'a>(&mut self, lookup: impl Fn(&str) -> Option<&'a Node>) {
        for block in &mut self.blocks {
            if let ContextBlock::Node(nb) = block {
                if let Some(node) = lookup(&nb.node_id) {
                    nb.token_count = token::estimate_tokens(&render_node_text(node));
                }
            }
        }
        self.recompute_total();
    }

    pub fn recompute_total(&mut self) {
        self.total_tokens = self.blocks.iter().map(ContextBlock::token_count).sum();
    }

    pub fn is_over_budget(&self) -> bool {
        self.total_tokens > self.max_tokens
    }

    pub fn node_ids(&self) -> Vec<String> {
        self.blocks
            .iter()
            .filter_map(|b| b.node_id().map(String::from))
            .collect()
    }
}

/// Prompt text for a node block. Compressed nodes get a `[Compressed]` marker.
pub fn render_node_text(node: &Node) -> String {
    match node.node_type {
        NodeType::Compressed => format!("[Compressed] {}", node.prompt_text()),
        _ => node.content.clone(),
    }
}

/// Prompt text for a text file block: provenance header plus fenced body.
pub fn render_file_text(file: &FileBlock) -> String {
    let fence = fence_for(&file.content);
    format!(
        "{}\n{fence}{}\n{}\n{fence}",
        file.caption(),
        fence_language(&file.file_name),
        file.content
    )
}

/// A backtick fence longer than any run inside `content`.
fn fence_for(content: &str) -> String {
    let mut longest = 0;
    let mut run = 0;
    for c in content.chars() {
        if c == '`' {
            run += 1;
            longest = longest.max(run);
        } else {
            run = 0;
        }
    }
    "`".repeat(longest.max(2) + 1)
}

fn fence_language(file_name: &str) -> &str {
    file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext)
        .filter(|ext| ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(node_type: NodeType, content: &str) -> Node {
        Node::new(node_type, None, content)
    }

    #[test]
    fn total_tracks_blocks() {
        let mut cb = ContextBox::new("t1", 100);
        let a = node(NodeType::System, "12345678");
        let b = node(NodeType::User, "1234");
        assert!(cb.add_node_block(&a));
        assert!(cb.add_node_block(&b));
        assert!(!cb.add_node_block(&a));
        assert_eq!(cb.total_tokens, 3);

        let first = cb.blocks[0].id().to_string();
        cb.remove_block(&first);
        assert_eq!(cb.total_tokens, 1);
        assert_eq!(cb.blocks.len(), 1);
    }

    #[test]
    fn legacy_shape_upgrades_in_order() {
        let legacy = serde_json::json!({
            "id": "t1",
            "nodeIds": ["a", "b", "c"],
            "totalTokens": 0,
            "maxTokens": 4000
        });
        let (cb, migrated) = ContextBox::decode(legacy).unwrap();
        assert!(migrated);
        assert_eq!(cb.max_tokens, 4000);
        let ids: Vec<_> = cb.blocks.iter().map(|b| b.node_id().unwrap().to_string()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert!(cb.blocks.iter().all(|b| matches!(b, ContextBlock::Node(_))));
    }

    #[test]
    fn canonical_shape_is_not_migrated_and_total_is_rederived() {
        let mut cb = ContextBox::new("t1", 100);
        cb.add_node_block(&node(NodeType::User, "abcdefgh"));
        let mut value = serde_json::to_value(&cb).unwrap();
        value["totalTokens"] = serde_json::json!(999);
        let (decoded, migrated) = ContextBox::decode(value).unwrap();
        assert!(!migrated);
        assert_eq!(decoded.total_tokens, 2);
    }

    #[test]
    fn unknown_shape_is_an_error() {
        assert!(ContextBox::decode(serde_json::json!({"foo": 1})).is_err());
    }

    #[test]
    fn compressed_node_rendering_has_marker() {
        let mut n = node(NodeType::Compressed, "long raw text");
        n.summary = Some("sum".into());
        assert_eq!(render_node_text(&n), "[Compressed] sum");
    }

    #[test]
    fn file_rendering_fences_content() {
        let file = FileBlock::text("main.rs", "text/x-rust", "fn main() {}");
        let text = render_file_text(&file);
        assert!(text.starts_with("[File: main.rs (text/x-rust)]"));
        assert!(text.contains("```rs\nfn main() {}\n```"));
        assert_eq!(file.token_count, token::estimate_tokens(&text));
    }

    #[test]
    fn fence_outgrows_inner_backticks() {
        let file = FileBlock::text("notes.md", "text/markdown", "```\ncode\n```");
        assert!(render_file_text(&file).contains("````md"));
    }

    #[test]
    fn move_block_reorders() {
        let mut cb = ContextBox::new("t", 100);
        let a = node(NodeType::User, "a");
        let b = node(NodeType::User, "b");
        cb.add_node_block(&a);
        cb.add_node_block(&b);
        let b_block = cb.blocks[1].id().to_string();
        assert!(cb.move_block(&b_block, 0));
        assert_eq!(cb.node_ids(), vec![b.id.clone(), a.id.clone()]);
    }

    #[test]
    fn over_budget_is_reported_not_enforced() {
        let mut cb = ContextBox::new("t", 1);
        cb.add_node_block(&node(NodeType::User, "a much longer message"));
        assert!(cb.is_over_budget());
        assert_eq!(cb.blocks.len(), 1);
    }
}
