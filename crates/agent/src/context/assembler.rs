//! The context assembler.

use super::synthetic::SyntheticBlock;
use canopy_conversation::NodeMap;
use canopy_core::context_box::{ContextBlock, ContextBox, FileBlock, FileKind, render_file_text, render_node_text};
use canopy_core::message::{Message, Role};
use canopy_core::node::{Node, NodeType};
use tracing::{debug, warn};

/// Everything one assembly reads.
pub struct AssemblyInput<'a> {
    pub context_box: &'a ContextBox,
    /// Nodes the box may reference.
    pub nodes: &'a NodeMap,
    /// Blocks built for this send, in the order they should appear.
    pub synthetic: &'a [SyntheticBlock],
}

/// The assembled context, ready for a model call.
#[derive(Debug, Clone)]
pub struct AssembledContext {
    pub messages: Vec<Message>,
    /// Human-readable rendering of `messages`.
    pub preview: String,
    /// Box total plus synthetic blocks.
    pub total_tokens: usize,
    pub max_tokens: usize,
    /// Node blocks whose node was not in the map. They are skipped.
    pub missing_node_ids: Vec<String>,
}

impl AssembledContext {
    pub fn is_over_budget(&self) -> bool {
        self.total_tokens > self.max_tokens
    }
}

/// The context assembler. Stateless; create one and reuse it.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextAssembler;

impl ContextAssembler {
    pub fn new() -> Self {
        Self
    }

    /// Assemble messages from the box blocks in stored order.
    ///
    /// Synthetic blocks go right after the leading system messages, so the
    /// root prompt stays first and the conversation stays last.
    pub fn assemble(&self, input: &AssemblyInput<'_>) -> AssembledContext {
        let mut messages = Vec::with_capacity(input.context_box.blocks.len() + input.synthetic.len());
        let mut missing_node_ids = Vec::new();

        for block in &input.context_box.blocks {
            match block {
                ContextBlock::Node(nb) => match input.nodes.get(&nb.node_id) {
                    Some(node) => messages.push(node_message(node)),
                    None => {
                        warn!(node_id = %nb.node_id, box_id = %input.context_box.id, "Context block references a missing node");
                        missing_node_ids.push(nb.node_id.clone());
                    }
                },
                ContextBlock::File(file) => messages.push(file_message(file)),
            }
        }

        let insert_at = messages
            .iter()
            .position(|m| m.role != Role::System)
            .unwrap_or(messages.len());
        let synthetic: Vec<Message> = input
            .synthetic
            .iter()
            .filter_map(SyntheticBlock::to_message)
            .collect();
        let synthetic_tokens: usize = input.synthetic.iter().map(SyntheticBlock::token_count).sum();
        messages.splice(insert_at..insert_at, synthetic);

        let total_tokens = input.context_box.total_tokens + synthetic_tokens;
        let max_tokens = input.context_box.max_tokens;
        if total_tokens > max_tokens {
            debug!(total_tokens, max_tokens, "Assembled context exceeds box budget");
        }

        AssembledContext {
            preview: render_preview(&messages, total_tokens, max_tokens),
            messages,
            total_tokens,
            max_tokens,
            missing_node_ids,
        }
    }
}

fn node_message(node: &Node) -> Message {
    let text = render_node_text(node);
    match node.node_type {
        NodeType::System | NodeType::Compressed => Message::system(text),
        NodeType::User => Message::user(text),
        NodeType::Assistant => Message::assistant(text),
    }
}

fn file_message(file: &FileBlock) -> Message {
    match file.kind {
        FileKind::Text => Message::user(render_file_text(file)),
        FileKind::Image => Message::user_with_image(file.caption(), file.data_url()),
    }
}

fn render_preview(messages: &[Message], total_tokens: usize, max_tokens: usize) -> String {
    let mut out = format!("Context: {total_tokens}/{max_tokens} tokens");
    if total_tokens > max_tokens {
        out.push_str(" (over budget)");
    }
    out.push('\n');
    for message in messages {
        out.push_str(&format!("\n--- {} ---\n", message.role.as_str()));
        out.push_str(message.text_content().trim_end());
        out.push('\n');
    }
    out
}
