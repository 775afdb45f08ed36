//! Context box edits. Each edit is one read-modify-write transaction on the
//! box row, so concurrent edits to the same box serialize in the store.

use canopy_core::context_box::{ContextBox, FileBlock};
use canopy_core::event::{DomainEvent, EventBus};
use canopy_core::{Error, Result};
use canopy_store::SqliteStore;
use chrono::Utc;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct ContextBoxService {
    store: SqliteStore,
    events: EventBus,
}

impl ContextBoxService {
    pub fn new(store: SqliteStore, events: EventBus) -> Self {
        Self { store, events }
    }

    pub async fn get(&self, tree_id: &str) -> Result<ContextBox> {
        self.store
            .get_context_box(tree_id)
            .await?
            .ok_or_else(|| Error::not_found("context box", tree_id))
    }

    /// Reference a node. Returns `false` alongside the box if the node was
    /// already in it.
    pub async fn add_node(&self, tree_id: &str, node_id: &str) -> Result<(ContextBox, bool)> {
        let node = self
            .store
            .get_node(node_id)
            .await?
            .ok_or_else(|| Error::not_found("node", node_id))?;
        self.modify(tree_id, |cb| cb.add_node_block(&node)).await
    }

    pub async fn add_file(&self, tree_id: &str, file: FileBlock) -> Result<ContextBox> {
        let (cb, ()) = self.modify(tree_id, |cb| cb.add_file_block(file)).await?;
        Ok(cb)
    }

    /// Returns `false` alongside the box if no block had that id.
    pub async fn remove_block(&self, tree_id: &str, block_id: &str) -> Result<(ContextBox, bool)> {
        self.modify(tree_id, |cb| cb.remove_block(block_id).is_some())
            .await
    }

    pub async fn move_block(&self, tree_id: &str, block_id: &str, to_index: usize) -> Result<(ContextBox, bool)> {
        self.modify(tree_id, |cb| cb.move_block(block_id, to_index))
            .await
    }

    pub async fn set_max_tokens(&self, tree_id: &str, max_tokens: usize) -> Result<ContextBox> {
        if max_tokens == 0 {
            return Err(Error::Validation("max_tokens must be positive".into()));
        }
        let (cb, ()) = self.modify(tree_id, |cb| cb.max_tokens = max_tokens).await?;
        Ok(cb)
    }

    /// Pin a memory item to this tree. Pinning twice is a no-op.
    pub async fn pin_memory(&self, tree_id: &str, memory_id: &str) -> Result<ContextBox> {
        let (cb, _) = self
            .modify(tree_id, |cb| {
                let fresh = !cb.pinned_memory_ids.iter().any(|id| id == memory_id);
                if fresh {
                    cb.pinned_memory_ids.push(memory_id.to_string());
                }
                fresh
            })
            .await?;
        Ok(cb)
    }

    pub async fn unpin_memory(&self, tree_id: &str, memory_id: &str) -> Result<ContextBox> {
        let (cb, ()) = self
            .modify(tree_id, |cb| cb.pinned_memory_ids.retain(|id| id != memory_id))
            .await?;
        Ok(cb)
    }

    async fn modify<R>(&self, tree_id: &str, edit: impl FnOnce(&mut ContextBox) -> R) -> Result<(ContextBox, R)> {
        let (cb, out) = self
            .store
            .modify_context_box(tree_id, edit)
            .await?
            .ok_or_else(|| Error::not_found("context box", tree_id))?;
        debug!(tree_id, blocks = cb.blocks.len(), total_tokens = cb.total_tokens, "Context box updated");
        if cb.is_over_budget() {
            debug!(tree_id, total_tokens = cb.total_tokens, max_tokens = cb.max_tokens, "Context box over budget");
        }
        self.events.publish(DomainEvent::ContextBoxChanged {
            tree_id: tree_id.to_string(),
            total_tokens: cb.total_tokens,
            max_tokens: cb.max_tokens,
            timestamp: Utc::now(),
        });
        Ok((cb, out))
    }
}
