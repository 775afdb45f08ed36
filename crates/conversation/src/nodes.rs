//! Node operations: creation, traversal, recursive delete, search and edits.

use crate::dag::{self, NodeMap};
use canopy_core::context_box::render_node_text;
use canopy_core::error::StoreError;
use canopy_core::event::{DomainEvent, EventBus};
use canopy_core::node::{Node, NodeMetadata, NodeType, Position};
use canopy_core::{Error, Result, token};
use canopy_store::SqliteStore;
use chrono::{DateTime, Utc};
use tracing::{debug, info};
use uuid::Uuid;

/// Everything needed to create a node. Id and timestamps are assigned on
/// creation unless overridden; the token count is estimated when absent.
#[derive(Debug, Clone)]
pub struct NewNode {
    pub node_type: NodeType,
    pub parent_id: Option<String>,
    pub content: String,
    pub summary: Option<String>,
    pub metadata: NodeMetadata,
    pub created_at: Option<DateTime<Utc>>,
    pub token_count: Option<usize>,
}

impl NewNode {
    pub fn new(node_type: NodeType, parent_id: Option<String>, content: impl Into<String>) -> Self {
        Self {
            node_type,
            parent_id,
            content: content.into(),
            summary: None,
            metadata: NodeMetadata::default(),
            created_at: None,
            token_count: None,
        }
    }

    pub fn child(node_type: NodeType, parent_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(node_type, Some(parent_id.into()), content)
    }

    pub fn with_created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = Some(at);
        self
    }

    pub fn with_token_count(mut self, tokens: usize) -> Self {
        self.token_count = Some(tokens);
        self
    }

    pub fn with_metadata(mut self, metadata: NodeMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn into_node(self) -> Node {
        let now = self.created_at.unwrap_or_else(Utc::now);
        let mut node = Node {
            id: Uuid::new_v4().to_string(),
            node_type: self.node_type,
            parent_id: self.parent_id,
            content: self.content,
            summary: self.summary,
            created_at: now,
            updated_at: now,
            token_count: 0,
            metadata: self.metadata,
            position: None,
        };
        node.token_count = self
            .token_count
            .unwrap_or_else(|| token::estimate_tokens(&render_node_text(&node)));
        node
    }
}

#[derive(Debug, Clone)]
pub struct NodeService {
    store: SqliteStore,
    events: EventBus,
}

impl NodeService {
    pub fn new(store: SqliteStore, events: EventBus) -> Self {
        Self { store, events }
    }

    /// Create and persist one node. A parent, when named, must exist.
    pub async fn create(&self, tree_id: &str, spec: NewNode) -> Result<Node> {
        if let Some(parent_id) = &spec.parent_id {
            if self.store.get_node(parent_id).await?.is_none() {
                return Err(Error::not_found("node", parent_id.clone()));
            }
        }
        let node = spec.into_node();
        self.store.insert_node(&node).await?;
        self.publish_created(tree_id, &node);
        Ok(node)
    }

    /// Create several nodes in one transaction: all are stored or none.
    /// Each parent must exist or appear earlier in the batch.
    pub async fn batch_create(&self, tree_id: &str, specs: Vec<NewNode>) -> Result<Vec<Node>> {
        let nodes: Vec<Node> = specs.into_iter().map(NewNode::into_node).collect();
        self.store.insert_attached_nodes(&nodes).await.map_err(|e| match e {
            StoreError::MissingParent(id) => Error::not_found("node", id),
            other => other.into(),
        })?;
        for node in &nodes {
            self.publish_created(tree_id, node);
        }
        Ok(nodes)
    }

    pub async fn get(&self, node_id: &str) -> Result<Node> {
        self.store
            .get_node(node_id)
            .await?
            .ok_or_else(|| Error::not_found("node", node_id))
    }

    /// Children oldest first.
    pub async fn children(&self, parent_id: &str) -> Result<Vec<Node>> {
        Ok(self.store.children(parent_id).await?)
    }

    /// The nodes from the root down to `node_id`. Empty when the chain is
    /// broken or loops.
    pub async fn path(&self, node_id: &str) -> Result<Vec<Node>> {
        let mut by_id: NodeMap = self
            .store
            .ancestors(node_id)
            .await?
            .into_iter()
            .map(|n| (n.id.clone(), n))
            .collect();
        let ids = dag::compute_path_ids(&by_id, node_id);
        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    /// Delete a node and its whole subtree, pruning the tree's context box in
    /// the same transaction. Root nodes go only with their tree.
    pub async fn delete(&self, tree_id: &str, node_id: &str) -> Result<Vec<String>> {
        let node = self.get(node_id).await?;
        if node.is_root() {
            return Err(Error::Validation(
                "the root node can only be removed by deleting its tree".into(),
            ));
        }
        let deleted = self.store.delete_subtree(node_id, Some(tree_id)).await?;
        info!(tree_id, node_id, count = deleted.len(), "Deleted node subtree");
        self.events.publish(DomainEvent::NodesDeleted {
            tree_id: tree_id.to_string(),
            node_ids: deleted.clone(),
            timestamp: Utc::now(),
        });
        Ok(deleted)
    }

    /// Case-insensitive substring search over content and tags.
    pub async fn search(&self, query: &str) -> Result<Vec<Node>> {
        Ok(self.store.search_nodes(query).await?)
    }

    /// Replace a node's content and re-estimate its tokens. The tree's
    /// context box block for this node is refreshed to match.
    pub async fn update_content(&self, tree_id: &str, node_id: &str, content: impl Into<String>) -> Result<Node> {
        let content = content.into();
        let node = self
            .modify(tree_id, node_id, |node| {
                node.content = content;
                node.token_count = token::estimate_tokens(&render_node_text(node));
            })
            .await?;

        let refreshed = self
            .store
            .modify_context_box(tree_id, |cb| {
                cb.refresh_node_tokens(|id| (id == node.id).then_some(&node));
                (cb.total_tokens, cb.max_tokens)
            })
            .await?;
        if let Some((_, (total_tokens, max_tokens))) = refreshed {
            self.events.publish(DomainEvent::ContextBoxChanged {
                tree_id: tree_id.to_string(),
                total_tokens,
                max_tokens,
                timestamp: Utc::now(),
            });
        }
        Ok(node)
    }

    /// Edit tags, instructions or attribution in place.
    pub async fn update_metadata(
        &self,
        tree_id: &str,
        node_id: &str,
        edit: impl FnOnce(&mut NodeMetadata),
    ) -> Result<Node> {
        self.modify(tree_id, node_id, |node| edit(&mut node.metadata)).await
    }

    /// Pin a manual layout position, or clear it with `None`.
    pub async fn set_position(&self, tree_id: &str, node_id: &str, position: Option<Position>) -> Result<Node> {
        self.modify(tree_id, node_id, |node| node.position = position).await
    }

    /// Create a `compressed` node standing in for `node_ids`, attached beside
    /// the first of them so the original branch is left intact.
    pub async fn compress(&self, tree_id: &str, node_ids: &[String], summary: impl Into<String>) -> Result<Node> {
        let Some(first_id) = node_ids.first() else {
            return Err(Error::Validation("nothing to compress".into()));
        };
        let mut by_id: NodeMap = self
            .store
            .get_nodes(node_ids)
            .await?
            .into_iter()
            .map(|n| (n.id.clone(), n))
            .collect();
        let mut ordered = Vec::with_capacity(node_ids.len());
        for id in node_ids {
            let node = by_id.remove(id).ok_or_else(|| Error::not_found("node", id.clone()))?;
            ordered.push(node);
        }
        let parent_id = ordered
            .first()
            .and_then(|n| n.parent_id.clone())
            .ok_or_else(|| Error::Validation(format!("root node {first_id} cannot be compressed")))?;

        let transcript = ordered
            .iter()
            .map(|n| format!("{}: {}", n.node_type.as_str(), n.prompt_text()))
            .collect::<Vec<_>>()
            .join("\n\n");
        let metadata = NodeMetadata {
            compressed_node_ids: node_ids.to_vec(),
            ..Default::default()
        };
        let spec = NewNode::child(NodeType::Compressed, parent_id, transcript)
            .with_summary(summary)
            .with_metadata(metadata);
        let node = self.create(tree_id, spec).await?;
        debug!(tree_id, node_id = %node.id, covered = node_ids.len(), "Created compressed node");
        Ok(node)
    }

    async fn modify(&self, tree_id: &str, node_id: &str, edit: impl FnOnce(&mut Node)) -> Result<Node> {
        let mut node = self.get(node_id).await?;
        edit(&mut node);
        node.updated_at = Utc::now();
        if !self.store.update_node(&node).await? {
            return Err(Error::not_found("node", node_id));
        }
        self.events.publish(DomainEvent::NodeUpdated {
            tree_id: tree_id.to_string(),
            node_id: node.id.clone(),
            timestamp: node.updated_at,
        });
        Ok(node)
    }

    fn publish_created(&self, tree_id: &str, node: &Node) {
        debug!(tree_id, node_id = %node.id, node_type = node.node_type.as_str(), "Created node");
        self.events.publish(DomainEvent::NodeCreated {
            tree_id: tree_id.to_string(),
            node_id: node.id.clone(),
            timestamp: node.created_at,
        });
    }
}
