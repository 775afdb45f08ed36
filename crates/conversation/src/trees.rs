//! Tree lifecycle and snapshot loading.

use crate::dag::{self, NodeMap};
use canopy_core::context_box::{ContextBox, DEFAULT_MAX_TOKENS};
use canopy_core::event::{DomainEvent, EventBus};
use canopy_core::node::{Node, NodeType};
use canopy_core::tree::{ConversationFolder, ConversationTree, DEFAULT_SYSTEM_PROMPT};
use canopy_core::{Error, Result, token};
use canopy_store::SqliteStore;
use chrono::Utc;
use tracing::{debug, info};

const UNTITLED: &str = "New conversation";

/// A tree with every node reachable from its root, its context box and the
/// folder it lives in.
#[derive(Debug, Clone)]
pub struct TreeSnapshot {
    pub tree: ConversationTree,
    pub nodes: NodeMap,
    pub context_box: ContextBox,
    pub folder: Option<ConversationFolder>,
}

impl TreeSnapshot {
    pub fn root(&self) -> Option<&Node> {
        self.nodes.get(&self.tree.root_id)
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Nodes from the root down to `node_id`.
    pub fn path_to(&self, node_id: &str) -> Vec<&Node> {
        dag::compute_path_ids(&self.nodes, node_id)
            .iter()
            .filter_map(|id| self.nodes.get(id))
            .collect()
    }

    /// The most recently created leaf, where a fresh session resumes.
    pub fn latest_leaf(&self) -> Option<&Node> {
        dag::leaf_nodes(&self.nodes, &self.tree.root_id)
            .into_iter()
            .max_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)))
    }

    /// Root content follows the folder's current prompt. Stored root text
    /// is left alone; only this in-memory copy and its box block change.
    fn rematerialize_root(&mut self) {
        let Some(folder) = &self.folder else {
            return;
        };
        let Some(root) = self.nodes.get_mut(&self.tree.root_id) else {
            return;
        };
        if root.content == folder.system_prompt {
            return;
        }
        root.content = folder.system_prompt.clone();
        root.token_count = token::estimate_tokens(&root.content);
        let root = &*root;
        self.context_box
            .refresh_node_tokens(|id| (id == root.id).then_some(root));
        debug!(tree_id = %self.tree.id, folder_id = %folder.id, "Root content follows folder prompt");
    }
}

#[derive(Debug, Clone)]
pub struct TreeService {
    store: SqliteStore,
    events: EventBus,
    default_max_tokens: usize,
}

impl TreeService {
    pub fn new(store: SqliteStore, events: EventBus) -> Self {
        Self {
            store,
            events,
            default_max_tokens: DEFAULT_MAX_TOKENS,
        }
    }

    /// Budget given to the context box of newly created trees.
    pub fn with_default_max_tokens(mut self, max_tokens: usize) -> Self {
        self.default_max_tokens = max_tokens;
        self
    }

    /// Create a tree with its system root and a context box holding only
    /// that root, in one transaction.
    pub async fn create(&self, title: &str, folder_id: Option<&str>) -> Result<TreeSnapshot> {
        let folder = match folder_id {
            Some(id) => Some(self.folder(id).await?),
            None => None,
        };
        let prompt = folder
            .as_ref()
            .map_or(DEFAULT_SYSTEM_PROMPT, |f| f.system_prompt.as_str());

        let root = Node::new(NodeType::System, None, prompt);
        let title = match title.trim() {
            "" => UNTITLED,
            t => t,
        };
        let tree = ConversationTree::new(root.id.clone(), title, folder.as_ref().map(|f| f.id.clone()));
        let mut context_box = ContextBox::new(tree.id.clone(), self.default_max_tokens);
        context_box.add_node_block(&root);

        self.store.create_tree(&tree, &root, &context_box).await?;
        info!(tree_id = %tree.id, folder_id = ?tree.folder_id, "Created tree");
        self.events.publish(DomainEvent::TreeCreated {
            tree_id: tree.id.clone(),
            folder_id: tree.folder_id.clone(),
            timestamp: tree.created_at,
        });

        Ok(TreeSnapshot {
            nodes: NodeMap::from([(root.id.clone(), root)]),
            tree,
            context_box,
            folder,
        })
    }

    /// Load a tree with all of its nodes. A missing context box is recreated
    /// holding the root.
    pub async fn load(&self, tree_id: &str) -> Result<TreeSnapshot> {
        let tree = self.get(tree_id).await?;
        let nodes: NodeMap = self
            .store
            .subtree(&tree.root_id)
            .await?
            .into_iter()
            .map(|n| (n.id.clone(), n))
            .collect();
        let Some(root) = nodes.get(&tree.root_id) else {
            return Err(Error::Internal(format!(
                "tree {tree_id} references missing root {}",
                tree.root_id
            )));
        };

        let context_box = match self.store.get_context_box(tree_id).await? {
            Some(cb) => cb,
            None => {
                let mut cb = ContextBox::new(tree_id, self.default_max_tokens);
                cb.add_node_block(root);
                self.store.put_context_box(&cb).await?;
                cb
            }
        };
        let folder = match &tree.folder_id {
            Some(id) => self.store.get_folder(id).await?,
            None => None,
        };

        let mut snapshot = TreeSnapshot {
            tree,
            nodes,
            context_box,
            folder,
        };
        snapshot.rematerialize_root();
        debug!(tree_id, nodes = snapshot.nodes.len(), "Loaded tree");
        Ok(snapshot)
    }

    pub async fn get(&self, tree_id: &str) -> Result<ConversationTree> {
        self.store
            .get_tree(tree_id)
            .await?
            .ok_or_else(|| Error::not_found("tree", tree_id))
    }

    /// Most recently updated first, optionally limited to one folder.
    pub async fn list(&self, folder_id: Option<&str>) -> Result<Vec<ConversationTree>> {
        Ok(self.store.list_trees(folder_id).await?)
    }

    pub async fn rename(&self, tree_id: &str, title: &str) -> Result<ConversationTree> {
        let title = title.trim();
        if title.is_empty() {
            return Err(Error::Validation("tree title cannot be empty".into()));
        }
        self.modify(tree_id, |tree| tree.title = title.to_string()).await
    }

    /// Move a tree into a folder, or out of any folder with `None`.
    pub async fn move_to_folder(&self, tree_id: &str, folder_id: Option<&str>) -> Result<ConversationTree> {
        if let Some(id) = folder_id {
            self.folder(id).await?;
        }
        self.modify(tree_id, |tree| tree.folder_id = folder_id.map(String::from))
            .await
    }

    /// Bump `updated_at` so the tree sorts first.
    pub async fn touch(&self, tree_id: &str) -> Result<ConversationTree> {
        self.modify(tree_id, |_| {}).await
    }

    /// Delete the tree, its nodes and its context box in one transaction.
    pub async fn delete(&self, tree_id: &str) -> Result<Vec<String>> {
        let deleted = self
            .store
            .delete_tree(tree_id)
            .await?
            .ok_or_else(|| Error::not_found("tree", tree_id))?;
        info!(tree_id, nodes = deleted.len(), "Deleted tree");
        self.events.publish(DomainEvent::TreeDeleted {
            tree_id: tree_id.to_string(),
            timestamp: Utc::now(),
        });
        Ok(deleted)
    }

    async fn folder(&self, folder_id: &str) -> Result<ConversationFolder> {
        self.store
            .get_folder(folder_id)
            .await?
            .ok_or_else(|| Error::not_found("folder", folder_id))
    }

    async fn modify(&self, tree_id: &str, edit: impl FnOnce(&mut ConversationTree)) -> Result<ConversationTree> {
        let mut tree = self.get(tree_id).await?;
        edit(&mut tree);
        tree.updated_at = Utc::now();
        if !self.store.update_tree(&tree).await? {
            return Err(Error::not_found("tree", tree_id));
        }
        self.events.publish(DomainEvent::TreeUpdated {
            tree_id: tree.id.clone(),
            timestamp: tree.updated_at,
        });
        Ok(tree)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_core::context_box::ContextBlock;

    async fn setup() -> (TreeService, SqliteStore) {
        let store = SqliteStore::new("sqlite::memory:").await.unwrap();
        (TreeService::new(store.clone(), EventBus::default()), store)
    }

    #[tokio::test]
    async fn create_outside_folder_uses_default_prompt() {
        let (trees, store) = setup().await;
        let snap = trees.create("  ", None).await.unwrap();

        assert_eq!(snap.tree.title, UNTITLED);
        let root = snap.root().unwrap();
        assert_eq!(root.node_type, NodeType::System);
        assert_eq!(root.content, DEFAULT_SYSTEM_PROMPT);
        assert_eq!(snap.context_box.blocks.len(), 1);
        assert!(matches!(&snap.context_box.blocks[0], ContextBlock::Node(b) if b.node_id == root.id));

        let stored = store.get_context_box(&snap.tree.id).await.unwrap().unwrap();
        assert_eq!(stored, snap.context_box);
    }

    #[tokio::test]
    async fn create_inside_folder_uses_folder_prompt() {
        let (trees, store) = setup().await;
        let folder = ConversationFolder::new("Research", "You cite sources.");
        store.put_folder(&folder).await.unwrap();

        let snap = trees.create("Papers", Some(&folder.id)).await.unwrap();
        assert_eq!(snap.root().unwrap().content, "You cite sources.");
        assert_eq!(snap.tree.folder_id.as_deref(), Some(folder.id.as_str()));

        assert!(matches!(
            trees.create("x", Some("missing")).await,
            Err(Error::NotFound { kind: "folder", .. })
        ));
    }

    #[tokio::test]
    async fn reload_reflects_updated_folder_prompt() {
        let (trees, store) = setup().await;
        let mut folder = ConversationFolder::new("Work", "Old prompt");
        store.put_folder(&folder).await.unwrap();
        let created = trees.create("t", Some(&folder.id)).await.unwrap();
        let root_id = created.tree.root_id.clone();

        folder.system_prompt = "A much newer and longer prompt".into();
        store.put_folder(&folder).await.unwrap();

        let loaded = trees.load(&created.tree.id).await.unwrap();
        let root = loaded.root().unwrap();
        assert_eq!(root.content, "A much newer and longer prompt");
        assert_eq!(loaded.context_box.total_tokens, root.token_count);

        // the stored root is untouched
        let stored = store.get_node(&root_id).await.unwrap().unwrap();
        assert_eq!(stored.content, "Old prompt");
    }

    #[tokio::test]
    async fn load_collects_all_nodes_and_recreates_missing_box() {
        let (trees, store) = setup().await;
        let snap = trees.create("t", None).await.unwrap();
        let kid = Node::new(NodeType::User, Some(snap.tree.root_id.clone()), "hello");
        store.insert_node(&kid).await.unwrap();
        sqlx::query("DELETE FROM context_boxes WHERE id = ?1")
            .bind(&snap.tree.id)
            .execute(store.pool())
            .await
            .unwrap();

        let loaded = trees.load(&snap.tree.id).await.unwrap();
        assert_eq!(loaded.nodes.len(), 2);
        assert_eq!(loaded.latest_leaf().unwrap().id, kid.id);
        assert_eq!(loaded.context_box.node_ids(), vec![snap.tree.root_id.clone()]);
        assert_eq!(loaded.path_to(&kid.id).len(), 2);
    }

    #[tokio::test]
    async fn rename_move_touch_and_delete() {
        let (trees, store) = setup().await;
        let folder = ConversationFolder::new("F", "p");
        store.put_folder(&folder).await.unwrap();
        let snap = trees.create("t", None).await.unwrap();
        let id = snap.tree.id.clone();

        assert_eq!(trees.rename(&id, " Renamed ").await.unwrap().title, "Renamed");
        assert!(matches!(trees.rename(&id, "").await, Err(Error::Validation(_))));

        let moved = trees.move_to_folder(&id, Some(&folder.id)).await.unwrap();
        assert_eq!(moved.folder_id.as_deref(), Some(folder.id.as_str()));
        assert_eq!(trees.list(Some(&folder.id)).await.unwrap().len(), 1);
        assert!(trees.move_to_folder(&id, Some("nope")).await.is_err());
        assert!(trees.move_to_folder(&id, None).await.unwrap().folder_id.is_none());

        let touched = trees.touch(&id).await.unwrap();
        assert!(touched.updated_at >= moved.updated_at);

        let deleted = trees.delete(&id).await.unwrap();
        assert_eq!(deleted, vec![snap.tree.root_id.clone()]);
        assert!(store.get_context_box(&id).await.unwrap().is_none());
        assert!(matches!(trees.load(&id).await, Err(Error::NotFound { .. })));
    }
}
