//! The workspace: the process-wide state container for one open tree.
//!
//! State is owned here and changes only through the methods below. Every
//! mutator commits to the store first, then updates the cached snapshot,
//! then publishes a [`DomainEvent`] so observers can refresh. Selectors
//! derive their answers from the cache and never hand out mutable access.

use crate::boxes::ContextBoxService;
use crate::dag::{self, FlowGraph, FlowGraphInput, LayoutOptions};
use crate::folders::FolderService;
use crate::nodes::{NewNode, NodeService};
use crate::trees::{TreeService, TreeSnapshot};
use canopy_core::context_box::{ContextBox, FileBlock};
use canopy_core::event::{DomainEvent, EventBus};
use canopy_core::node::{Node, Position};
use canopy_core::tree::ConversationFolder;
use canopy_core::{Error, Result};
use canopy_store::SqliteStore;
use chrono::Utc;
use std::collections::HashSet;
use tokio::sync::broadcast;
use tracing::debug;

pub struct Workspace {
    nodes: NodeService,
    trees: TreeService,
    boxes: ContextBoxService,
    folders: FolderService,
    events: EventBus,
    layout: LayoutOptions,
    snapshot: Option<TreeSnapshot>,
    active_node_id: Option<String>,
    selected: HashSet<String>,
}

impl Workspace {
    pub fn new(store: SqliteStore, events: EventBus) -> Self {
        Self {
            nodes: NodeService::new(store.clone(), events.clone()),
            trees: TreeService::new(store.clone(), events.clone()),
            boxes: ContextBoxService::new(store.clone(), events.clone()),
            folders: FolderService::new(store, events.clone()),
            events,
            layout: LayoutOptions::default(),
            snapshot: None,
            active_node_id: None,
            selected: HashSet::new(),
        }
    }

    pub fn with_layout(mut self, layout: LayoutOptions) -> Self {
        self.layout = layout;
        self
    }

    /// Context-box budget for trees created from here on.
    pub fn with_default_max_tokens(mut self, max_tokens: usize) -> Self {
        self.trees = self.trees.with_default_max_tokens(max_tokens);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<std::sync::Arc<DomainEvent>> {
        self.events.subscribe()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Read access to trees outside the open one (listing, lookup).
    pub fn trees(&self) -> &TreeService {
        &self.trees
    }

    pub fn folders(&self) -> &FolderService {
        &self.folders
    }

    pub fn nodes(&self) -> &NodeService {
        &self.nodes
    }

    // --- Tree lifecycle ---

    /// Load a tree and make it the open one. The active node resumes at the
    /// most recent leaf.
    pub async fn open_tree(&mut self, tree_id: &str) -> Result<&TreeSnapshot> {
        let snapshot = self.trees.load(tree_id).await?;
        let active = snapshot.latest_leaf().map(|n| n.id.clone());
        Ok(self.install(snapshot, active))
    }

    pub async fn create_tree(&mut self, title: &str, folder_id: Option<&str>) -> Result<&TreeSnapshot> {
        let snapshot = self.trees.create(title, folder_id).await?;
        let active = Some(snapshot.tree.root_id.clone());
        Ok(self.install(snapshot, active))
    }

    /// Re-read the open tree from the store, keeping the active node and the
    /// selection where they still exist.
    pub async fn reload(&mut self) -> Result<()> {
        let tree_id = self.open()?.tree.id.clone();
        let snapshot = self.trees.load(&tree_id).await?;
        let active = self
            .active_node_id
            .take()
            .filter(|id| snapshot.nodes.contains_key(id))
            .or_else(|| snapshot.latest_leaf().map(|n| n.id.clone()));
        self.selected.retain(|id| snapshot.nodes.contains_key(id));
        self.snapshot = Some(snapshot);
        self.active_node_id = active;
        Ok(())
    }

    pub fn close_tree(&mut self) {
        self.snapshot = None;
        self.active_node_id = None;
        self.selected.clear();
    }

    pub async fn rename_tree(&mut self, title: &str) -> Result<()> {
        let tree_id = self.open()?.tree.id.clone();
        let tree = self.trees.rename(&tree_id, title).await?;
        self.open_mut()?.tree = tree;
        Ok(())
    }

    /// Delete any tree; closes it first if it is the open one.
    pub async fn delete_tree(&mut self, tree_id: &str) -> Result<Vec<String>> {
        let deleted = self.trees.delete(tree_id).await?;
        if self.snapshot.as_ref().is_some_and(|s| s.tree.id == tree_id) {
            self.close_tree();
        }
        Ok(deleted)
    }

    // --- Nodes ---

    /// Add a node under a parent that belongs to the open tree.
    pub async fn append_node(&mut self, spec: NewNode) -> Result<Node> {
        let tree_id = self.check_parent(&spec)?;
        let node = self.nodes.create(&tree_id, spec).await?;
        self.open_mut()?.nodes.insert(node.id.clone(), node.clone());
        self.touch(&tree_id).await?;
        Ok(node)
    }

    /// Add several nodes in one transaction.
    pub async fn append_nodes(&mut self, specs: Vec<NewNode>) -> Result<Vec<Node>> {
        let tree_id = self.open()?.tree.id.clone();
        for spec in &specs {
            self.check_parent(spec)?;
        }
        let nodes = self.nodes.batch_create(&tree_id, specs).await?;
        let snapshot = self.open_mut()?;
        for node in &nodes {
            snapshot.nodes.insert(node.id.clone(), node.clone());
        }
        self.touch(&tree_id).await?;
        Ok(nodes)
    }

    /// Delete a node's subtree. If the active node goes with it, the
    /// deleted node's parent becomes active.
    pub async fn delete_node(&mut self, node_id: &str) -> Result<Vec<String>> {
        let tree_id = self.open()?.tree.id.clone();
        let parent_id = self
            .open()?
            .node(node_id)
            .ok_or_else(|| Error::not_found("node", node_id))?
            .parent_id
            .clone();
        let deleted = self.nodes.delete(&tree_id, node_id).await?;
        let context_box = self.boxes.get(&tree_id).await?;

        let snapshot = self.open_mut()?;
        for id in &deleted {
            snapshot.nodes.remove(id);
        }
        snapshot.context_box = context_box;
        let gone: HashSet<&String> = deleted.iter().collect();
        self.selected.retain(|id| !gone.contains(id));
        if self.active_node_id.as_ref().is_some_and(|id| gone.contains(id)) {
            self.set_active(parent_id);
        }
        Ok(deleted)
    }

    pub async fn edit_node(&mut self, node_id: &str, content: &str) -> Result<Node> {
        let tree_id = self.owned_node(node_id)?;
        let node = self.nodes.update_content(&tree_id, node_id, content).await?;
        let context_box = self.boxes.get(&tree_id).await?;
        let snapshot = self.open_mut()?;
        snapshot.nodes.insert(node.id.clone(), node.clone());
        snapshot.context_box = context_box;
        Ok(node)
    }

    pub async fn set_node_position(&mut self, node_id: &str, position: Option<Position>) -> Result<Node> {
        let tree_id = self.owned_node(node_id)?;
        let node = self.nodes.set_position(&tree_id, node_id, position).await?;
        self.open_mut()?.nodes.insert(node.id.clone(), node.clone());
        Ok(node)
    }

    /// Replace a run of nodes with a summary branch and make it active.
    pub async fn compress(&mut self, node_ids: &[String], summary: &str) -> Result<Node> {
        let tree_id = self.open()?.tree.id.clone();
        for id in node_ids {
            self.owned_node(id)?;
        }
        let node = self.nodes.compress(&tree_id, node_ids, summary).await?;
        self.open_mut()?.nodes.insert(node.id.clone(), node.clone());
        self.set_active(Some(node.id.clone()));
        Ok(node)
    }

    // --- Active node & selection ---

    pub fn set_active_node(&mut self, node_id: Option<&str>) -> Result<()> {
        if let Some(id) = node_id {
            self.owned_node(id)?;
        }
        self.set_active(node_id.map(String::from));
        Ok(())
    }

    /// Replace the selection. Every id must belong to the open tree.
    pub fn select<I, S>(&mut self, node_ids: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut next = HashSet::new();
        for id in node_ids {
            let id = id.into();
            self.owned_node(&id)?;
            next.insert(id);
        }
        self.selected = next;
        self.publish_selection()
    }

    /// Flip one node in or out of the selection. Returns whether it is now
    /// selected.
    pub fn toggle_selected(&mut self, node_id: &str) -> Result<bool> {
        self.owned_node(node_id)?;
        let now_selected = if self.selected.remove(node_id) {
            false
        } else {
            self.selected.insert(node_id.to_string());
            true
        };
        self.publish_selection()?;
        Ok(now_selected)
    }

    pub fn clear_selection(&mut self) -> Result<()> {
        self.selected.clear();
        self.publish_selection()
    }

    /// Record a finished turn: the assistant node becomes active.
    pub fn complete_turn(&mut self, user_node_id: &str, assistant_node_id: &str, steps: usize) -> Result<()> {
        let tree_id = self.owned_node(user_node_id)?;
        self.owned_node(assistant_node_id)?;
        self.set_active(Some(assistant_node_id.to_string()));
        self.events.publish(DomainEvent::TurnCompleted {
            tree_id,
            user_node_id: user_node_id.to_string(),
            assistant_node_id: assistant_node_id.to_string(),
            steps,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    // --- Context box ---

    pub async fn add_to_context(&mut self, node_id: &str) -> Result<bool> {
        let tree_id = self.owned_node(node_id)?;
        let (context_box, added) = self.boxes.add_node(&tree_id, node_id).await?;
        self.open_mut()?.context_box = context_box;
        Ok(added)
    }

    /// Add every selected node not yet in the box, oldest first.
    pub async fn add_selection_to_context(&mut self) -> Result<usize> {
        let mut ordered: Vec<&Node> = {
            let snapshot = self.open()?;
            self.selected.iter().filter_map(|id| snapshot.node(id)).collect()
        };
        ordered.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        let ids: Vec<String> = ordered.into_iter().map(|n| n.id.clone()).collect();

        let mut added = 0;
        for id in ids {
            if self.add_to_context(&id).await? {
                added += 1;
            }
        }
        Ok(added)
    }

    pub async fn add_file_to_context(&mut self, file: FileBlock) -> Result<()> {
        let tree_id = self.open()?.tree.id.clone();
        let context_box = self.boxes.add_file(&tree_id, file).await?;
        self.open_mut()?.context_box = context_box;
        Ok(())
    }

    pub async fn remove_context_block(&mut self, block_id: &str) -> Result<bool> {
        let tree_id = self.open()?.tree.id.clone();
        let (context_box, removed) = self.boxes.remove_block(&tree_id, block_id).await?;
        self.open_mut()?.context_box = context_box;
        Ok(removed)
    }

    pub async fn move_context_block(&mut self, block_id: &str, to_index: usize) -> Result<bool> {
        let tree_id = self.open()?.tree.id.clone();
        let (context_box, moved) = self.boxes.move_block(&tree_id, block_id, to_index).await?;
        self.open_mut()?.context_box = context_box;
        Ok(moved)
    }

    pub async fn pin_memory(&mut self, memory_id: &str) -> Result<()> {
        let tree_id = self.open()?.tree.id.clone();
        let context_box = self.boxes.pin_memory(&tree_id, memory_id).await?;
        self.open_mut()?.context_box = context_box;
        Ok(())
    }

    pub async fn unpin_memory(&mut self, memory_id: &str) -> Result<()> {
        let tree_id = self.open()?.tree.id.clone();
        let context_box = self.boxes.unpin_memory(&tree_id, memory_id).await?;
        self.open_mut()?.context_box = context_box;
        Ok(())
    }

    // --- Folders touching the open tree ---

    /// Change a folder prompt; the open tree re-resolves its root if it
    /// lives in that folder.
    pub async fn update_folder_prompt(&mut self, folder_id: &str, prompt: &str) -> Result<ConversationFolder> {
        let folder = self.folders.update_system_prompt(folder_id, prompt).await?;
        if self.open_folder_id() == Some(folder_id) {
            self.reload().await?;
        }
        Ok(folder)
    }

    pub async fn delete_folder(&mut self, folder_id: &str) -> Result<Vec<String>> {
        let detached = self.folders.delete(folder_id).await?;
        if self.open_folder_id() == Some(folder_id) {
            self.reload().await?;
        }
        Ok(detached)
    }

    // --- Selectors ---

    pub fn snapshot(&self) -> Option<&TreeSnapshot> {
        self.snapshot.as_ref()
    }

    pub fn active_node_id(&self) -> Option<&str> {
        self.active_node_id.as_deref()
    }

    pub fn active_node(&self) -> Option<&Node> {
        let id = self.active_node_id.as_deref()?;
        self.snapshot.as_ref()?.node(id)
    }

    pub fn selected_ids(&self) -> &HashSet<String> {
        &self.selected
    }

    pub fn context_box(&self) -> Option<&ContextBox> {
        self.snapshot.as_ref().map(|s| &s.context_box)
    }

    /// Root-first path to the active node.
    pub fn active_path(&self) -> Vec<&Node> {
        match (&self.snapshot, &self.active_node_id) {
            (Some(snapshot), Some(id)) => snapshot.path_to(id),
            _ => Vec::new(),
        }
    }

    pub fn flow_graph(&self) -> Option<FlowGraph> {
        let snapshot = self.snapshot.as_ref()?;
        Some(dag::build_flow_graph(&FlowGraphInput {
            nodes: &snapshot.nodes,
            root_id: &snapshot.tree.root_id,
            active_node_id: self.active_node_id.as_deref(),
            selected_node_ids: &self.selected,
            layout: self.layout,
        }))
    }

    pub fn branch_count(&self) -> usize {
        self.snapshot
            .as_ref()
            .map_or(0, |s| dag::count_leaf_branches(&s.nodes, &s.tree.root_id))
    }

    pub fn leaf_nodes(&self) -> Vec<&Node> {
        self.snapshot
            .as_ref()
            .map(|s| dag::leaf_nodes(&s.nodes, &s.tree.root_id))
            .unwrap_or_default()
    }

    // --- Internals ---

    fn install(&mut self, snapshot: TreeSnapshot, active: Option<String>) -> &TreeSnapshot {
        debug!(tree_id = %snapshot.tree.id, nodes = snapshot.nodes.len(), "Opened tree");
        self.selected.clear();
        self.active_node_id = active;
        self.events.publish(DomainEvent::ActiveNodeChanged {
            tree_id: snapshot.tree.id.clone(),
            node_id: self.active_node_id.clone(),
            timestamp: Utc::now(),
        });
        self.snapshot.insert(snapshot)
    }

    fn open(&self) -> Result<&TreeSnapshot> {
        self.snapshot
            .as_ref()
            .ok_or_else(|| Error::Validation("no tree is open".into()))
    }

    fn open_mut(&mut self) -> Result<&mut TreeSnapshot> {
        self.snapshot
            .as_mut()
            .ok_or_else(|| Error::Validation("no tree is open".into()))
    }

    fn open_folder_id(&self) -> Option<&str> {
        self.snapshot.as_ref()?.tree.folder_id.as_deref()
    }

    /// The open tree's id, if `node_id` belongs to it.
    fn owned_node(&self, node_id: &str) -> Result<String> {
        let snapshot = self.open()?;
        if !snapshot.nodes.contains_key(node_id) {
            return Err(Error::not_found("node", node_id));
        }
        Ok(snapshot.tree.id.clone())
    }

    fn check_parent(&self, spec: &NewNode) -> Result<String> {
        match &spec.parent_id {
            Some(parent_id) => self.owned_node(parent_id),
            None => Err(Error::Validation("a tree has exactly one root".into())),
        }
    }

    async fn touch(&mut self, tree_id: &str) -> Result<()> {
        let tree = self.trees.touch(tree_id).await?;
        self.open_mut()?.tree = tree;
        Ok(())
    }

    fn set_active(&mut self, node_id: Option<String>) {
        if self.active_node_id == node_id {
            return;
        }
        self.active_node_id = node_id;
        if let Some(snapshot) = &self.snapshot {
            self.events.publish(DomainEvent::ActiveNodeChanged {
                tree_id: snapshot.tree.id.clone(),
                node_id: self.active_node_id.clone(),
                timestamp: Utc::now(),
            });
        }
    }

    fn publish_selection(&self) -> Result<()> {
        let tree_id = self.open()?.tree.id.clone();
        let mut node_ids: Vec<String> = self.selected.iter().cloned().collect();
        node_ids.sort();
        self.events.publish(DomainEvent::SelectionChanged {
            tree_id,
            node_ids,
            timestamp: Utc::now(),
        });
        Ok(())
    }
}
