//! # Canopy Conversation
//!
//! The conversation graph: pure DAG algorithms ([`dag`]), store-backed
//! services for nodes, trees, folders and context boxes, and the
//! [`Workspace`] state container that keeps an open tree cached and
//! consistent with the store.

pub mod boxes;
pub mod dag;
pub mod folders;
pub mod nodes;
pub mod trees;
pub mod workspace;

pub use boxes::ContextBoxService;
pub use dag::{FlowEdge, FlowGraph, FlowNode, LayoutOptions, NodeMap};
pub use folders::FolderService;
pub use nodes::{NewNode, NodeService};
pub use trees::{TreeService, TreeSnapshot};
pub use workspace::Workspace;
