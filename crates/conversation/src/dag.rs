//! Pure operations over an in-memory node collection.
//!
//! Nothing here touches the store. Every function derives its answer from
//! parent links alone, so identical inputs always produce identical output.
//! Walks keep a visited set and never loop on malformed parent chains.

use canopy_core::node::{Node, NodeType, Position};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::warn;

pub type NodeMap = HashMap<String, Node>;

const LABEL_CHARS: usize = 48;

/// Ids from the root down to `target_id`, root first.
///
/// Returns an empty list when the target is unknown, a parent reference
/// dangles, or the parent chain loops back on itself.
pub fn compute_path_ids(nodes: &NodeMap, target_id: &str) -> Vec<String> {
    let mut path = Vec::new();
    let mut seen = HashSet::new();
    let mut cursor = Some(target_id);

    while let Some(id) = cursor {
        let Some(node) = nodes.get(id) else {
            warn!(node_id = id, target_id, "Path walk reached a missing node");
            return Vec::new();
        };
        if !seen.insert(id) {
            warn!(node_id = id, target_id, "Path walk detected a cycle");
            return Vec::new();
        }
        path.push(node.id.clone());
        cursor = node.parent_id.as_deref();
    }

    path.reverse();
    path
}

/// Children of every parent, ordered by `created_at` then id.
pub fn children_index(nodes: &NodeMap) -> HashMap<&str, Vec<&Node>> {
    let mut index: HashMap<&str, Vec<&Node>> = HashMap::new();
    for node in nodes.values() {
        if let Some(parent) = node.parent_id.as_deref() {
            index.entry(parent).or_default().push(node);
        }
    }
    for kids in index.values_mut() {
        kids.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    }
    index
}

/// Nodes reachable from `root_id` in depth-first pre-order, with depth.
fn walk<'a>(
    nodes: &'a NodeMap,
    index: &HashMap<&str, Vec<&'a Node>>,
    root_id: &str,
) -> Vec<(&'a Node, usize)> {
    let Some(root) = nodes.get(root_id) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();
    let mut stack = vec![(root, 0usize)];

    while let Some((node, depth)) = stack.pop() {
        if !seen.insert(node.id.as_str()) {
            continue;
        }
        out.push((node, depth));
        if let Some(kids) = index.get(node.id.as_str()) {
            for &kid in kids.iter().rev() {
                stack.push((kid, depth + 1));
            }
        }
    }
    out
}

/// Number of nodes reachable from the root that have no children.
pub fn count_leaf_branches(nodes: &NodeMap, root_id: &str) -> usize {
    leaf_nodes(nodes, root_id).len()
}

/// Leaves reachable from the root, in depth-first order.
pub fn leaf_nodes<'a>(nodes: &'a NodeMap, root_id: &str) -> Vec<&'a Node> {
    let index = children_index(nodes);
    walk(nodes, &index, root_id)
        .into_iter()
        .filter(|(node, _)| index.get(node.id.as_str()).is_none_or(|kids| kids.is_empty()))
        .map(|(node, _)| node)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LayoutOptions {
    pub x_spacing: f64,
    pub y_spacing: f64,
}

impl Default for LayoutOptions {
    fn default() -> Self {
        Self {
            x_spacing: 300.0,
            y_spacing: 150.0,
        }
    }
}

/// Positions for every node reachable from the root.
///
/// The root sits at the origin; each level moves one `x_spacing` to the
/// right and the i-th child sits `i * y_spacing` below its parent.
pub fn compute_auto_layout(nodes: &NodeMap, root_id: &str, options: LayoutOptions) -> HashMap<String, Position> {
    let index = children_index(nodes);
    let mut positions = HashMap::new();
    let Some(root) = nodes.get(root_id) else {
        return positions;
    };

    positions.insert(root.id.clone(), Position { x: 0.0, y: 0.0 });
    let mut queue = VecDeque::from([(root, 0usize, 0.0f64)]);

    while let Some((node, depth, y)) = queue.pop_front() {
        let Some(kids) = index.get(node.id.as_str()) else {
            continue;
        };
        for (i, &kid) in kids.iter().enumerate() {
            if positions.contains_key(&kid.id) {
                continue;
            }
            let position = Position {
                x: (depth + 1) as f64 * options.x_spacing,
                y: y + i as f64 * options.y_spacing,
            };
            positions.insert(kid.id.clone(), position);
            queue.push_back((kid, depth + 1, position.y));
        }
    }
    positions
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowNode {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub label: String,
    pub position: Position,
    pub is_active: bool,
    pub is_in_active_path: bool,
    pub is_selected: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowEdge {
    pub id: String,
    pub source: String,
    pub target: String,
    /// The edge leads into the active node.
    pub is_active: bool,
    pub is_in_active_path: bool,
    /// The edge leads into a selected node.
    pub is_selected: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FlowGraph {
    pub nodes: Vec<FlowNode>,
    pub edges: Vec<FlowEdge>,
}

impl FlowGraph {
    pub fn node(&self, id: &str) -> Option<&FlowNode> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

pub struct FlowGraphInput<'a> {
    pub nodes: &'a NodeMap,
    pub root_id: &'a str,
    pub active_node_id: Option<&'a str>,
    pub selected_node_ids: &'a HashSet<String>,
    pub layout: LayoutOptions,
}

/// Build the renderable graph. Highlight flags come only from the inputs;
/// a manual node position wins over the auto-layout one.
pub fn build_flow_graph(input: &FlowGraphInput<'_>) -> FlowGraph {
    let index = children_index(input.nodes);
    let layout = compute_auto_layout(input.nodes, input.root_id, input.layout);
    let active_path: HashSet<String> = input
        .active_node_id
        .map(|id| compute_path_ids(input.nodes, id))
        .unwrap_or_default()
        .into_iter()
        .collect();
    let is_active = |id: &str| input.active_node_id == Some(id);

    let mut graph = FlowGraph::default();
    for (node, _) in walk(input.nodes, &index, input.root_id) {
        let position = node
            .position
            .or_else(|| layout.get(&node.id).copied())
            .unwrap_or(Position { x: 0.0, y: 0.0 });
        let in_path = active_path.contains(&node.id);

        graph.nodes.push(FlowNode {
            id: node.id.clone(),
            node_type: node.node_type,
            label: label_for(node),
            position,
            is_active: is_active(&node.id),
            is_in_active_path: in_path,
            is_selected: input.selected_node_ids.contains(&node.id),
        });

        if let Some(parent_id) = node.parent_id.as_deref().filter(|_| node.id != input.root_id) {
            graph.edges.push(FlowEdge {
                id: format!("e-{parent_id}-{}", node.id),
                source: parent_id.to_string(),
                target: node.id.clone(),
                is_active: is_active(&node.id),
                is_in_active_path: in_path && active_path.contains(parent_id),
                is_selected: input.selected_node_ids.contains(&node.id),
            });
        }
    }
    graph
}

/// First line of the prompt text, cut to a short label.
fn label_for(node: &Node) -> String {
    let first_line = node.prompt_text().lines().next().unwrap_or_default().trim();
    if first_line.chars().count() <= LABEL_CHARS {
        return first_line.to_string();
    }
    let mut label: String = first_line.chars().take(LABEL_CHARS).collect();
    label.push_str("...");
    label
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn node(id: &str, parent: Option<&str>, order: i64) -> Node {
        let node_type = if parent.is_none() { NodeType::System } else { NodeType::User };
        let mut n = Node::new(node_type, parent.map(String::from), format!("content of {id}"));
        n.id = id.to_string();
        n.created_at = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(order);
        n.updated_at = n.created_at;
        n
    }

    /// root
    /// ├── a
    /// │   ├── a1
    /// │   └── a2
    /// │       └── a2x
    /// └── b
    fn sample() -> NodeMap {
        [
            node("root", None, 0),
            node("a", Some("root"), 1),
            node("b", Some("root"), 2),
            node("a1", Some("a"), 3),
            node("a2", Some("a"), 4),
            node("a2x", Some("a2"), 5),
        ]
        .into_iter()
        .map(|n| (n.id.clone(), n))
        .collect()
    }

    fn depth_of(nodes: &NodeMap, id: &str) -> usize {
        let mut depth = 0;
        let mut cursor = nodes[id].parent_id.as_deref();
        while let Some(p) = cursor {
            depth += 1;
            cursor = nodes[p].parent_id.as_deref();
        }
        depth
    }

    #[test]
    fn path_is_root_first_and_depth_plus_one_long() {
        let nodes = sample();
        for id in nodes.keys() {
            let path = compute_path_ids(&nodes, id);
            assert_eq!(path.first().map(String::as_str), Some("root"));
            assert_eq!(path.last(), Some(id));
            assert_eq!(path.len(), depth_of(&nodes, id) + 1);
        }
        assert_eq!(compute_path_ids(&nodes, "a2x"), vec!["root", "a", "a2", "a2x"]);
    }

    #[test]
    fn path_fails_empty_on_cycle_dangling_or_unknown() {
        let mut nodes = sample();
        nodes.insert("x".into(), node("x", Some("y"), 10));
        nodes.insert("y".into(), node("y", Some("x"), 11));
        nodes.insert("orphan".into(), node("orphan", Some("ghost"), 12));

        assert!(compute_path_ids(&nodes, "x").is_empty());
        assert!(compute_path_ids(&nodes, "orphan").is_empty());
        assert!(compute_path_ids(&nodes, "nope").is_empty());
    }

    #[test]
    fn leaves_and_branch_count() {
        let nodes = sample();
        let leaves: Vec<_> = leaf_nodes(&nodes, "root").into_iter().map(|n| n.id.as_str()).collect();
        assert_eq!(leaves, vec!["a1", "a2x", "b"]);
        assert_eq!(count_leaf_branches(&nodes, "root"), 3);
        assert_eq!(count_leaf_branches(&nodes, "a2"), 1);
        assert_eq!(count_leaf_branches(&nodes, "missing"), 0);
    }

    #[test]
    fn layout_x_is_depth_times_spacing() {
        let mut nodes = sample();
        nodes.insert("stray".into(), node("stray", Some("ghost"), 9));
        let options = LayoutOptions {
            x_spacing: 100.0,
            y_spacing: 40.0,
        };
        let positions = compute_auto_layout(&nodes, "root", options);

        assert_eq!(positions.len(), 6);
        assert!(!positions.contains_key("stray"));
        assert_eq!(positions["root"], Position { x: 0.0, y: 0.0 });
        for (id, pos) in &positions {
            assert_eq!(pos.x, depth_of(&nodes, id) as f64 * 100.0);
        }
        // second child sits one step below its parent
        assert_eq!(positions["b"].y, 40.0);
        assert_eq!(positions["a2"].y, positions["a"].y + 40.0);
    }

    #[test]
    fn flow_graph_marks_active_path_and_selection() {
        let mut nodes = sample();
        if let Some(b) = nodes.get_mut("b") {
            b.position = Some(Position { x: 7.0, y: 8.0 });
        }
        let selected: HashSet<String> = ["b".to_string()].into();
        let graph = build_flow_graph(&FlowGraphInput {
            nodes: &nodes,
            root_id: "root",
            active_node_id: Some("a2"),
            selected_node_ids: &selected,
            layout: LayoutOptions::default(),
        });

        assert_eq!(graph.nodes.len(), 6);
        assert_eq!(graph.edges.len(), 5);

        let in_path: Vec<_> = graph
            .nodes
            .iter()
            .filter(|n| n.is_in_active_path)
            .map(|n| n.id.as_str())
            .collect();
        assert_eq!(in_path, vec!["root", "a", "a2"]);
        assert!(graph.node("a2").unwrap().is_active);
        assert!(!graph.node("a2x").unwrap().is_in_active_path);

        let b = graph.node("b").unwrap();
        assert!(b.is_selected);
        assert_eq!(b.position, Position { x: 7.0, y: 8.0 });

        let edge = graph.edges.iter().find(|e| e.target == "a2").unwrap();
        assert!(edge.is_active && edge.is_in_active_path);
        let off_path = graph.edges.iter().find(|e| e.target == "a1").unwrap();
        assert!(!off_path.is_in_active_path);
    }

    #[test]
    fn flow_graph_is_deterministic() {
        let nodes = sample();
        let selected = HashSet::new();
        let input = FlowGraphInput {
            nodes: &nodes,
            root_id: "root",
            active_node_id: None,
            selected_node_ids: &selected,
            layout: LayoutOptions::default(),
        };
        assert_eq!(build_flow_graph(&input), build_flow_graph(&input));
        assert!(build_flow_graph(&input).nodes.iter().all(|n| !n.is_in_active_path));
    }

    #[test]
    fn long_labels_are_cut() {
        let mut n = node("n", None, 0);
        n.content = "x".repeat(100);
        assert_eq!(label_for(&n).chars().count(), LABEL_CHARS + 3);
    }
}
