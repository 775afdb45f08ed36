//! `canopy tree`: Conversation tree management.

use std::collections::HashSet;

use canopy_conversation::dag::children_index;
use canopy_core::node::Node;
use clap::Subcommand;

use crate::runtime::{CliResult, Runtime, preview};

#[derive(Subcommand)]
pub enum TreeCommand {
    /// Create a tree
    New {
        title: String,
        /// Place the tree in a folder
        #[arg(short, long)]
        folder: Option<String>,
    },
    /// List trees, most recently updated first
    List {
        #[arg(short, long)]
        folder: Option<String>,
    },
    /// Print a tree's branches
    Show { tree: String },
    /// Delete a tree and everything in it
    Delete { tree: String },
}

pub async fn run(cmd: TreeCommand) -> CliResult {
    let rt = Runtime::load().await?;
    let mut ws = rt.workspace();

    match cmd {
        TreeCommand::New { title, folder } => {
            let snapshot = ws.create_tree(&title, folder.as_deref()).await?;
            println!("Created tree {} ({})", snapshot.tree.id, snapshot.tree.title);
        }
        TreeCommand::List { folder } => {
            let trees = ws.trees().list(folder.as_deref()).await?;
            if trees.is_empty() {
                println!("No trees yet. Create one with `canopy tree new <title>`.");
            }
            for tree in trees {
                println!(
                    "{}  {}  (updated {})",
                    tree.id,
                    tree.title,
                    tree.updated_at.format("%Y-%m-%d %H:%M")
                );
            }
        }
        TreeCommand::Show { tree } => {
            ws.open_tree(&tree).await?;
            print_tree(&ws);
        }
        TreeCommand::Delete { tree } => {
            let deleted = ws.delete_tree(&tree).await?;
            println!("Deleted tree {tree} ({} nodes)", deleted.len());
        }
    }
    Ok(())
}

fn print_tree(ws: &canopy_conversation::Workspace) {
    let Some(snapshot) = ws.snapshot() else {
        return;
    };
    println!("{}  ({} branches)", snapshot.tree.title, ws.branch_count());
    let on_path: HashSet<&str> = ws.active_path().iter().map(|n| n.id.as_str()).collect();
    let index = children_index(&snapshot.nodes);

    // depth-first, children oldest first
    let mut stack: Vec<(&Node, usize)> = snapshot.root().map(|r| (r, 0)).into_iter().collect();
    while let Some((node, depth)) = stack.pop() {
        let marker = if ws.active_node_id() == Some(node.id.as_str()) {
            '>'
        } else if on_path.contains(node.id.as_str()) {
            '*'
        } else {
            ' '
        };
        let boxed = if snapshot.context_box.contains_node(&node.id) { "[ctx] " } else { "" };
        println!(
            "{marker} {}{:<10} {}{}  ({})",
            "  ".repeat(depth),
            node.node_type.as_str(),
            boxed,
            preview(node.prompt_text(), 60),
            node.id
        );
        if let Some(children) = index.get(node.id.as_str()) {
            for child in children.iter().rev() {
                stack.push((*child, depth + 1));
            }
        }
    }
    println!(
        "\nContext box: {}/{} tokens",
        snapshot.context_box.total_tokens, snapshot.context_box.max_tokens
    );
}
