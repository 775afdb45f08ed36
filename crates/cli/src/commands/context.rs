//! `canopy context`: Inspect and edit a tree's context box.

use std::path::Path;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use canopy_core::context_box::{ContextBlock, FileBlock};
use canopy_core::tool::ToolRegistry;
use clap::Subcommand;

use crate::runtime::{CliResult, Runtime, preview};

#[derive(Subcommand)]
pub enum ContextCommand {
    /// Show the box and the prompt the next turn would send
    Show {
        tree: String,
        /// Text that drives memory retrieval
        #[arg(short, long, default_value = "")]
        query: String,
    },
    /// Reference a node in the box
    Add { tree: String, node: String },
    /// Attach a text or image file
    Attach { tree: String, path: String },
    /// Remove a block
    Remove { tree: String, block: String },
    /// Move a block to a new position (1-based)
    Move { tree: String, block: String, position: usize },
    /// Pin a memory to this tree
    Pin { tree: String, memory: String },
    /// Unpin a memory
    Unpin { tree: String, memory: String },
}

pub async fn run(cmd: ContextCommand) -> CliResult {
    let rt = Runtime::load().await?;
    let mut ws = rt.workspace();

    match cmd {
        ContextCommand::Show { tree, query } => {
            ws.open_tree(&tree).await?;
            show(&rt, &ws, &query).await?;
        }
        ContextCommand::Add { tree, node } => {
            ws.open_tree(&tree).await?;
            if ws.add_to_context(&node).await? {
                println!("Added {node}");
            } else {
                println!("{node} is already in the box");
            }
            print_budget(&ws);
        }
        ContextCommand::Attach { tree, path } => {
            ws.open_tree(&tree).await?;
            let file = read_file_block(Path::new(&path)).await?;
            println!("Attached {} ({} tokens)", file.caption(), file.token_count);
            ws.add_file_to_context(file).await?;
            print_budget(&ws);
        }
        ContextCommand::Remove { tree, block } => {
            ws.open_tree(&tree).await?;
            if ws.remove_context_block(&block).await? {
                println!("Removed {block}");
            } else {
                println!("No block {block}");
            }
        }
        ContextCommand::Move { tree, block, position } => {
            ws.open_tree(&tree).await?;
            if ws.move_context_block(&block, position.saturating_sub(1)).await? {
                println!("Moved {block} to position {position}");
            } else {
                println!("No block {block}");
            }
        }
        ContextCommand::Pin { tree, memory } => {
            ws.open_tree(&tree).await?;
            rt.memory_bank().get(&memory).await?;
            ws.pin_memory(&memory).await?;
            println!("Pinned {memory}");
        }
        ContextCommand::Unpin { tree, memory } => {
            ws.open_tree(&tree).await?;
            ws.unpin_memory(&memory).await?;
            println!("Unpinned {memory}");
        }
    }
    Ok(())
}

async fn show(rt: &Runtime, ws: &canopy_conversation::Workspace, query: &str) -> CliResult {
    if let Some(cb) = ws.context_box() {
        println!("Blocks:");
        for (i, block) in cb.blocks.iter().enumerate() {
            let label = match block {
                ContextBlock::Node(b) => format!("node {}", b.node_id),
                ContextBlock::File(f) => format!("file {}", f.caption()),
            };
            println!(
                "  {:>2}. {label}  ({} tokens)  [{}]",
                i + 1,
                block.token_count(),
                block.id()
            );
        }
        if !cb.pinned_memory_ids.is_empty() {
            println!("Pinned memories: {}", cb.pinned_memory_ids.join(", "));
        }
        println!();
    }

    // assembling needs no tools
    let service = rt.chat_service(Arc::new(ToolRegistry::new()));
    let assembled = service.build_context(ws, query).await?;
    for line in assembled.preview.lines() {
        println!("{line}");
    }
    if !assembled.missing_node_ids.is_empty() {
        eprintln!(
            "Missing nodes skipped: {}",
            preview(&assembled.missing_node_ids.join(", "), 120)
        );
    }
    Ok(())
}

fn print_budget(ws: &canopy_conversation::Workspace) {
    if let Some(cb) = ws.context_box() {
        let marker = if cb.is_over_budget() { "  (over budget)" } else { "" };
        println!("Context: {}/{} tokens{marker}", cb.total_tokens, cb.max_tokens);
    }
}

async fn read_file_block(path: &Path) -> CliResult<FileBlock> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| format!("Not a file: {}", path.display()))?;
    let mime = mime_for(&file_name);
    if mime.starts_with("image/") {
        let bytes = tokio::fs::read(path).await?;
        Ok(FileBlock::image(file_name, mime, STANDARD.encode(bytes)))
    } else {
        let text = tokio::fs::read_to_string(path).await?;
        Ok(FileBlock::text(file_name, mime, text))
    }
}

fn mime_for(file_name: &str) -> &'static str {
    let ext = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "md" | "markdown" => "text/markdown",
        "json" => "application/json",
        "rs" => "text/x-rust",
        "py" => "text/x-python",
        "csv" => "text/csv",
        _ => "text/plain",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_core::context_box::FileKind;

    #[test]
    fn mime_follows_extension() {
        assert_eq!(mime_for("chart.PNG"), "image/png");
        assert_eq!(mime_for("notes.md"), "text/markdown");
        assert_eq!(mime_for("Makefile"), "text/plain");
    }

    #[tokio::test]
    async fn images_are_base64_encoded() {
        let path = std::env::temp_dir().join(format!("canopy-attach-{}.png", std::process::id()));
        tokio::fs::write(&path, [0u8, 1, 2]).await.unwrap();
        let block = read_file_block(&path).await.unwrap();
        tokio::fs::remove_file(&path).await.unwrap();

        assert_eq!(block.kind, FileKind::Image);
        assert_eq!(block.content, "AAEC");
        assert!(block.data_url().starts_with("data:image/png;base64,"));
    }
}
