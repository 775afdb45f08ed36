//! `canopy memory`: Long-term memory management.

use canopy_core::memory::{MemoryItem, MemoryScope};
use canopy_memory::MemoryQuery;
use clap::Subcommand;

use crate::runtime::{CliResult, Runtime, preview};

#[derive(Subcommand)]
pub enum MemoryCommand {
    /// Store a memory
    Add {
        text: String,
        /// Scope the memory to one folder instead of the user
        #[arg(short, long)]
        folder: Option<String>,
        /// Tag the memory (repeatable)
        #[arg(short, long = "tag")]
        tags: Vec<String>,
    },
    /// Search active memories
    Search {
        query: String,
        #[arg(short = 'k', long, default_value_t = 8)]
        limit: usize,
        #[arg(short, long)]
        folder: Option<String>,
    },
    /// List memories
    List {
        /// Include archived memories
        #[arg(long)]
        all: bool,
    },
    /// Archive a memory so it is no longer surfaced
    Archive { id: String },
}

fn scope_for(folder: Option<String>) -> MemoryScope {
    match folder {
        Some(folder_id) => MemoryScope::Folder { folder_id },
        None => MemoryScope::User,
    }
}

pub async fn run(cmd: MemoryCommand) -> CliResult {
    let rt = Runtime::load().await?;
    let bank = rt.memory_bank();

    match cmd {
        MemoryCommand::Add { text, folder, tags } => {
            let item = bank
                .upsert(MemoryItem::new(scope_for(folder), text).with_tags(tags))
                .await?;
            println!("Stored memory {}", item.id);
        }
        MemoryCommand::Search { query, limit, folder } => {
            let mut q = MemoryQuery::new(&query, limit).with_scope(MemoryScope::User);
            if folder.is_some() {
                q = q.with_scope(scope_for(folder));
            }
            let results = bank.search(&q).await?;
            if results.is_empty() {
                println!("No memories match \"{query}\".");
            }
            for (i, hit) in results.iter().enumerate() {
                println!("  {:>2}. [{:.2}] {}  ({})", i + 1, hit.score, preview(&hit.item.text, 72), hit.item.id);
                if !hit.item.tags.is_empty() {
                    println!("      tags: {}", hit.item.tags.join(", "));
                }
            }
        }
        MemoryCommand::List { all } => {
            for item in bank.list(None, all).await? {
                println!("{}  {:?}  {}", item.id, item.status, preview(&item.text, 72));
            }
        }
        MemoryCommand::Archive { id } => {
            bank.archive(&id).await?;
            println!("Archived memory {id}");
        }
    }
    Ok(())
}
