//! `canopy folder`: Folder management.

use clap::Subcommand;

use crate::runtime::{CliResult, Runtime, preview};

#[derive(Subcommand)]
pub enum FolderCommand {
    /// Create a folder
    New {
        name: String,
        /// System prompt for trees in this folder
        #[arg(short, long)]
        prompt: Option<String>,
    },
    /// List folders
    List,
    /// Replace a folder's system prompt
    Prompt { folder: String, prompt: String },
    /// Delete a folder; its trees move to the top level
    Delete { folder: String },
}

pub async fn run(cmd: FolderCommand) -> CliResult {
    let rt = Runtime::load().await?;
    let mut ws = rt.workspace();

    match cmd {
        FolderCommand::New { name, prompt } => {
            let folder = ws.folders().create(&name, prompt.as_deref()).await?;
            println!("Created folder {} ({})", folder.id, folder.name);
        }
        FolderCommand::List => {
            let folders = ws.folders().list().await?;
            if folders.is_empty() {
                println!("No folders.");
            }
            for folder in folders {
                let models = folder
                    .enabled_models
                    .as_ref()
                    .map_or_else(|| "all models".to_string(), |m| m.join(", "));
                println!("{}  {}  [{}]", folder.id, folder.name, models);
                println!("    {}", preview(&folder.system_prompt, 72));
            }
        }
        FolderCommand::Prompt { folder, prompt } => {
            let folder = ws.update_folder_prompt(&folder, &prompt).await?;
            println!("Updated prompt of {}", folder.name);
        }
        FolderCommand::Delete { folder } => {
            let detached = ws.delete_folder(&folder).await?;
            println!("Deleted folder {folder}; {} trees moved to the top level", detached.len());
        }
    }
    Ok(())
}
