//! Canopy CLI entry point.
//!
//! Commands:
//! - `init`     Write a default config file
//! - `tree`     Create, list, show and delete conversation trees
//! - `folder`   Manage folders and their system prompts
//! - `chat`     Send one message into a tree
//! - `context`  Edit the context box and preview the next prompt
//! - `memory`   Add, search and archive long-term memories
//! - `models`   List models and what they can do
//! - `serve`    Start the HTTP gateway

use clap::{Parser, Subcommand};

mod commands;
mod runtime;

#[derive(Parser)]
#[command(
    name = "canopy",
    about = "Canopy: branching conversations with a curated context box",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config file to ~/.canopy/config.toml
    Init,

    /// Manage conversation trees
    #[command(subcommand)]
    Tree(commands::tree::TreeCommand),

    /// Manage folders
    #[command(subcommand)]
    Folder(commands::folder::FolderCommand),

    /// Send a message into a tree, branching from its active node
    Chat {
        /// Tree id
        tree: String,
        /// Message text
        message: String,
        /// Offer a tool for this turn (repeatable)
        #[arg(short, long = "tool")]
        tools: Vec<String>,
        /// Override the configured model
        #[arg(short, long)]
        model: Option<String>,
        /// Branch from this node instead of the latest leaf
        #[arg(long)]
        from: Option<String>,
    },

    /// Inspect and edit a tree's context box
    #[command(subcommand)]
    Context(commands::context::ContextCommand),

    /// Manage long-term memory
    #[command(subcommand)]
    Memory(commands::memory::MemoryCommand),

    /// List models at the configured endpoint
    Models {
        /// Include embedding and image models
        #[arg(short, long)]
        all: bool,
    },

    /// Start the HTTP gateway
    Serve {
        /// Override the port
        #[arg(short, long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Init => commands::init::run().await?,
        Commands::Tree(cmd) => commands::tree::run(cmd).await?,
        Commands::Folder(cmd) => commands::folder::run(cmd).await?,
        Commands::Chat {
            tree,
            message,
            tools,
            model,
            from,
        } => commands::chat::run(&tree, &message, tools, model, from).await?,
        Commands::Context(cmd) => commands::context::run(cmd).await?,
        Commands::Memory(cmd) => commands::memory::run(cmd).await?,
        Commands::Models { all } => commands::models::run(all).await?,
        Commands::Serve { port } => commands::serve::run(port).await?,
    }

    Ok(())
}
