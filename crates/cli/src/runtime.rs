//! Shared wiring for the commands: config, store, and the services built
//! on them.

use std::sync::Arc;

use canopy_agent::{AgentLoop, ChatService, MemorySources, ModelSettings};
use canopy_config::AppConfig;
use canopy_conversation::{LayoutOptions, Workspace};
use canopy_core::event::EventBus;
use canopy_core::tool::ToolRegistry;
use canopy_memory::{DocsService, InjectionLimits, MemoryBank, MemoryWriter, WriterSettings};
use canopy_providers::{build_embedder, build_endpoint};
use canopy_store::SqliteStore;
use tracing::debug;

pub type CliResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

pub struct Runtime {
    pub config: AppConfig,
    pub store: SqliteStore,
    pub events: EventBus,
}

impl Runtime {
    pub async fn load() -> CliResult<Self> {
        let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
        let db_path = config.database_path();
        if let Some(dir) = db_path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        debug!(path = %db_path.display(), "Opening store");
        let store = SqliteStore::new(&config.database_url()).await?;
        Ok(Self {
            config,
            store,
            events: EventBus::default(),
        })
    }

    pub fn workspace(&self) -> Workspace {
        Workspace::new(self.store.clone(), self.events.clone())
            .with_layout(LayoutOptions {
                x_spacing: self.config.context.x_spacing,
                y_spacing: self.config.context.y_spacing,
            })
            .with_default_max_tokens(self.config.context.default_max_tokens)
    }

    pub fn memory_bank(&self) -> Arc<MemoryBank> {
        let mut bank = MemoryBank::new(self.store.clone(), self.events.clone());
        if let Some(embedder) = build_embedder(&self.config) {
            bank = bank.with_embedder(embedder, &self.config.memory.embedding_model);
        }
        Arc::new(bank)
    }

    pub fn docs(&self) -> DocsService {
        DocsService::new(self.store.clone())
    }

    /// A chat service offering `tools`. Memory injection and the memory
    /// writer follow the `[memory]` config section.
    pub fn chat_service(&self, tools: Arc<ToolRegistry>) -> ChatService {
        let config = &self.config;
        let endpoint = build_endpoint(config);
        let settings = ModelSettings::from_config(config);
        let agent = AgentLoop::new(endpoint.clone(), tools, self.events.clone())
            .with_max_steps(config.agent.max_steps)
            .with_stream(config.agent.stream);

        let mut service = ChatService::new(agent, endpoint.clone(), settings.clone())
            .with_tool_settings(config.tool_settings())
            .with_recent_messages(config.context.recent_messages);
        if !config.memory.enabled {
            return service;
        }

        let bank = self.memory_bank();
        service = service.with_memory(MemorySources {
            bank: bank.clone(),
            docs: self.docs(),
            limits: InjectionLimits {
                max_pinned: config.memory.max_pinned_inject,
                max_auto: config.memory.max_auto_inject,
            },
        });
        if config.memory.auto_write {
            let writer = MemoryWriter::new(
                bank,
                endpoint,
                WriterSettings {
                    base_url: settings.base_url,
                    api_key: settings.api_key,
                    model: settings.model,
                    min_chars: config.memory.min_turn_chars_for_write,
                },
            );
            service = service.with_writer(Arc::new(writer));
        }
        service
    }
}

/// First `max` characters of `text` on one line.
pub fn preview(text: &str, max: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max {
        return flat;
    }
    let cut: String = flat.chars().take(max.saturating_sub(1)).collect();
    format!("{cut}…")
}
