//! Model endpoint clients for Canopy.
//!
//! All clients implement `canopy_core::ModelEndpoint`. [`build_endpoint`]
//! picks the in-process OpenAI-compatible client or the remote agent
//! client based on configuration.

pub mod classify;
pub mod openai_compat;
pub mod remote;
pub mod sse;

pub use classify::{ModelCategory, ModelInfo, chat_models, classify, model_info};
pub use openai_compat::OpenAiCompatClient;
pub use remote::RemoteAgentClient;

use canopy_config::AppConfig;
use canopy_core::provider::{Embedder, ModelEndpoint};
use std::sync::Arc;
use tracing::info;

/// The endpoint agent steps and helper calls go to.
pub fn build_endpoint(config: &AppConfig) -> Arc<dyn ModelEndpoint> {
    match &config.agent.endpoint_url {
        Some(url) => {
            info!(url = %url, "Using remote agent endpoint");
            Arc::new(RemoteAgentClient::new(url))
        }
        None => Arc::new(OpenAiCompatClient::default()),
    }
}

/// The embedder for the memory bank, or `None` when memory is disabled.
pub fn build_embedder(config: &AppConfig) -> Option<Arc<dyn Embedder>> {
    if !config.memory.enabled {
        return None;
    }
    let client = OpenAiCompatClient::new("embeddings")
        .with_embedding_endpoint(&config.base_url, config.api_key.clone().unwrap_or_default());
    Some(Arc::new(client))
}
