//! HTTP gateway for Canopy.
//!
//! Serves the two model-facing endpoints the turn engine can talk to over
//! the network, plus a health check:
//!
//! - `POST /api/chat` - one chat completion, answered as `{content}`
//! - `POST /api/agent` - one agent step, streamed as SSE step events or
//!   answered as `{content, toolCalls}` when streaming is off
//! - `GET  /health`
//!
//! Built on Axum.

pub mod api;

use axum::extract::DefaultBodyLimit;
use axum::{
    Router,
    response::Json,
    routing::{get, post},
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

use canopy_config::AppConfig;
use canopy_core::provider::ModelEndpoint;
use canopy_core::tool::ToolRegistry;
use canopy_providers::OpenAiCompatClient;

/// Request bodies carry whole conversations, occasionally with images.
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Shared state for the gateway.
pub struct GatewayState {
    /// Where requests are forwarded.
    pub upstream: Arc<dyn ModelEndpoint>,
    /// Catalog used when an agent request lists tools without definitions.
    pub tools: Arc<ToolRegistry>,
}

pub type SharedState = Arc<GatewayState>;

impl GatewayState {
    pub fn new(upstream: Arc<dyn ModelEndpoint>, tools: Arc<ToolRegistry>) -> Self {
        Self { upstream, tools }
    }
}

/// Build the router with every gateway route.
pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/chat", post(api::chat_handler))
        .route("/api/agent", post(api::agent_handler))
        .with_state(state)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(CorsLayer::permissive())
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

/// Start the gateway HTTP server.
pub async fn start(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);

    let tools = canopy_tools::build_registry(&config.tool_settings()).await;
    info!(tools = ?tools.names(), "Tool catalog ready");
    let state = Arc::new(GatewayState::new(
        Arc::new(OpenAiCompatClient::default()),
        Arc::new(tools),
    ));

    let app = build_router(state);
    info!(addr = %addr, "Gateway starting");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}
