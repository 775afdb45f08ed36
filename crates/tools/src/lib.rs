//! Tool collaborators for the agent loop.
//!
//! Three kinds of tool are built in: web search, code execution, and tools
//! discovered on external MCP servers. [`build_registry`] assembles whatever
//! the current [`ToolSettings`] make available.

pub mod code_exec;
pub mod mcp;
pub mod web_search;

use std::sync::Arc;

use canopy_core::tool::{ToolRegistry, ToolSettings};
use tracing::info;

pub use code_exec::{CODE_EXEC, CodeExecTool, ExecReport};
pub use mcp::{McpClient, McpTool, McpToolDef, discover_mcp_tools, exposed_tool_name};
pub use web_search::{SearchBackend, SearchHit, SearchResponse, TavilyBackend, WEB_SEARCH, WebSearchTool};

/// Build a registry from per-turn tool settings.
///
/// Web search is left out without an API key. MCP servers are contacted
/// here; an unreachable server contributes no tools.
pub async fn build_registry(settings: &ToolSettings) -> ToolRegistry {
    let mut registry = ToolRegistry::new();

    match WebSearchTool::from_settings(&settings.search) {
        Some(tool) => registry.register(Arc::new(tool)),
        None => info!(provider = %settings.search.provider, "Web search disabled: no usable provider key"),
    }
    registry.register(Arc::new(CodeExecTool::new(settings.code.clone())));

    for tool in discover_mcp_tools(&settings.mcp_servers).await {
        registry.register(tool);
    }
    registry
}
