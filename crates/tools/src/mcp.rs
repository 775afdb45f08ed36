//! External tool-protocol (MCP) client over streamable HTTP.
//!
//! Each configured server gets one [`McpClient`]. The client performs the
//! `initialize` handshake lazily on first use, remembers the session id the
//! server hands out, and accepts either plain JSON or an SSE-framed body in
//! reply to every request.

use async_trait::async_trait;
use canopy_core::error::ToolError;
use canopy_core::tool::{McpServerConfig, Tool, ToolResult};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, trace, warn};

const PROTOCOL_VERSION: &str = "2025-03-26";
const SESSION_HEADER: &str = "mcp-session-id";
const MAX_TOOL_NAME: usize = 64;
const METHOD_NOT_FOUND: i64 = -32601;

#[derive(Debug, Clone, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    id: Option<serde_json::Value>,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Clone, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

/// A tool advertised by a server through `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpToolDef {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "empty_object_schema")]
    pub input_schema: serde_json::Value,
}

fn empty_object_schema() -> serde_json::Value {
    serde_json::json!({"type": "object", "properties": {}})
}

#[derive(Debug, Deserialize)]
struct ToolsListResult {
    #[serde(default)]
    tools: Vec<McpToolDef>,
}

pub struct McpClient {
    config: McpServerConfig,
    http: reqwest::Client,
    next_id: AtomicU64,
    session_id: RwLock<Option<String>>,
    initialized: OnceCell<()>,
}

impl McpClient {
    pub fn new(config: McpServerConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .unwrap_or_default();
        Self {
            config,
            http,
            next_id: AtomicU64::new(1),
            session_id: RwLock::new(None),
            initialized: OnceCell::new(),
        }
    }

    pub fn server_name(&self) -> &str {
        &self.config.name
    }

    async fn ensure_initialized(&self) -> Result<(), ToolError> {
        self.initialized
            .get_or_try_init(|| async {
                let params = serde_json::json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": { "name": "canopy", "version": env!("CARGO_PKG_VERSION") },
                });
                let result = self.request("initialize", Some(params)).await?;
                info!(
                    server = %self.config.name,
                    protocol = result["protocolVersion"].as_str().unwrap_or("unknown"),
                    "MCP server initialized"
                );
                self.notify("notifications/initialized").await;
                Ok::<(), ToolError>(())
            })
            .await
            .map(|_| ())
    }

    pub async fn list_tools(&self) -> Result<Vec<McpToolDef>, ToolError> {
        self.ensure_initialized().await?;
        match self.request("tools/list", None).await {
            Ok(result) => {
                let list: ToolsListResult =
                    serde_json::from_value(result).map_err(|e| self.failure(format!("unreadable tools/list result: {e}")))?;
                Ok(list.tools)
            }
            Err(ToolError::ExecutionFailed { reason, .. }) if reason.contains(&format!("code={METHOD_NOT_FOUND}")) => {
                info!(server = %self.config.name, "MCP server does not expose tools");
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    /// Call `tool_name` and return the raw `tools/call` result. A result
    /// flagged `isError` becomes an error carrying its text content.
    pub async fn call_tool(&self, tool_name: &str, arguments: serde_json::Value) -> Result<serde_json::Value, ToolError> {
        self.ensure_initialized().await?;
        let params = serde_json::json!({ "name": tool_name, "arguments": arguments });
        let result = self.request("tools/call", Some(params)).await?;
        if result["isError"].as_bool().unwrap_or(false) {
            let text = text_content(&result);
            return Err(self.failure(if text.is_empty() {
                format!("'{tool_name}' reported an error")
            } else {
                text
            }));
        }
        Ok(result)
    }

    async fn request(&self, method: &str, params: Option<serde_json::Value>) -> Result<serde_json::Value, ToolError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = JsonRpcRequest {
            jsonrpc: "2.0",
            id: Some(id),
            method,
            params,
        };
        debug!(server = %self.config.name, method, id, "MCP request");

        let response = self
            .post(&body)
            .send()
            .await
            .map_err(|e| self.failure(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ToolError::Upstream {
                status: status.as_u16(),
                body,
            });
        }
        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            if let Ok(mut slot) = self.session_id.write() {
                *slot = Some(session.to_string());
            }
        }
        let is_sse = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));
        let text = response.text().await.map_err(|e| self.failure(e.to_string()))?;

        let reply = if is_sse {
            find_sse_response(&text, id)
        } else {
            serde_json::from_str::<JsonRpcResponse>(&text).ok()
        }
        .ok_or_else(|| self.failure(format!("no JSON-RPC response to '{method}'")))?;

        if let Some(err) = reply.error {
            return Err(self.failure(format!("{method} failed: {} (code={})", err.message, err.code)));
        }
        Ok(reply.result.unwrap_or(serde_json::Value::Null))
    }

    async fn notify(&self, method: &str) {
        let body = JsonRpcRequest {
            jsonrpc: "2.0",
            id: None,
            method,
            params: None,
        };
        match self.post(&body).send().await {
            Ok(r) if r.status().is_success() => {}
            Ok(r) => warn!(server = %self.config.name, method, status = r.status().as_u16(), "MCP notification rejected"),
            Err(e) => warn!(server = %self.config.name, method, error = %e, "MCP notification failed"),
        }
    }

    fn post(&self, body: &JsonRpcRequest<'_>) -> reqwest::RequestBuilder {
        let mut req = self
            .http
            .post(&self.config.url)
            .header(reqwest::header::ACCEPT, "application/json, text/event-stream")
            .json(body);
        if let Some(token) = &self.config.token {
            req = req.bearer_auth(token);
        }
        if let Some(session) = self.session_id.read().ok().and_then(|s| (*s).clone()) {
            req = req.header(SESSION_HEADER, session);
        }
        req
    }

    fn failure(&self, reason: String) -> ToolError {
        ToolError::ExecutionFailed {
            tool_name: format!("mcp:{}", self.config.name),
            reason,
        }
    }
}

/// Pick the response with `id` out of an SSE body. Events that are not
/// JSON-RPC responses (server notifications, malformed data) are skipped.
fn find_sse_response(body: &str, id: u64) -> Option<JsonRpcResponse> {
    let mut data = String::new();
    let mut events = Vec::new();
    for line in body.lines().chain(std::iter::once("")) {
        if line.is_empty() {
            if !data.is_empty() {
                events.push(std::mem::take(&mut data));
            }
        } else if let Some(rest) = line.strip_prefix("data:") {
            if !data.is_empty() {
                data.push('\n');
            }
            data.push_str(rest.strip_prefix(' ').unwrap_or(rest));
        }
    }
    events.into_iter().find_map(|event| {
        let parsed: JsonRpcResponse = match serde_json::from_str(&event) {
            Ok(p) => p,
            Err(e) => {
                trace!(error = %e, "Skipping malformed MCP event");
                return None;
            }
        };
        let matches = parsed.id.as_ref().and_then(serde_json::Value::as_u64) == Some(id);
        matches.then_some(parsed)
    })
}

/// Text blocks of a `tools/call` result, newline-joined.
fn text_content(result: &serde_json::Value) -> String {
    result["content"]
        .as_array()
        .map(|blocks| {
            blocks
                .iter()
                .filter(|b| b["type"] == "text")
                .filter_map(|b| b["text"].as_str())
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default()
}

/// Registry name for a server tool: `mcp_<server>_<tool>` restricted to
/// characters model APIs accept in function names.
pub fn exposed_tool_name(server: &str, tool: &str) -> String {
    format!("mcp_{server}_{tool}")
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .take(MAX_TOOL_NAME)
        .collect()
}

/// One server tool exposed through the local [`Tool`] trait.
pub struct McpTool {
    client: Arc<McpClient>,
    remote_name: String,
    name: String,
    description: String,
    schema: serde_json::Value,
}

impl McpTool {
    pub fn new(client: Arc<McpClient>, def: McpToolDef) -> Self {
        let name = exposed_tool_name(client.server_name(), &def.name);
        let description = def
            .description
            .unwrap_or_else(|| format!("Tool '{}' from the {} server", def.name, client.server_name()));
        Self {
            client,
            remote_name: def.name,
            name,
            description,
            schema: def.input_schema,
        }
    }
}

#[async_trait]
impl Tool for McpTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> serde_json::Value {
        self.schema.clone()
    }

    async fn execute(&self, call_id: &str, arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
        let arguments = if arguments.is_null() {
            serde_json::json!({})
        } else {
            arguments
        };
        let result = self.client.call_tool(&self.remote_name, arguments).await?;
        let text = text_content(&result);
        let output = if text.is_empty() { result.to_string() } else { text };
        Ok(ToolResult::ok(call_id, output).with_data(result))
    }
}

/// Connect to every configured server and wrap its tools. A server that
/// cannot be reached is logged and skipped.
pub async fn discover_mcp_tools(servers: &[McpServerConfig]) -> Vec<Arc<dyn Tool>> {
    let mut tools: Vec<Arc<dyn Tool>> = Vec::new();
    for config in servers {
        let client = Arc::new(McpClient::new(config.clone()));
        match client.list_tools().await {
            Ok(defs) => {
                info!(server = %config.name, count = defs.len(), "Discovered MCP tools");
                tools.extend(
                    defs.into_iter()
                        .map(|def| Arc::new(McpTool::new(client.clone(), def)) as Arc<dyn Tool>),
                );
            }
            Err(e) => warn!(server = %config.name, error = %e, "Skipping unreachable MCP server"),
        }
    }
    tools
}
