//! Web search tool.
//!
//! The tool validates arguments and formats results; the network call is
//! behind [`SearchBackend`] so the provider can be swapped (or scripted in
//! tests). [`TavilyBackend`] is the built-in provider.

use async_trait::async_trait;
use canopy_core::error::ToolError;
use canopy_core::tool::{SearchSettings, Tool, ToolResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

pub const WEB_SEARCH: &str = "web_search";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    #[serde(default)]
    pub id: String,
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub snippet: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    /// Provider-written summary, when the provider offers one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    pub results: Vec<SearchHit>,
}

#[async_trait]
pub trait SearchBackend: Send + Sync {
    async fn search(&self, query: &str, max_results: usize, depth: &str) -> Result<SearchResponse, ToolError>;
}

pub struct TavilyBackend {
    api_key: String,
    endpoint: String,
    client: reqwest::Client,
}

impl TavilyBackend {
    pub fn new(api_key: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            api_key: api_key.into(),
            endpoint: "https://api.tavily.com/search".into(),
            client,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[derive(Debug, Deserialize)]
struct TavilyResponse {
    #[serde(default)]
    answer: Option<String>,
    #[serde(default)]
    results: Vec<TavilyResult>,
}

#[derive(Debug, Deserialize)]
struct TavilyResult {
    #[serde(default)]
    title: String,
    url: String,
    #[serde(default)]
    content: String,
}

impl From<TavilyResponse> for SearchResponse {
    fn from(r: TavilyResponse) -> Self {
        Self {
            answer: r.answer.filter(|a| !a.trim().is_empty()),
            results: r
                .results
                .into_iter()
                .enumerate()
                .map(|(i, h)| SearchHit {
                    id: format!("r{}", i + 1),
                    title: h.title,
                    url: h.url,
                    snippet: h.content,
                })
                .collect(),
        }
    }
}

#[async_trait]
impl SearchBackend for TavilyBackend {
    async fn search(&self, query: &str, max_results: usize, depth: &str) -> Result<SearchResponse, ToolError> {
        let body = serde_json::json!({
            "api_key": self.api_key,
            "query": query,
            "max_results": max_results,
            "search_depth": depth,
            "include_answer": true,
        });
        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| ToolError::ExecutionFailed {
                tool_name: WEB_SEARCH.into(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ToolError::Upstream {
                status: status.as_u16(),
                body,
            });
        }
        let parsed: TavilyResponse = response.json().await.map_err(|e| ToolError::ExecutionFailed {
            tool_name: WEB_SEARCH.into(),
            reason: format!("unreadable search response: {e}"),
        })?;
        Ok(parsed.into())
    }
}

pub struct WebSearchTool {
    backend: Arc<dyn SearchBackend>,
    settings: SearchSettings,
}

impl WebSearchTool {
    pub fn new(backend: Arc<dyn SearchBackend>, settings: SearchSettings) -> Self {
        Self { backend, settings }
    }

    /// A tool backed by the provider named in `settings`, or `None` when
    /// the provider is unknown or has no API key.
    pub fn from_settings(settings: &SearchSettings) -> Option<Self> {
        if settings.api_key.trim().is_empty() {
            return None;
        }
        let backend: Arc<dyn SearchBackend> = match settings.provider.as_str() {
            "tavily" => Arc::new(TavilyBackend::new(settings.api_key.clone())),
            _ => return None,
        };
        Some(Self::new(backend, settings.clone()))
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        WEB_SEARCH
    }

    fn description(&self) -> &str {
        "Search the web for current information. Returns a list of relevant results with titles, URLs, and snippets."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The search query"
                },
                "max_results": {
                    "type": "integer",
                    "description": "Number of results to return",
                    "minimum": 1
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, call_id: &str, arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
        let query = arguments["query"]
            .as_str()
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'query' argument".into()))?;

        let limit = self.settings.max_results.max(1);
        let max_results = arguments["max_results"]
            .as_u64()
            .map_or(limit, |n| (n as usize).clamp(1, limit));

        debug!(query, max_results, provider = %self.settings.provider, "Web search");
        let response = self
            .backend
            .search(query, max_results, &self.settings.depth)
            .await?;

        let sources: Vec<&str> = response.results.iter().map(|h| h.url.as_str()).collect();
        let data = serde_json::json!({
            "query": query,
            "answer": response.answer,
            "results": response.results,
            "sources": sources,
        });
        Ok(ToolResult::ok(call_id, format_results(&response)).with_data(data))
    }
}

fn format_results(response: &SearchResponse) -> String {
    let mut out = String::new();
    if let Some(answer) = &response.answer {
        out.push_str("Answer: ");
        out.push_str(answer.trim());
        out.push_str("\n\n");
    }
    if response.results.is_empty() {
        out.push_str("No results.");
        return out;
    }
    for (i, hit) in response.results.iter().enumerate() {
        out.push_str(&format!("{}. {}\n   {}\n", i + 1, hit.title, hit.url));
        if !hit.snippet.trim().is_empty() {
            out.push_str(&format!("   {}\n", hit.snippet.trim()));
        }
    }
    out.trim_end().to_string()
}
