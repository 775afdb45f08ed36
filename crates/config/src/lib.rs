//! Configuration loading, validation, and management for Canopy.
//!
//! Loads configuration from `~/.canopy/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use canopy_core::tool::{CodeSettings, McpServerConfig, SearchSettings, ToolSettings};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.canopy/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// API key for the model endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// OpenAI-compatible base URL
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_model")]
    pub default_model: String,

    #[serde(default = "default_temperature")]
    pub default_temperature: f32,

    /// Default max tokens per model response
    #[serde(default = "default_max_tokens")]
    pub default_max_tokens: u32,

    /// SQLite database file. Defaults to `~/.canopy/canopy.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_path: Option<PathBuf>,

    #[serde(default)]
    pub context: ContextConfig,

    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub memory: MemoryConfig,

    #[serde(default)]
    pub tools: ToolsConfig,

    #[serde(default)]
    pub gateway: GatewayConfig,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_true() -> bool {
    true
}

fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("api_key", &redact(&self.api_key))
            .field("base_url", &self.base_url)
            .field("default_model", &self.default_model)
            .field("default_temperature", &self.default_temperature)
            .field("default_max_tokens", &self.default_max_tokens)
            .field("database_path", &self.database_path)
            .field("context", &self.context)
            .field("agent", &self.agent)
            .field("memory", &self.memory)
            .field("tools", &self.tools)
            .field("gateway", &self.gateway)
            .finish()
    }
}

/// Context box budget and tree layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Token budget for new context boxes
    #[serde(default = "default_box_tokens")]
    pub default_max_tokens: usize,

    /// Messages in the synthesized recent-messages block
    #[serde(default = "default_recent_messages")]
    pub recent_messages: usize,

    #[serde(default = "default_x_spacing")]
    pub x_spacing: f64,

    #[serde(default = "default_y_spacing")]
    pub y_spacing: f64,
}

fn default_box_tokens() -> usize {
    8192
}
fn default_recent_messages() -> usize {
    12
}
fn default_x_spacing() -> f64 {
    300.0
}
fn default_y_spacing() -> f64 {
    150.0
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            default_max_tokens: default_box_tokens(),
            recent_messages: default_recent_messages(),
            x_spacing: default_x_spacing(),
            y_spacing: default_y_spacing(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Remote agent step endpoint (`.../api/agent`). When unset the loop
    /// talks to the model endpoint in-process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_url: Option<String>,

    #[serde(default = "default_max_steps")]
    pub max_steps: usize,

    #[serde(default = "default_true")]
    pub stream: bool,
}

fn default_max_steps() -> usize {
    8
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            endpoint_url: None,
            max_steps: default_max_steps(),
            stream: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,

    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Cap on auto-retrieved memories injected per thread
    #[serde(default = "default_max_auto_inject")]
    pub max_auto_inject: usize,

    /// Cap on pinned memories injected per thread
    #[serde(default = "default_max_pinned_inject")]
    pub max_pinned_inject: usize,

    /// Extract memories from finished turns in the background
    #[serde(default = "default_true")]
    pub auto_write: bool,

    /// Both sides of a turn must be at least this long to qualify
    #[serde(default = "default_min_turn_chars")]
    pub min_turn_chars_for_write: usize,
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".into()
}
fn default_top_k() -> usize {
    8
}
fn default_max_auto_inject() -> usize {
    8
}
fn default_max_pinned_inject() -> usize {
    16
}
fn default_min_turn_chars() -> usize {
    40
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            embedding_model: default_embedding_model(),
            top_k: default_top_k(),
            max_auto_inject: default_max_auto_inject(),
            max_pinned_inject: default_max_pinned_inject(),
            auto_write: true,
            min_turn_chars_for_write: default_min_turn_chars(),
        }
    }
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default)]
    pub search: SearchConfig,

    #[serde(default)]
    pub code: CodeConfig,

    #[serde(default)]
    pub mcp_servers: Vec<McpServerEntry>,
}

impl std::fmt::Debug for ToolsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolsConfig")
            .field("search", &self.search)
            .field("code", &self.code)
            .field(
                "mcp_servers",
                &self.mcp_servers.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_search_provider")]
    pub provider: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_max_results")]
    pub max_results: usize,

    /// "basic" or "advanced"
    #[serde(default = "default_depth")]
    pub depth: String,
}

fn default_search_provider() -> String {
    "tavily".into()
}
fn default_max_results() -> usize {
    5
}
fn default_depth() -> String {
    "basic".into()
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            provider: default_search_provider(),
            api_key: None,
            max_results: default_max_results(),
            depth: default_depth(),
        }
    }
}

impl std::fmt::Debug for SearchConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchConfig")
            .field("provider", &self.provider)
            .field("api_key", &redact(&self.api_key))
            .field("max_results", &self.max_results)
            .field("depth", &self.depth)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeConfig {
    /// Interpreter the code is piped into
    #[serde(default = "default_code_command")]
    pub command: String,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_max_output_chars")]
    pub max_output_chars: usize,
}

fn default_code_command() -> String {
    "python3".into()
}
fn default_timeout_ms() -> u64 {
    10_000
}
fn default_max_output_chars() -> usize {
    20_000
}

impl Default for CodeConfig {
    fn default() -> Self {
        Self {
            command: default_code_command(),
            timeout_ms: default_timeout_ms(),
            max_output_chars: default_max_output_chars(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct McpServerEntry {
    pub name: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_host")]
    pub host: String,
}

fn default_port() -> u16 {
    42618
}
fn default_host() -> String {
    "127.0.0.1".into()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.canopy/config.toml).
    ///
    /// Environment overrides:
    /// - `CANOPY_API_KEY` (highest priority), then `OPENAI_API_KEY`
    /// - `CANOPY_BASE_URL`, `CANOPY_MODEL`, `CANOPY_DB`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides using `lookup` to read variables.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(key) = non_empty("CANOPY_API_KEY") {
            self.api_key = Some(key);
        } else if self.api_key.is_none() {
            self.api_key = non_empty("OPENAI_API_KEY");
        }
        if let Some(url) = non_empty("CANOPY_BASE_URL") {
            self.base_url = url;
        }
        if let Some(model) = non_empty("CANOPY_MODEL") {
            self.default_model = model;
        }
        if let Some(db) = non_empty("CANOPY_DB") {
            self.database_path = Some(PathBuf::from(db));
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".canopy")
    }

    /// Resolved database file path.
    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| Self::config_dir().join("canopy.db"))
    }

    /// SQLite connection URL for the store.
    pub fn database_url(&self) -> String {
        format!("sqlite://{}", self.database_path().display())
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.default_temperature) {
            return Err(ConfigError::ValidationError(
                "default_temperature must be between 0.0 and 2.0".into(),
            ));
        }
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(ConfigError::ValidationError(format!(
                "base_url must be an http(s) URL, got '{}'",
                self.base_url
            )));
        }
        if self.context.x_spacing <= 0.0 || self.context.y_spacing <= 0.0 {
            return Err(ConfigError::ValidationError(
                "context.x_spacing and context.y_spacing must be > 0".into(),
            ));
        }
        if self.context.default_max_tokens == 0 {
            return Err(ConfigError::ValidationError(
                "context.default_max_tokens must be > 0".into(),
            ));
        }
        if self.agent.max_steps == 0 {
            return Err(ConfigError::ValidationError("agent.max_steps must be >= 1".into()));
        }
        if self.memory.top_k == 0 {
            return Err(ConfigError::ValidationError("memory.top_k must be >= 1".into()));
        }
        if self.tools.code.timeout_ms == 0 || self.tools.code.max_output_chars == 0 {
            return Err(ConfigError::ValidationError(
                "tools.code.timeout_ms and tools.code.max_output_chars must be > 0".into(),
            ));
        }
        let mut names: Vec<&str> = Vec::new();
        for server in &self.tools.mcp_servers {
            if server.name.trim().is_empty() {
                return Err(ConfigError::ValidationError("mcp server name must not be empty".into()));
            }
            if names.contains(&server.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate mcp server name '{}'",
                    server.name
                )));
            }
            names.push(&server.name);
        }
        Ok(())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// Tool collaborator settings derived from `[tools]`.
    pub fn tool_settings(&self) -> ToolSettings {
        ToolSettings {
            search: SearchSettings {
                provider: self.tools.search.provider.clone(),
                api_key: self.tools.search.api_key.clone().unwrap_or_default(),
                max_results: self.tools.search.max_results,
                depth: self.tools.search.depth.clone(),
            },
            code: CodeSettings {
                command: self.tools.code.command.clone(),
                timeout_ms: self.tools.code.timeout_ms,
                max_output_chars: self.tools.code.max_output_chars,
            },
            mcp_servers: self
                .tools
                .mcp_servers
                .iter()
                .map(|s| McpServerConfig {
                    name: s.name.clone(),
                    url: s.url.clone(),
                    token: s.token.clone(),
                })
                .collect(),
        }
    }

    /// Generate a default config TOML string (for `init`).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }

    /// Write the default config to `path` unless a file is already there.
    /// Returns whether a file was written.
    pub fn write_default(path: &Path) -> Result<bool, ConfigError> {
        if path.exists() {
            return Ok(false);
        }
        let write_err = |e: std::io::Error| ConfigError::WriteError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        };
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(write_err)?;
        }
        std::fs::write(path, Self::default_toml()).map_err(write_err)?;
        tracing::info!("Wrote default config to {}", path.display());
        Ok(true)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_base_url(),
            default_model: default_model(),
            default_temperature: default_temperature(),
            default_max_tokens: default_max_tokens(),
            database_path: None,
            context: ContextConfig::default(),
            agent: AgentConfig::default(),
            memory: MemoryConfig::default(),
            tools: ToolsConfig::default(),
            gateway: GatewayConfig::default(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Failed to write config file at {path}: {reason}")]
    WriteError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

impl From<ConfigError> for canopy_core::Error {
    fn from(err: ConfigError) -> Self {
        canopy_core::Error::Config {
            message: err.to_string(),
        }
    }
}
