//! Error types for the Canopy domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.

use thiserror::Error;

/// The top-level error type for all Canopy operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Persistence ---
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    // --- Model endpoint errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Memory bank errors ---
    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    // --- Tool errors ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Request validation ---
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to open store: {0}")]
    Open(String),

    #[error("Migration to schema v{version} failed: {reason}")]
    Migration { version: i64, reason: String },

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Transaction aborted: {0}")]
    Transaction(String),

    #[error("Parent node not found: {0}")]
    MissingParent(String),

    #[error("Corrupt record in {collection}: {reason}")]
    Corrupt {
        collection: &'static str,
        reason: String,
    },
}

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// Non-2xx from the upstream model API, surfaced verbatim.
    #[error("Upstream returned {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Network error: {0}")]
    Network(String),
}

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Embedding generation failed: {0}")]
    EmbeddingFailed(String),

    #[error("Memory item not found: {0}")]
    NotFound(String),

    #[error("Invalid memory item: {0}")]
    Invalid(String),
}

impl From<StoreError> for MemoryError {
    fn from(err: StoreError) -> Self {
        Self::Storage(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Tool execution failed: {tool_name}: {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("Tool upstream returned {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("Tool not configured: {0}")]
    NotConfigured(String),

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_error_keeps_status_and_body() {
        let err = Error::Provider(ProviderError::Upstream {
            status: 502,
            body: "bad gateway".into(),
        });
        assert!(err.to_string().contains("502"));
        assert!(err.to_string().contains("bad gateway"));
    }

    #[test]
    fn not_found_names_the_kind() {
        let err = Error::not_found("Node", "n-1");
        assert_eq!(err.to_string(), "Node not found: n-1");
    }

    #[test]
    fn store_error_converts_into_memory_error() {
        let err: MemoryError = StoreError::Query("disk full".into()).into();
        assert!(matches!(err, MemoryError::Storage(msg) if msg.contains("disk full")));
    }
}
