//! Agent-level errors.

use canopy_core::error::ProviderError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("A prompt optimization is already running")]
    AlreadyRunning,

    #[error("Turn aborted before step {step}")]
    Aborted { step: usize },

    #[error("Invalid turn: {0}")]
    Invalid(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Core(#[from] canopy_core::Error),
}

/// A turn that did not produce an assistant node.
///
/// When the user node was already persisted its id is kept here, so callers
/// can show the failure against it instead of treating the turn as an
/// empty answer.
#[derive(Debug, Error)]
#[error("Turn failed: {source}")]
pub struct TurnFailure {
    pub user_node_id: Option<String>,
    pub source: AgentError,
}

impl TurnFailure {
    pub fn before_persist(source: impl Into<AgentError>) -> Self {
        Self {
            user_node_id: None,
            source: source.into(),
        }
    }

    pub fn after_persist(user_node_id: impl Into<String>, source: impl Into<AgentError>) -> Self {
        Self {
            user_node_id: Some(user_node_id.into()),
            source: source.into(),
        }
    }
}

impl From<AgentError> for canopy_core::Error {
    fn from(err: AgentError) -> Self {
        match err {
            AgentError::Core(e) => e,
            AgentError::Provider(e) => canopy_core::Error::Provider(e),
            AgentError::Invalid(msg) => canopy_core::Error::Validation(msg),
            other => canopy_core::Error::Internal(other.to_string()),
        }
    }
}
