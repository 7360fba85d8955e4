//! Infrastructure-level errors.
//!
//! Tool failures never show up here: they are turned into observations inside
//! the controller. [`AgentError`] covers the failures that end a turn early
//! or that a caller has to react to (model outage, persistence, resume of an
//! unknown session, configuration).

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    /// The language-model collaborator failed after its own retry policy.
    #[error("model call failed: {0}")]
    Model(String),

    #[error("embedding call failed: {0}")]
    Embedding(String),

    #[error("persistence failed: {0}")]
    Persistence(String),

    #[error("no checkpoint found for session '{0}'")]
    CheckpointNotFound(String),

    #[error("invalid session id '{0}'")]
    InvalidSessionId(String),

    #[error("unknown mode '{0}'")]
    UnknownMode(String),

    #[error("turn cancelled at step {step}")]
    Cancelled { step: u32 },

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

impl From<config::ConfigError> for AgentError {
    fn from(e: config::ConfigError) -> Self {
        AgentError::Config(e.to_string())
    }
}

impl AgentError {
    /// Whether the error came from the model or embedding provider rather
    /// than from local state.
    pub fn is_provider_failure(&self) -> bool {
        matches!(self, AgentError::Model(_) | AgentError::Embedding(_))
    }
}
