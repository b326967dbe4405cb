use thiserror::Error;

use crate::state::Phase;

/// Errors emitted by the agent controller.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Raised when a start request is malformed or cannot be accepted.
    #[error("invalid task request: {0}")]
    InvalidRequest(String),

    /// A conduit to the page helper or panel failed in an unexpected way.
    #[error("port failure: {0}")]
    Port(String),

    /// A model call failed after the transport layer exhausted its retries.
    #[error("model call failed: {0}")]
    Model(String),

    /// The model produced output that could not be parsed for its mode.
    #[error("malformed model output: {0}")]
    MalformedOutput(String),

    /// A message arrived that is not legal in the current state.
    #[error("message not valid in state {state:?}: {message}")]
    InvalidState { state: Phase, message: String },

    /// A state transition not present in the transition table was attempted.
    #[error("illegal transition from {from:?} on {event}")]
    IllegalTransition { from: Phase, event: String },

    /// Raised when a configuration value cannot be used.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The active tab changed without an anticipated navigation.
    #[error("tab switched unexpectedly: {0}")]
    TabSwitched(String),

    /// A panel port was required but none is attached.
    #[error("panel port missing: {0}")]
    PanelMissing(String),

    /// Anything else that should abort the task.
    #[error("{0}")]
    Internal(String),
}

impl AgentError {
    /// Helper for wrapping request validation failures.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    /// Helper for model transport failures.
    pub fn model(message: impl Into<String>) -> Self {
        Self::Model(message.into())
    }

    /// Helper for unparseable model output.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedOutput(message.into())
    }

    /// Helper for internal failures.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}
