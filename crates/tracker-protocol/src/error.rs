//! Error types for tracker operations.

use thiserror::Error;

/// Errors surfaced by event construction and tracker store operations.
///
/// Every variant is scoped to a single conversation and request; none of them
/// is fatal to the process.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("unknown event kind: {0}")]
    UnknownEventKind(String),
    #[error("invalid event parameters: {0}")]
    InvalidEventParams(String),
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("conversation not found: {0}")]
    NotFound(String),
    #[error("invalid conversation id: {0}")]
    InvalidConversationId(String),
}

impl TrackerError {
    pub fn persistence(error: impl std::fmt::Display) -> Self {
        Self::Persistence(error.to_string())
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::InvalidEventParams(message.into())
    }

    /// True for errors caused by the caller's payload rather than the backend.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::UnknownEventKind(_) | Self::InvalidEventParams(_) | Self::InvalidConversationId(_)
        )
    }
}

/// Convenience result type for tracker operations.
pub type TrackerResult<T> = Result<T, TrackerError>;
