//! Error types for huddle-canvas
//!
//! Every failure the collaboration pipeline can surface to a participant is a
//! variant here. Variants carry a stable protocol code so clients can react
//! without parsing messages.

use thiserror::Error;

/// Canvas collaboration error type
#[derive(Debug, Error)]
pub enum Error {
    /// Session not found (never created, ended, or evicted)
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Participant is not part of the session
    #[error("participant not found: {0}")]
    ParticipantNotFound(String),

    /// Canvas not found
    #[error("canvas not found: {0}")]
    CanvasNotFound(String),

    /// Element not found on the canvas
    #[error("element not found: {0}")]
    ElementNotFound(String),

    /// Element id already present on the canvas
    #[error("element already exists: {0}")]
    ElementExists(String),

    /// Lifecycle transition not allowed from the current state
    #[error("invalid session transition from {from} to {to}")]
    InvalidTransition {
        /// Current status
        from: String,
        /// Requested status
        to: String,
    },

    /// Session is paused and rejects canvas updates
    #[error("session paused: {0}")]
    SessionPaused(String),

    /// Session reached its participant limit
    #[error("session full: {0}")]
    SessionFull(String),

    /// Registry reached its session limit
    #[error("maximum sessions exceeded ({0})")]
    MaxSessionsExceeded(usize),

    /// Connection has not joined a session
    #[error("connection has not joined a session")]
    NotJoined,

    /// Permission denied
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Malformed canvas update, rejected at ingress
    #[error("invalid update: {0}")]
    InvalidUpdate(String),

    /// Invalid message format
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Batch for this session is closed
    #[error("batch closed for session: {0}")]
    BatchClosed(String),

    /// Persistence collaborator failure
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// WebSocket error
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// Suggestion advisor failure
    #[error("advisor error: {0}")]
    Advisor(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a persistence error
    #[must_use]
    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }

    /// Create an invalid update error
    #[must_use]
    pub fn invalid_update(msg: impl Into<String>) -> Self {
        Self::InvalidUpdate(msg.into())
    }

    /// Create an invalid message error
    #[must_use]
    pub fn invalid_message(msg: impl Into<String>) -> Self {
        Self::InvalidMessage(msg.into())
    }

    /// Create an advisor error
    #[must_use]
    pub fn advisor(msg: impl Into<String>) -> Self {
        Self::Advisor(msg.into())
    }

    /// Check if error is recoverable by retrying
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Persistence(_) | Self::WebSocket(_) | Self::Advisor(_)
        )
    }

    /// Check if error is a not-found condition
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::SessionNotFound(_)
                | Self::ParticipantNotFound(_)
                | Self::CanvasNotFound(_)
                | Self::ElementNotFound(_)
        )
    }

    /// Get error code for protocol messages
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::SessionNotFound(_) => "session_not_found",
            Self::ParticipantNotFound(_) => "participant_not_found",
            Self::CanvasNotFound(_) => "canvas_not_found",
            Self::ElementNotFound(_) => "element_not_found",
            Self::ElementExists(_) => "element_exists",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::SessionPaused(_) => "session_paused",
            Self::SessionFull(_) => "session_full",
            Self::MaxSessionsExceeded(_) => "max_sessions_exceeded",
            Self::NotJoined => "not_joined",
            Self::PermissionDenied(_) => "permission_denied",
            Self::InvalidUpdate(_) => "invalid_update",
            Self::InvalidMessage(_) => "invalid_message",
            Self::BatchClosed(_) => "batch_closed",
            Self::Persistence(_) => "persistence_error",
            Self::Serialization(_) => "serialization_error",
            Self::WebSocket(_) => "websocket_error",
            Self::Advisor(_) => "advisor_error",
            Self::Internal(_) => "internal_error",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}

impl From<axum::Error> for Error {
    fn from(err: axum::Error) -> Self {
        Self::WebSocket(err.to_string())
    }
}

/// Result type alias for canvas collaboration operations
pub type Result<T> = std::result::Result<T, Error>;
