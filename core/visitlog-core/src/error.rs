//! Error types for visitlog-core operations.
//! Wire codes returned by `VisitError::code` are part of the IPC contract; keep them stable.

use std::path::PathBuf;

/// All errors that can occur in engine operations.
#[derive(Debug, thiserror::Error)]
pub enum VisitError {
    // ─────────────────────────────────────────────────────────────────────
    // Caller Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Not authenticated")]
    Unauthenticated,

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Session already closed: {0}")]
    SessionClosed(String),

    // ─────────────────────────────────────────────────────────────────────
    // Store Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Another open session already exists for client {client}")]
    Conflict { client: String },

    // ─────────────────────────────────────────────────────────────────────
    // Hand-off Errors
    // ─────────────────────────────────────────────────────────────────────
    /// The session was closed, but the transcript never reached the send channel.
    #[error("Session {session_id} closed but transcript hand-off failed: {reason}")]
    HandOffFailed { session_id: String, reason: String },

    // ─────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Configuration file malformed: {path}: {details}")]
    ConfigMalformed { path: PathBuf, details: String },

    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl VisitError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        VisitError::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        VisitError::Validation(message.into())
    }

    /// Stable snake_case code used in daemon error responses.
    pub fn code(&self) -> &'static str {
        match self {
            VisitError::Unauthenticated => "unauthenticated",
            VisitError::NotFound { .. } => "not_found",
            VisitError::Validation(_) => "validation_error",
            VisitError::SessionClosed(_) => "session_closed",
            VisitError::StoreUnavailable(_) => "store_unavailable",
            VisitError::Conflict { .. } => "conflict",
            VisitError::HandOffFailed { .. } => "hand_off_failed",
            VisitError::ConfigMalformed { .. } => "config_malformed",
            VisitError::Io { .. } => "io_error",
        }
    }

    /// Whether re-running the whole operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            VisitError::StoreUnavailable(_) | VisitError::Conflict { .. }
        )
    }
}

/// Convenience type alias for Results using VisitError.
pub type Result<T> = std::result::Result<T, VisitError>;

impl From<VisitError> for String {
    fn from(err: VisitError) -> String {
        err.to_string()
    }
}
