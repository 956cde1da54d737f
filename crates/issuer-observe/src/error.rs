//! Error types for the event log.

use issuer_types::ErrorKind;

/// Errors that can occur during event log operations.
#[derive(Debug, thiserror::Error)]
pub enum ObserveError {
    /// A database operation failed.
    #[error("event log database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// JSON serialization or deserialization failed.
    #[error("event log serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ObserveError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::BackendError
    }
}
