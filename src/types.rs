//! Shared error types for indexing, storage, and retrieval.

use thiserror::Error;

/// Errors surfaced by treedex operations.
///
/// Soft-failure paths (document deletion, store statistics) never return this
/// type; they log the fault and fall back to zero values instead.
#[derive(Debug, Error)]
pub enum TreedexError {
    /// Embedding endpoint failure after retries were exhausted, or a malformed
    /// embedding response.
    #[error("embedding error: {0}")]
    Embedding(String),

    /// Vector-store failure on an add or search path.
    #[error("storage error: {0}")]
    Storage(String),

    /// Malformed outline input, e.g. duplicate structure codes.
    #[error("invalid outline structure: {0}")]
    Structure(String),

    /// A generated identifier would exceed its fixed-width format.
    #[error("identifier space exhausted: {0}")]
    IdSpace(String),

    /// Filesystem failure while preparing a collection location.
    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TreedexError {
    fn from(err: std::io::Error) -> Self {
        TreedexError::Io(err.to_string())
    }
}

impl From<reqwest::Error> for TreedexError {
    fn from(err: reqwest::Error) -> Self {
        TreedexError::Embedding(err.to_string())
    }
}
