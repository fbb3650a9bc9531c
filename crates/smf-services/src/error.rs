//! Error types for the store, index and backend seams.

use smf_core::CodecError;

/// A database or cache operation failed.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{operation} failed: {message}")]
pub struct BackendError {
    pub operation: &'static str,
    pub message: String,
}

impl BackendError {
    pub fn new(operation: &'static str, message: impl Into<String>) -> Self {
        Self {
            operation,
            message: message.into(),
        }
    }
}

/// Error surface of the context store, identifier index and repository.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Key absent. Expected, not exceptional.
    #[error("{0} not found")]
    NotFound(String),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(#[from] BackendError),

    /// Stored record could not be decoded, or a context could not be encoded.
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("scaling is enabled but no cache backend was provided")]
    MissingCache,

    #[error("write-behind pipeline is shut down")]
    PipelineClosed,
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
