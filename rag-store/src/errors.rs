//! Unified error types for the crate.

use thiserror::Error;

/// Top-level error for rag-store operations.
#[derive(Debug, Error)]
pub enum RagError {
    /// I/O or filesystem errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing / serialization errors.
    #[error("parse error: {0}")]
    Parse(String),

    /// Invalid or unsupported configuration. Fatal at startup.
    #[error("config error: {0}")]
    Config(String),

    /// Mismatch between a vector and the index dimension.
    #[error("vector size mismatch: got {got}, want {want}")]
    VectorSizeMismatch { got: usize, want: usize },

    /// Embedding service could not produce vectors, retries exhausted.
    #[error("embedding unavailable after {attempts} attempt(s): {reason}")]
    EmbeddingUnavailable { attempts: u32, reason: String },

    /// Transient embedding provider failure (network, 5xx, timeout).
    #[error("embedding provider error: {0}")]
    Provider(String),

    /// Backing store unreachable or failed the request.
    #[error("index unavailable: {0}")]
    IndexUnavailable(String),

    /// Caller passed an argument outside the accepted domain.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl RagError {
    /// Whether the same call may succeed if repeated.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RagError::Provider(_) | RagError::IndexUnavailable(_))
    }
}

impl From<serde_json::Error> for RagError {
    fn from(e: serde_json::Error) -> Self {
        RagError::Parse(e.to_string())
    }
}

impl From<qdrant_client::QdrantError> for RagError {
    fn from(e: qdrant_client::QdrantError) -> Self {
        RagError::IndexUnavailable(e.to_string())
    }
}
