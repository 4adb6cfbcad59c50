use thiserror::Error;

/// Typed error hierarchy for memodex.
///
/// Used at the public API boundary (service bind, indexing, search, queue
/// processing). Internal/leaf functions can use `anyhow::Result` — the
/// `Internal` variant allows seamless conversion via the `?` operator.
#[derive(Debug, Error)]
pub enum MemodexError {
    /// Invalid or incomplete configuration: unknown provider format,
    /// missing api_key, unknown service name, chunking budget exceeding
    /// the service's token limit. Raised at bind; not recoverable locally.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A caller-supplied value failed validation (dimension mismatch,
    /// out-of-range limit or score, conflicting vector spaces).
    #[error("Validation error: {0}")]
    Validation(String),

    /// The embedding provider failed (HTTP non-success or transport
    /// error). Surfaced through the queue retry policy.
    #[error("Provider error: {message}")]
    Provider { message: String, retryable: bool },

    /// Database I/O failure. Retried the same way provider errors are.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Refusing to delete a service that still owns data without `force`.
    #[error(
        "service {service} still has {embeddings} embeddings and {chunks} chunks; pass force to cascade"
    )]
    ServiceNotEmpty {
        service: String,
        embeddings: u64,
        chunks: u64,
    },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl MemodexError {
    /// Whether this error is transient and the queue should retry the item.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Provider { retryable, .. } => *retryable,
            Self::Storage(_) | Self::Internal(_) => true,
            Self::Config(_) | Self::Validation(_) | Self::ServiceNotEmpty { .. } => false,
        }
    }
}

impl From<rusqlite::Error> for MemodexError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MemodexError>;
