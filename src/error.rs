//! Error types for Strata

use thiserror::Error;

/// Main error type for the memory engine
#[derive(Error, Debug)]
pub enum MemoryError {
    /// A `remember` request was rejected before touching any store
    #[error("Invalid memory request: {0}")]
    InvalidMemoryRequest(String),

    /// Owner has not been registered with the orchestrator
    #[error("Unknown owner: {0}")]
    UnknownOwner(String),

    /// Item does not fit a tier's byte budget even with the tier emptied
    #[error("Oversized item: {size} bytes exceeds tier budget of {budget} bytes")]
    OversizedItem { size: usize, budget: usize },

    /// Memory not found
    #[error("Memory not found: {0}")]
    NotFound(String),

    /// Database operation failed
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration failed
    #[error("Migration error: {0}")]
    Migration(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Cache envelope could not be encoded or decoded
    #[error("Codec error: {0}")]
    Codec(String),

    /// A slower cache level failed
    #[error("Cache backend error: {0}")]
    CacheBackend(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Background work was cancelled before it finished
    #[error("Operation cancelled")]
    Cancelled,

    /// Maintenance worker is gone or its queue is closed
    #[error("Worker unavailable: {0}")]
    WorkerUnavailable(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other errors
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl From<serde_json::Error> for MemoryError {
    fn from(e: serde_json::Error) -> Self {
        MemoryError::Serialization(e.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, MemoryError>;
