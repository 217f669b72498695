//! Storage error types.

use thiserror::Error;

/// Errors from the checkpoint store.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("checkpoint not found: {0}")]
    CheckpointNotFound(String),

    #[error("data corruption: {0}")]
    Corruption(String),
}
