//! Runtime error types.

use crate::config::ConfigError;
use rstchart_core::ChartError;
use rstchart_storage::StorageError;
use thiserror::Error;

/// Runtime errors.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("statechart error: {0}")]
    Chart(#[from] ChartError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("no model configured")]
    NoModel,

    #[error("checkpointing is disabled")]
    CheckpointDisabled,

    #[error("runner shut down")]
    ShuttingDown,
}

impl RuntimeError {
    pub fn error_code(&self) -> &'static str {
        match self {
            RuntimeError::Io(_) => "IO_ERROR",
            RuntimeError::Config(_) => "CONFIG_ERROR",
            RuntimeError::Chart(e) => e.error_code(),
            RuntimeError::Storage(_) => "STORAGE_ERROR",
            RuntimeError::NoModel => "NO_MODEL",
            RuntimeError::CheckpointDisabled => "CHECKPOINT_DISABLED",
            RuntimeError::ShuttingDown => "SHUTTING_DOWN",
        }
    }

    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            RuntimeError::Io(_) | RuntimeError::Storage(_) => true,
            RuntimeError::Chart(e) => e.is_retryable(),
            _ => false,
        }
    }
}
