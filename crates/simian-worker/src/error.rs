//! Worker error types.

use thiserror::Error;

use simian_render::RenderError;
use simian_storage::StorageError;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Queue error: {0}")]
    Queue(#[from] simian_queue::QueueError),

    #[error("Render error: {0}")]
    Render(#[from] RenderError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }
}

/// Why a render cycle did not end in an acknowledgment.
#[derive(Debug, Clone, Error)]
pub enum CycleFailure {
    /// Render failed in a way another attempt may fix
    #[error("render failed: {0}")]
    TransientRender(String),

    /// Upload failed in a way another attempt may fix
    #[error("upload failed: {0}")]
    TransientUpload(String),

    /// The lease expired or was reassigned; the result is discarded
    #[error("lease lost")]
    LeaseLost,

    /// The coordination store could not be reached
    #[error("coordination store unavailable: {0}")]
    StoreUnavailable(String),
}

impl CycleFailure {
    /// Every render error spends one attempt; the retry budget bounds
    /// combinations that can never render.
    pub fn from_render(error: &RenderError) -> Self {
        Self::TransientRender(error.to_string())
    }

    pub fn from_upload(error: &StorageError) -> Self {
        Self::TransientUpload(error.to_string())
    }

    /// Release back to pending, spending one attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientRender(_) | Self::TransientUpload(_))
    }

    /// Metric label.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TransientRender(_) => "transient_render",
            Self::TransientUpload(_) => "transient_upload",
            Self::LeaseLost => "lease_lost",
            Self::StoreUnavailable(_) => "store_unavailable",
        }
    }
}
