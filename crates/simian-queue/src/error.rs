//! Queue error types.

use thiserror::Error;

use simian_models::BatchId;

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Coordination store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Batch already exists: {0}")]
    BatchExists(BatchId),

    #[error("Batch initialization failed: {0}")]
    BatchInit(String),

    #[error("Batch not found: {0}")]
    BatchNotFound(BatchId),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Combination source failed: {0}")]
    Source(String),

    #[error("Corrupt store entry: {0}")]
    Corrupt(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl QueueError {
    pub fn store_unavailable(msg: impl Into<String>) -> Self {
        Self::StoreUnavailable(msg.into())
    }

    pub fn batch_init(msg: impl Into<String>) -> Self {
        Self::BatchInit(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }

    /// Infrastructure-level failure that a caller may retry with backoff.
    pub fn is_unavailable(&self) -> bool {
        match self {
            QueueError::StoreUnavailable(_) => true,
            QueueError::Redis(e) => {
                e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout()
            }
            _ => false,
        }
    }
}
