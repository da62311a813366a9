//! Error types for render operations.

use std::path::PathBuf;
use thiserror::Error;

/// Result type for render operations.
pub type RenderResult<T> = Result<T, RenderError>;

/// Errors that can occur while rendering a combination.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Render program not found: {0}")]
    ProgramNotFound(String),

    #[error("Render command failed: {message}")]
    Failed {
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    #[error("Render produced no output at {0}")]
    OutputMissing(PathBuf),

    #[error("Invalid combination parameters: {0}")]
    InvalidParameters(String),

    #[error("Render timed out after {0} seconds")]
    Timeout(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RenderError {
    /// Create a command failure error.
    pub fn failed(message: impl Into<String>, stderr: Option<String>, exit_code: Option<i32>) -> Self {
        Self::Failed {
            message: message.into(),
            stderr,
            exit_code,
        }
    }

    /// Create an invalid parameters error.
    pub fn invalid_parameters(message: impl Into<String>) -> Self {
        Self::InvalidParameters(message.into())
    }
}
