//! Artifact upload sinks.
//!
//! This crate provides:
//! - The `UploadSink` trait workers upload rendered videos through
//! - Cloudflare R2 uploads via the S3 API
//! - A local-directory sink for single-host runs and tests

use std::sync::Arc;

pub mod client;
pub mod error;
pub mod local;
pub mod sink;

pub use client::{R2Config, R2Sink, VIDEO_CONTENT_TYPE};
pub use error::{StorageError, StorageResult};
pub use local::LocalDirSink;
pub use sink::{digest_file, validate_key, UploadConfirmation, UploadSink};

/// Build the sink selected by the environment.
///
/// `SIMIAN_UPLOAD_DIR` selects a local directory; otherwise R2 credentials
/// are required.
pub fn sink_from_env() -> StorageResult<Arc<dyn UploadSink>> {
    match std::env::var("SIMIAN_UPLOAD_DIR") {
        Ok(dir) if !dir.is_empty() => Ok(Arc::new(LocalDirSink::new(dir))),
        _ => Ok(Arc::new(R2Sink::from_env()?)),
    }
}
