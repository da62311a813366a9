//! Upload sink interface.

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use crate::error::{StorageError, StorageResult};

/// Receipt for a stored artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadConfirmation {
    /// Destination key
    pub key: String,
    /// Stored size in bytes
    pub bytes: u64,
    /// Lowercase hex SHA-256 of the stored content
    pub sha256: String,
}

/// Durable destination for rendered artifacts.
///
/// Uploading the same content to the same key twice must leave the
/// destination in the same state as uploading it once.
#[async_trait]
pub trait UploadSink: Send + Sync {
    async fn upload(&self, path: &Path, key: &str) -> StorageResult<UploadConfirmation>;
}

/// Reject keys that are empty, absolute or escape their prefix.
pub fn validate_key(key: &str) -> StorageResult<()> {
    if key.is_empty() || key.starts_with('/') || key.contains('\\') {
        return Err(StorageError::invalid_key(key));
    }
    if key.split('/').any(|segment| segment.is_empty() || segment == "." || segment == "..") {
        return Err(StorageError::invalid_key(key));
    }
    Ok(())
}

/// Size and SHA-256 of a local file.
pub async fn digest_file(path: &Path) -> StorageResult<(u64, String)> {
    let mut file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(StorageError::SourceMissing(path.to_path_buf()))
        }
        Err(e) => return Err(e.into()),
    };

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }

    Ok((total, format!("{:x}", hasher.finalize())))
}
