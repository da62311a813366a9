//! Upload sink writing into a local (or mounted) directory.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::{debug, info};

use crate::error::{StorageError, StorageResult};
use crate::sink::{digest_file, validate_key, UploadConfirmation, UploadSink};

/// Stores artifacts under `root/<key>`.
///
/// Content is copied to a temporary file beside the destination and renamed
/// into place, so readers never observe a partial artifact and repeated
/// uploads of the same key simply replace it.
#[derive(Debug, Clone)]
pub struct LocalDirSink {
    root: PathBuf,
}

impl LocalDirSink {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Destination path for `key`.
    pub fn path_for(&self, key: &str) -> StorageResult<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl UploadSink for LocalDirSink {
    async fn upload(&self, path: &Path, key: &str) -> StorageResult<UploadConfirmation> {
        let dst = self.path_for(key)?;
        let (bytes, sha256) = digest_file(path).await?;

        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Same directory as dst keeps the rename on one filesystem
        let tmp = dst.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
        debug!("Copying {} to {}", path.display(), tmp.display());

        if let Err(e) = fs::copy(path, &tmp).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(StorageError::upload_failed(format!(
                "copy to {} failed: {}",
                tmp.display(),
                e
            )));
        }
        if let Err(e) = fs::rename(&tmp, &dst).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(StorageError::upload_failed(format!(
                "rename to {} failed: {}",
                dst.display(),
                e
            )));
        }

        info!(key, bytes, "Stored artifact in {}", self.root.display());
        Ok(UploadConfirmation {
            key: key.to_string(),
            bytes,
            sha256,
        })
    }
}
