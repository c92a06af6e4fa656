//! Content-addressed blob storage for large stage outputs.
//!
//! Blobs are stored on the local filesystem under their SHA-256 checksum,
//! so writing the same bytes twice (for instance when a stage is
//! re-executed after a crash) yields the same location.

use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::pipeline::ArtifactRef;

/// Errors that can occur during blob storage operations.
#[derive(Debug, Error)]
pub enum BlobError {
    /// IO operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Blob not found.
    #[error("Blob not found: {0}")]
    NotFound(String),

    /// Checksum verification failed.
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// Storage directory creation failed.
    #[error("Failed to create storage directory: {0}")]
    DirectoryCreationFailed(String),

    /// Location escapes the store or is not a checksum path.
    #[error("Invalid blob location: {0}")]
    InvalidLocation(String),
}

/// Filesystem blob store.
#[derive(Debug, Clone)]
pub struct BlobStore {
    base_path: PathBuf,
}

impl BlobStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Stores `data` and returns a blob artifact reference to it.
    pub async fn put(&self, data: &[u8]) -> Result<ArtifactRef, BlobError> {
        let checksum = Self::compute_checksum(data);
        let location = Self::location_for(&checksum);
        let file_path = self.base_path.join(&location);

        if let Some(parent) = file_path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                BlobError::DirectoryCreationFailed(format!("{}: {}", parent.display(), e))
            })?;
        }

        if !fs::try_exists(&file_path).await? {
            // Write to a temp file then rename so readers never see partial blobs.
            let tmp_path = file_path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
            let mut file = fs::File::create(&tmp_path).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&tmp_path, &file_path).await?;
            tracing::debug!(location = %location, size = data.len(), "Stored blob");
        }

        Ok(ArtifactRef::Blob {
            location,
            checksum,
            size_bytes: data.len() as u64,
        })
    }

    /// Reads a blob back and verifies its checksum.
    pub async fn get(&self, location: &str) -> Result<Vec<u8>, BlobError> {
        let file_path = self.resolve(location)?;
        let data = match fs::read(&file_path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BlobError::NotFound(location.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        let expected = file_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        let actual = Self::compute_checksum(&data);
        if actual != expected {
            return Err(BlobError::ChecksumMismatch { expected, actual });
        }

        Ok(data)
    }

    pub async fn exists(&self, location: &str) -> Result<bool, BlobError> {
        let file_path = self.resolve(location)?;
        Ok(fs::try_exists(&file_path).await?)
    }

    /// Computes the SHA-256 checksum of data.
    pub fn compute_checksum(data: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(data);
        hex::encode(hasher.finalize())
    }

    /// Relative location for a checksum, fanned out by its first two chars.
    fn location_for(checksum: &str) -> String {
        let subdir = &checksum[0..2.min(checksum.len())];
        format!("{}/{}", subdir, checksum)
    }

    fn resolve(&self, location: &str) -> Result<PathBuf, BlobError> {
        let relative = Path::new(location);
        let safe = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if !safe || relative.components().count() != 2 {
            return Err(BlobError::InvalidLocation(location.to_string()));
        }
        Ok(self.base_path.join(relative))
    }
}
