//! Blob store abstraction.
//!
//! DocAI keeps everything a user owns as path-addressed objects:
//!
//! ```text
//! {uid}/{filename}                    uploaded Markdown documents
//! chatHistory/{uid}/chatHistory.txt   the user's chat transcript
//! ```
//!
//! [`BlobStore`] is the only storage seam. Three backends implement it:
//!
//! | Backend | Module | Use |
//! |---------|--------|-----|
//! | `memory` | [`blob_memory`](crate::blob_memory) | tests, throwaway sessions |
//! | `filesystem` | [`blob_fs`](crate::blob_fs) | local-first default |
//! | `s3` | [`blob_s3`](crate::blob_s3) | S3 and S3-compatible services |
//!
//! Use [`create_blob_store`] to build the one named in the config.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use crate::blob_fs::FilesystemBlobStore;
use crate::blob_memory::InMemoryBlobStore;
use crate::blob_s3::S3BlobStore;
use crate::config::StorageConfig;
use crate::error::StorageError;

/// An object found by [`BlobStore::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobEntry {
    /// Full object path, e.g. `u1/readme.md`.
    pub path: String,
    /// Last path segment, e.g. `readme.md`.
    pub name: String,
}

impl BlobEntry {
    pub fn from_path(path: impl Into<String>) -> Self {
        let path = path.into();
        let name = path.rsplit('/').next().unwrap_or(&path).to_string();
        Self { path, name }
    }
}

/// Path-addressed object storage.
///
/// Writes are whole-object replacements; there is no append primitive.
/// Missing objects are reported as [`StorageError::NotFound`] so callers can
/// tell absence apart from I/O failure.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Backend identifier (`"memory"`, `"filesystem"`, `"s3"`).
    fn backend(&self) -> &str;

    /// Create or replace the object at `path`.
    async fn upload(&self, path: &str, data: &[u8]) -> Result<(), StorageError>;

    async fn exists(&self, path: &str) -> Result<bool, StorageError>;

    async fn download(&self, path: &str) -> Result<Vec<u8>, StorageError>;

    /// Download and decode as UTF-8, replacing invalid sequences.
    async fn download_text(&self, path: &str) -> Result<String, StorageError> {
        let bytes = self.download(path).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// A URL a browser or tool can use to fetch the object.
    fn url(&self, path: &str) -> String;

    /// List the objects directly under `prefix` (no recursion), sorted by path.
    ///
    /// `prefix` is a directory-style prefix such as `"u1/"`.
    async fn list(&self, prefix: &str) -> Result<Vec<BlobEntry>, StorageError>;

    /// Delete the object. Deleting a missing object is `NotFound`.
    async fn delete(&self, path: &str) -> Result<(), StorageError>;
}

/// Build the blob store selected by `storage.backend`.
pub fn create_blob_store(config: &StorageConfig) -> Result<Arc<dyn BlobStore>> {
    match config.backend.as_str() {
        "memory" => Ok(Arc::new(InMemoryBlobStore::new())),
        "filesystem" => Ok(Arc::new(FilesystemBlobStore::new(config.root.clone())?)),
        "s3" => {
            let s3 = config
                .s3
                .clone()
                .ok_or_else(|| anyhow::anyhow!("storage.s3 section required for s3 backend"))?;
            Ok(Arc::new(S3BlobStore::from_env(s3)?))
        }
        other => anyhow::bail!("Unknown storage backend: {}", other),
    }
}

/// Reject paths that could escape a backend's namespace.
///
/// Paths are `/`-separated, relative, and contain no empty, `.` or `..`
/// segments.
pub fn validate_path(path: &str) -> Result<(), StorageError> {
    if path.is_empty() || path.starts_with('/') || path.contains('\\') {
        return Err(StorageError::Transient(anyhow::anyhow!(
            "invalid object path: '{}'",
            path
        )));
    }
    if path
        .split('/')
        .any(|seg| seg.is_empty() || seg == "." || seg == "..")
    {
        return Err(StorageError::Transient(anyhow::anyhow!(
            "invalid object path: '{}'",
            path
        )));
    }
    Ok(())
}

/// Whether `path` sits directly under `prefix` (one segment deeper).
pub(crate) fn is_direct_child(prefix: &str, path: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => !rest.is_empty() && !rest.contains('/'),
        None => false,
    }
}
