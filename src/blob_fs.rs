//! Filesystem-backed [`BlobStore`].
//!
//! Object paths map onto files under a root directory:
//! `u1/readme.md` → `{root}/u1/readme.md`. Uploads are written to a
//! sibling temp file and renamed into place so a reader never observes a
//! half-written object.

use anyhow::Context;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::blob::{validate_path, BlobEntry, BlobStore};
use crate::error::StorageError;

/// File-name prefix of uploads still being written.
const TMP_PREFIX: &str = ".docai-tmp-";

pub struct FilesystemBlobStore {
    root: PathBuf,
}

impl FilesystemBlobStore {
    /// Create a store rooted at `root`, creating the directory if needed.
    pub fn new(root: PathBuf) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create storage root: {}", root.display()))?;
        let root = root
            .canonicalize()
            .with_context(|| format!("Failed to resolve storage root: {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        validate_path(path)?;
        Ok(self.root.join(path))
    }
}

fn map_io(path: &str, err: std::io::Error) -> StorageError {
    if err.kind() == ErrorKind::NotFound {
        StorageError::NotFound(path.to_string())
    } else {
        StorageError::Transient(anyhow::anyhow!("{}: {}", path, err))
    }
}

#[async_trait]
impl BlobStore for FilesystemBlobStore {
    fn backend(&self) -> &str {
        "filesystem"
    }

    async fn upload(&self, path: &str, data: &[u8]) -> Result<(), StorageError> {
        let target = self.resolve(path)?;
        if path.rsplit('/').next().is_some_and(|name| name.starts_with(TMP_PREFIX)) {
            return Err(StorageError::Transient(anyhow::anyhow!(
                "reserved object name: '{}'",
                path
            )));
        }
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| map_io(path, e))?;
        }

        let tmp = target.with_file_name(format!("{}{}", TMP_PREFIX, uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, data)
            .await
            .map_err(|e| map_io(path, e))?;
        if let Err(e) = tokio::fs::rename(&tmp, &target).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(map_io(path, e));
        }
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        let target = self.resolve(path)?;
        match tokio::fs::metadata(&target).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(map_io(path, e)),
        }
    }

    async fn download(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let target = self.resolve(path)?;
        tokio::fs::read(&target).await.map_err(|e| map_io(path, e))
    }

    fn url(&self, path: &str) -> String {
        format!("file://{}", self.root.join(path).display())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BlobEntry>, StorageError> {
        let dir_part = prefix.trim_end_matches('/');
        let dir = if dir_part.is_empty() {
            self.root.clone()
        } else {
            self.resolve(dir_part)?
        };

        let mut read_dir = match tokio::fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(map_io(prefix, e)),
        };

        let mut entries = Vec::new();
        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(|e| map_io(prefix, e))?
        {
            let file_type = entry.file_type().await.map_err(|e| map_io(prefix, e))?;
            if !file_type.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(TMP_PREFIX) {
                continue;
            }
            let path = if dir_part.is_empty() {
                name
            } else {
                format!("{}/{}", dir_part, name)
            };
            entries.push(BlobEntry::from_path(path));
        }

        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        let target = self.resolve(path)?;
        tokio::fs::remove_file(&target)
            .await
            .map_err(|e| map_io(path, e))
    }
}
