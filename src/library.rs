//! Per-user document library.
//!
//! Uploaded Markdown files live at `{uid}/{filename}` in the blob store.
//! Only names matching `storage.accept_globs` (default `*.md`) are accepted,
//! and names may not contain `/`, so every document is a direct child of the
//! user's prefix.

use anyhow::{bail, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::sync::Arc;

use crate::blob::BlobStore;
use crate::error::StorageError;
use crate::models::{Document, FileEntry, UserId};

/// Storage path of a user's document.
pub fn document_path(user: &UserId, name: &str) -> String {
    format!("{}/{}", user, name)
}

pub struct DocumentLibrary {
    blobs: Arc<dyn BlobStore>,
    accept: GlobSet,
}

impl DocumentLibrary {
    pub fn new(blobs: Arc<dyn BlobStore>, accept_globs: &[String]) -> Result<Self> {
        Ok(Self {
            blobs,
            accept: build_globset(accept_globs)?,
        })
    }

    /// Check a file name against the upload rules.
    pub fn check_name(&self, name: &str) -> Result<()> {
        if name.is_empty() || name.contains('/') || name.contains('\\') {
            bail!("Invalid file name '{}'", name);
        }
        if name == "." || name == ".." {
            bail!("Invalid file name '{}'", name);
        }
        if !self.accept.is_match(name) {
            bail!("File type not accepted: '{}'", name);
        }
        Ok(())
    }

    /// Store `bytes` as the user's document `name`, replacing any previous
    /// upload with the same name. Returns the new entry.
    pub async fn upload(&self, user: &UserId, name: &str, bytes: &[u8]) -> Result<FileEntry> {
        self.check_name(name)?;
        let path = document_path(user, name);
        self.blobs.upload(&path, bytes).await?;
        tracing::info!(uid = %user, file = name, bytes = bytes.len(), "uploaded document");
        Ok(FileEntry {
            name: name.to_string(),
            url: self.blobs.url(&path),
        })
    }

    /// The user's documents sorted by name.
    ///
    /// Storage failures degrade to an empty list.
    pub async fn list(&self, user: &UserId) -> Vec<FileEntry> {
        let prefix = format!("{}/", user);
        match self.blobs.list(&prefix).await {
            Ok(entries) => {
                let mut files: Vec<FileEntry> = entries
                    .into_iter()
                    .map(|entry| FileEntry {
                        url: self.blobs.url(&entry.path),
                        name: entry.name,
                    })
                    .collect();
                files.sort_by(|a, b| a.name.cmp(&b.name));
                files
            }
            Err(e) => {
                tracing::warn!(uid = %user, error = %e, "failed to list documents");
                Vec::new()
            }
        }
    }

    /// Download a document's text.
    pub async fn fetch(&self, user: &UserId, name: &str) -> Result<Document, StorageError> {
        let path = document_path(user, name);
        let text = self.blobs.download_text(&path).await?;
        Ok(Document { path, text })
    }

    /// Remove a document. Failures are logged and returned; the library is
    /// left unchanged.
    pub async fn delete(&self, user: &UserId, name: &str) -> Result<(), StorageError> {
        let path = document_path(user, name);
        match self.blobs.delete(&path).await {
            Ok(()) => {
                tracing::info!(uid = %user, file = name, "deleted document");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(uid = %user, file = name, error = %e, "failed to delete document");
                Err(e)
            }
        }
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
