//! In-memory [`BlobStore`] implementation for testing and throwaway sessions.
//!
//! Objects live in a `BTreeMap` behind `std::sync::RwLock`, so listing is
//! naturally sorted by path.

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::blob::{is_direct_child, validate_path, BlobEntry, BlobStore};
use crate::error::StorageError;

pub struct InMemoryBlobStore {
    objects: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
        }
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.objects.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    fn backend(&self) -> &str {
        "memory"
    }

    async fn upload(&self, path: &str, data: &[u8]) -> Result<(), StorageError> {
        validate_path(path)?;
        let mut objects = self.objects.write().unwrap();
        objects.insert(path.to_string(), data.to_vec());
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        validate_path(path)?;
        Ok(self.objects.read().unwrap().contains_key(path))
    }

    async fn download(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        validate_path(path)?;
        self.objects
            .read()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(path.to_string()))
    }

    fn url(&self, path: &str) -> String {
        format!("memory://{}", path)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BlobEntry>, StorageError> {
        let objects = self.objects.read().unwrap();
        Ok(objects
            .keys()
            .filter(|k| is_direct_child(prefix, k))
            .map(|k| BlobEntry::from_path(k.clone()))
            .collect())
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        validate_path(path)?;
        match self.objects.write().unwrap().remove(path) {
            Some(_) => Ok(()),
            None => Err(StorageError::NotFound(path.to_string())),
        }
    }
}
