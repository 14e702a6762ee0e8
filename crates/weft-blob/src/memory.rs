// SPDX-License-Identifier: MIT OR Apache-2.0
//! In-memory blob backend for tests and local runs.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use weft_core::BlobKey;

use crate::{key_of, BlobError, BlobStore};

/// A process-local backend holding blobs in a map.
///
/// Counts write operations so tests can assert upload-exactly-once
/// behaviour.
#[derive(Default)]
pub struct MemoryStore {
    blobs: Mutex<HashMap<BlobKey, Bytes>>,
    puts: Mutex<u32>,
}

impl MemoryStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of writes that actually stored new content.
    pub fn puts(&self) -> u32 {
        *self.puts.lock().unwrap()
    }

    /// Number of blobs currently held.
    pub fn len(&self) -> usize {
        self.blobs.lock().unwrap().len()
    }

    /// Returns `true` if no blob is held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BlobStore for MemoryStore {
    async fn get(&self, key: &BlobKey) -> Result<Bytes, BlobError> {
        self.blobs
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| BlobError::Miss { key: key.clone() })
    }

    async fn put(&self, content: Bytes) -> Result<BlobKey, BlobError> {
        let key = key_of(&content);
        let mut blobs = self.blobs.lock().unwrap();
        if !blobs.contains_key(&key) {
            *self.puts.lock().unwrap() += 1;
            blobs.insert(key.clone(), content);
        }
        Ok(key)
    }

    async fn head(&self, key: &BlobKey) -> Result<bool, BlobError> {
        Ok(self.blobs.lock().unwrap().contains_key(key))
    }

    async fn download(&self, key: &BlobKey, path: &Path) -> Result<(), BlobError> {
        let content = self.get(key).await?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    async fn upload(&self, path: &Path) -> Result<BlobKey, BlobError> {
        let content = tokio::fs::read(path).await?;
        self.put(Bytes::from(content)).await
    }
}
