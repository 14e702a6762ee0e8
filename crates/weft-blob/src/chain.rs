// SPDX-License-Identifier: MIT OR Apache-2.0
//! A chain of blob backends queried in order.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use weft_core::BlobKey;

use crate::{BlobError, BlobStore};

/// Backends queried in order.
///
/// Reads (`get`, `head`, `download`) return on the first backend to hit and
/// only miss when every backend misses. Writes (`put`, `upload`) go to the
/// first backend only; content addressing makes the chain concurrency-safe.
#[derive(Clone)]
pub struct StoreChain {
    backends: Vec<Arc<dyn BlobStore>>,
}

impl StoreChain {
    /// A chain over `backends`, which must be non-empty.
    pub fn new(backends: Vec<Arc<dyn BlobStore>>) -> Self {
        assert!(!backends.is_empty(), "blob store chain needs a backend");
        Self { backends }
    }

    fn primary(&self) -> &dyn BlobStore {
        self.backends[0].as_ref()
    }
}

#[async_trait]
impl BlobStore for StoreChain {
    async fn get(&self, key: &BlobKey) -> Result<Bytes, BlobError> {
        for backend in &self.backends {
            match backend.get(key).await {
                Err(err) if err.is_miss() => continue,
                other => return other,
            }
        }
        Err(BlobError::Miss { key: key.clone() })
    }

    async fn put(&self, content: Bytes) -> Result<BlobKey, BlobError> {
        self.primary().put(content).await
    }

    async fn head(&self, key: &BlobKey) -> Result<bool, BlobError> {
        for backend in &self.backends {
            if backend.head(key).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn download(&self, key: &BlobKey, path: &Path) -> Result<(), BlobError> {
        for backend in &self.backends {
            match backend.download(key, path).await {
                Err(err) if err.is_miss() => continue,
                other => return other,
            }
        }
        Err(BlobError::Miss { key: key.clone() })
    }

    async fn upload(&self, path: &Path) -> Result<BlobKey, BlobError> {
        self.primary().upload(path).await
    }
}
