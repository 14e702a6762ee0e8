// SPDX-License-Identifier: MIT OR Apache-2.0
//! HTTP blob backend speaking `HEAD/GET/PUT /blobs/{key}`.

use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::debug;
use weft_core::BlobKey;

use crate::{key_of, key_of_file, BlobError, BlobStore};

/// Blob backend over the orchestrator's (or any compatible) HTTP endpoint.
#[derive(Debug, Clone)]
pub struct HttpStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpStore {
    /// A store rooted at `base_url` (e.g. `http://localhost:7777`).
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, key: &BlobKey) -> String {
        format!("{}/blobs/{}", self.base_url, key)
    }
}

#[async_trait]
impl BlobStore for HttpStore {
    async fn get(&self, key: &BlobKey) -> Result<Bytes, BlobError> {
        let response = self.client.get(self.url(key)).send().await?;
        match response.status() {
            StatusCode::OK => Ok(response.bytes().await?),
            StatusCode::NOT_FOUND => Err(BlobError::Miss { key: key.clone() }),
            status => Err(BlobError::Status {
                key: key.clone(),
                status: status.as_u16(),
            }),
        }
    }

    async fn put(&self, content: Bytes) -> Result<BlobKey, BlobError> {
        let key = key_of(&content);
        if self.head(&key).await? {
            debug!(target: "weft_blob", key = %key, "put skipped, key present");
            return Ok(key);
        }
        let response = self.client.put(self.url(&key)).body(content).send().await?;
        if !response.status().is_success() {
            return Err(BlobError::Status {
                key,
                status: response.status().as_u16(),
            });
        }
        Ok(key)
    }

    async fn head(&self, key: &BlobKey) -> Result<bool, BlobError> {
        let response = self.client.head(self.url(key)).send().await?;
        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(BlobError::Status {
                key: key.clone(),
                status: status.as_u16(),
            }),
        }
    }

    async fn download(&self, key: &BlobKey, path: &Path) -> Result<(), BlobError> {
        let mut response = self.client.get(self.url(key)).send().await?;
        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => return Err(BlobError::Miss { key: key.clone() }),
            status => {
                return Err(BlobError::Status {
                    key: key.clone(),
                    status: status.as_u16(),
                })
            }
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(path).await?;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(())
    }

    async fn upload(&self, path: &Path) -> Result<BlobKey, BlobError> {
        let (key, size) = key_of_file(path).await?;
        if self.head(&key).await? {
            debug!(target: "weft_blob", key = %key, "upload skipped, key present");
            return Ok(key);
        }
        let file = tokio::fs::File::open(path).await?;
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
        let response = self
            .client
            .put(self.url(&key))
            .header(reqwest::header::CONTENT_LENGTH, size)
            .body(body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(BlobError::Status {
                key,
                status: response.status().as_u16(),
            });
        }
        Ok(key)
    }
}
