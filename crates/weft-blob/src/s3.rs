// SPDX-License-Identifier: MIT OR Apache-2.0
//! S3 blob backend with sharded object keys.

use std::path::Path;

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use weft_core::BlobKey;

use crate::{key_of, key_of_file, BlobError, BlobStore};

/// Blob backend over an S3 bucket.
///
/// Object keys are sharded `aa/bb/rest` from the blob key to spread the
/// namespace, under an optional prefix.
#[derive(Debug, Clone)]
pub struct S3Store {
    client: aws_sdk_s3::Client,
    bucket: String,
    prefix: Option<String>,
}

impl S3Store {
    /// A store over `bucket`, keyed under `prefix` when given.
    pub fn new(client: aws_sdk_s3::Client, bucket: impl Into<String>, prefix: Option<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            prefix: prefix.map(|p| p.trim_matches('/').to_string()).filter(|p| !p.is_empty()),
        }
    }

    /// A store using the ambient AWS environment configuration.
    pub async fn from_env(bucket: impl Into<String>, prefix: Option<String>) -> Self {
        let config = aws_config::load_from_env().await;
        Self::new(aws_sdk_s3::Client::new(&config), bucket, prefix)
    }

    fn object_key(&self, key: &BlobKey) -> String {
        let hex = key.as_str();
        let sharded = format!("{}/{}/{}", &hex[..2], &hex[2..4], &hex[4..]);
        match &self.prefix {
            Some(prefix) => format!("{prefix}/{sharded}"),
            None => sharded,
        }
    }
}

fn s3_error(err: impl std::fmt::Debug) -> BlobError {
    BlobError::S3(format!("{err:?}"))
}

#[async_trait]
impl BlobStore for S3Store {
    async fn get(&self, key: &BlobKey) -> Result<Bytes, BlobError> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.object_key(key))
            .send()
            .await;
        match output {
            Ok(output) => {
                let data = output.body.collect().await.map_err(s3_error)?;
                Ok(data.into_bytes())
            }
            Err(err) => {
                if err
                    .as_service_error()
                    .is_some_and(|service| service.is_no_such_key())
                {
                    Err(BlobError::Miss { key: key.clone() })
                } else {
                    Err(s3_error(err))
                }
            }
        }
    }

    async fn put(&self, content: Bytes) -> Result<BlobKey, BlobError> {
        let key = key_of(&content);
        if self.head(&key).await? {
            debug!(target: "weft_blob", key = %key, "put skipped, key present");
            return Ok(key);
        }
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.object_key(&key))
            .body(ByteStream::from(content))
            .send()
            .await
            .map_err(s3_error)?;
        Ok(key)
    }

    async fn head(&self, key: &BlobKey) -> Result<bool, BlobError> {
        let output = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.object_key(key))
            .send()
            .await;
        match output {
            Ok(_) => Ok(true),
            Err(err) => {
                if err
                    .as_service_error()
                    .is_some_and(|service| service.is_not_found())
                {
                    Ok(false)
                } else {
                    Err(s3_error(err))
                }
            }
        }
    }

    async fn download(&self, key: &BlobKey, path: &Path) -> Result<(), BlobError> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.object_key(key))
            .send()
            .await;
        let output = match output {
            Ok(output) => output,
            Err(err) => {
                return if err
                    .as_service_error()
                    .is_some_and(|service| service.is_no_such_key())
                {
                    Err(BlobError::Miss { key: key.clone() })
                } else {
                    Err(s3_error(err))
                }
            }
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(path).await?;
        let mut body = output.body;
        while let Some(chunk) = body.try_next().await.map_err(s3_error)? {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(())
    }

    async fn upload(&self, path: &Path) -> Result<BlobKey, BlobError> {
        let (key, _size) = key_of_file(path).await?;
        if self.head(&key).await? {
            debug!(target: "weft_blob", key = %key, "upload skipped, key present");
            return Ok(key);
        }
        let body = ByteStream::from_path(path).await.map_err(s3_error)?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.object_key(&key))
            .body(body)
            .send()
            .await
            .map_err(s3_error)?;
        Ok(key)
    }
}
