// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! weft-blob
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use weft_core::BlobKey;

mod chain;
mod http;
mod key;
mod memory;
mod s3;

pub use chain::StoreChain;
pub use http::HttpStore;
pub use key::{key_of, key_of_file};
pub use memory::MemoryStore;
pub use s3::S3Store;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from blob storage operations.
///
/// `Miss` is the only variant callers are expected to branch on; everything
/// else is a transport or filesystem failure.
#[derive(Debug, Error)]
pub enum BlobError {
    /// The key is not present in any queried backend.
    #[error("blob not found: {key}")]
    Miss {
        /// The key that missed.
        key: BlobKey,
    },

    /// HTTP transport failure.
    #[error("blob transport error: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with an unexpected status.
    #[error("unexpected status {status} for blob {key}")]
    Status {
        /// The key being accessed.
        key: BlobKey,
        /// The HTTP status received.
        status: u16,
    },

    /// S3 request failure.
    #[error("s3 error: {0}")]
    S3(String),

    /// Local filesystem failure during upload/download.
    #[error("blob io error: {0}")]
    Io(#[from] std::io::Error),
}

impl BlobError {
    /// Returns `true` if this error means the key was absent (as opposed to
    /// a failed attempt to find out).
    pub fn is_miss(&self) -> bool {
        matches!(self, BlobError::Miss { .. })
    }
}

// ---------------------------------------------------------------------------
// BlobStore
// ---------------------------------------------------------------------------

/// One blob storage backend.
///
/// All backends are keyed by content: `put` and `upload` hash first, check
/// presence with `head`, and upload at most once. `download` and `upload`
/// stream file content rather than materialising it in memory.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Fetch a blob's bytes. Errors with [`BlobError::Miss`] when absent.
    async fn get(&self, key: &BlobKey) -> Result<Bytes, BlobError>;

    /// Store bytes under their content address, skipping the upload when the
    /// key is already present. Returns the key.
    async fn put(&self, content: Bytes) -> Result<BlobKey, BlobError>;

    /// Returns `true` if the key is present.
    async fn head(&self, key: &BlobKey) -> Result<bool, BlobError>;

    /// Stream a blob to a local file. Errors with [`BlobError::Miss`] when
    /// absent.
    async fn download(&self, key: &BlobKey, path: &Path) -> Result<(), BlobError>;

    /// Hash a local file in one streaming pass, then store it under its
    /// content address (skipping the upload when present). Returns the key.
    async fn upload(&self, path: &Path) -> Result<BlobKey, BlobError>;
}
