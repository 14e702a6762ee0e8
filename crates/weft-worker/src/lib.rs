// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! weft-worker
#![deny(unsafe_code)]
#![warn(missing_docs)]

use thiserror::Error;

pub mod assets;
mod channel;
pub mod context;
pub mod frame;
mod host;
mod registry;
mod submit;

pub use channel::Channel;
pub use frame::{
    AssetEntry, AssetKind, AssetLookup, CacheKey, ChildFrame, ParentFrame, StartExecution,
    SubmitSpec,
};
pub use host::WorkerHost;
pub use registry::{RegisteredTarget, Registry, TargetHandler};
pub use submit::SubmitOptions;

/// Errors from the worker host and pipe protocol.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Pipe or filesystem failure.
    #[error("worker io error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame could not be encoded.
    #[error("frame encode error: {0}")]
    Encode(#[source] serde_json::Error),

    /// A frame could not be decoded.
    #[error("frame decode error: {0}")]
    Decode(#[source] serde_json::Error),

    /// The parent broke the pipe protocol.
    #[error("protocol error: {0}")]
    Protocol(String),
}
