// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! weft-core
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Shared data model for the Weft agent. Everything here is a plain value
//! type: the executing pieces (blob store, codec registry, connection,
//! worker, manager) live in the sibling crates and all speak in terms of
//! these envelopes.

pub mod data;
pub mod error;
pub mod result;
pub mod target;
pub mod value;

pub use data::{AssetHandle, Data, ExecutionHandle, RestoreAsset, ResolveResult};
pub use error::{EnvelopeError, TargetError};
pub use result::{ErrorDetail, ErrorFrame, ResultEnvelope};
pub use target::{Cache, Defer, LogLevel, Parameter, ParamSelection, Requires, Retries, Target, TargetType};
pub use value::{BlobKey, Metadata, Reference, Value};

/// Server-assigned identifier for one execution.
pub type ExecutionId = u64;

/// Server-assigned identifier for a persisted asset.
pub type AssetId = u64;
