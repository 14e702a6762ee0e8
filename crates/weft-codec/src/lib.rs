// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! weft-codec
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::sync::Arc;

use thiserror::Error;
use weft_blob::BlobError;
use weft_core::{Data, EnvelopeError, Metadata};

pub mod cbor;
pub mod model;
pub mod table;
mod walker;

pub use cbor::CborSerialiser;
pub use model::ModelSerialiser;
pub use table::TableSerialiser;
pub use walker::{deserialise, serialise, Capabilities};

/// Default envelope-size threshold (bytes) above which the serialised tree
/// is offloaded to the blob store.
pub const DEFAULT_BLOB_THRESHOLD: usize = 200;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from serialising or deserialising values.
#[derive(Debug, Error)]
pub enum CodecError {
    /// No codec in the registry accepted the value.
    #[error("no serialiser accepted value: {0}")]
    Unserialisable(String),

    /// A fragment names a codec that is not in the registry.
    #[error("unknown serialiser: {0}")]
    UnknownSerialiser(String),

    /// A codec accepted a value but failed to encode it.
    #[error("serialiser '{tag}' failed: {reason}")]
    Encode {
        /// Codec tag.
        tag: String,
        /// Failure description.
        reason: String,
    },

    /// A codec failed to decode fragment bytes.
    #[error("serialiser '{tag}' failed to decode: {reason}")]
    Decode {
        /// Codec tag.
        tag: String,
        /// Failure description.
        reason: String,
    },

    /// A record did not validate against its model schema.
    #[error("model '{model}' validation failed: {reason}")]
    Validation {
        /// Model name.
        model: String,
        /// Failure description.
        reason: String,
    },

    /// The data tree held a shape the walker does not recognise.
    #[error("unexpected data tree: {0}")]
    UnexpectedTree(String),

    /// A `{type:ref}` placeholder indexed past the reference list.
    #[error("reference index {index} out of bounds ({len} references)")]
    ReferenceOutOfBounds {
        /// The out-of-range index.
        index: usize,
        /// Length of the reference list.
        len: usize,
    },

    /// Blob store failure while offloading or fetching content.
    #[error(transparent)]
    Blob(#[from] BlobError),

    /// Envelope parse failure.
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    /// JSON encoding failure.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Serialiser
// ---------------------------------------------------------------------------

/// One pluggable codec.
///
/// Codecs are pure byte transforms; blob I/O stays in the walker. Refusal is
/// `Ok(None)`, never an error: an error from `try_serialise` means the codec
/// accepted the value and then failed.
pub trait Serialiser: Send + Sync {
    /// The codec's wire tag, recorded in fragment references.
    fn tag(&self) -> &'static str;

    /// Offer a value to this codec. Returns the encoded bytes and metadata,
    /// or `None` when the codec does not handle this shape.
    fn try_serialise(&self, data: &Data) -> Result<Option<(Vec<u8>, Metadata)>, CodecError>;

    /// Decode bytes previously produced by this codec.
    fn deserialise(&self, content: &[u8], metadata: &Metadata) -> Result<Data, CodecError>;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// An ordered set of codecs. The first codec to accept a value wins, so the
/// order is part of the configuration contract.
#[derive(Clone)]
pub struct SerialiserRegistry {
    serialisers: Vec<Arc<dyn Serialiser>>,
}

impl SerialiserRegistry {
    /// A registry with the given codecs, tried in order.
    pub fn new(serialisers: Vec<Arc<dyn Serialiser>>) -> Self {
        Self { serialisers }
    }

    /// The standard set: `table`, `model` (no registered schemas), `cbor`
    /// fallback last.
    pub fn standard() -> Self {
        Self::new(vec![
            Arc::new(TableSerialiser::new()),
            Arc::new(ModelSerialiser::default()),
            Arc::new(CborSerialiser::new()),
        ])
    }

    /// Offer `data` to each codec in order.
    pub fn serialise(&self, data: &Data) -> Result<(String, Vec<u8>, Metadata), CodecError> {
        for serialiser in &self.serialisers {
            if let Some((content, metadata)) = serialiser.try_serialise(data)? {
                return Ok((serialiser.tag().to_string(), content, metadata));
            }
        }
        Err(CodecError::Unserialisable(format!("{data:?}")))
    }

    /// Look up a codec by tag.
    pub fn by_tag(&self, tag: &str) -> Result<&dyn Serialiser, CodecError> {
        self.serialisers
            .iter()
            .find(|serialiser| serialiser.tag() == tag)
            .map(|serialiser| serialiser.as_ref())
            .ok_or_else(|| CodecError::UnknownSerialiser(tag.to_string()))
    }

    /// Codec tags in registry order.
    pub fn tags(&self) -> Vec<&'static str> {
        self.serialisers.iter().map(|s| s.tag()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_order_ends_with_fallback() {
        let registry = SerialiserRegistry::standard();
        assert_eq!(registry.tags(), vec!["table", "model", "cbor"]);
    }

    #[test]
    fn first_acceptor_wins() {
        let registry = SerialiserRegistry::standard();
        let table = Data::Table {
            columns: vec!["a".into()],
            rows: vec![vec![Data::Int(1)]],
        };
        let (tag, _, _) = registry.serialise(&table).unwrap();
        assert_eq!(tag, "table");

        let (tag, _, _) = registry.serialise(&Data::Bytes(vec![1, 2, 3])).unwrap();
        assert_eq!(tag, "cbor");
    }

    #[test]
    fn unknown_tag_errors() {
        let registry = SerialiserRegistry::standard();
        assert!(matches!(
            registry.by_tag("pickle"),
            Err(CodecError::UnknownSerialiser(_))
        ));
    }
}
