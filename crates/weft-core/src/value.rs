// SPDX-License-Identifier: MIT OR Apache-2.0
//! The `Value` envelope: the canonical argument/result wire form.
//!
//! Envelopes are positional JSON arrays (`["raw", …]` / `["blob", …]`), so
//! the serde impls go through [`serde_json::Value`] rather than derived
//! struct shapes.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value as Json};

use crate::error::EnvelopeError;
use crate::{AssetId, ExecutionId};

/// Arbitrary JSON metadata attached to fragments and assets.
pub type Metadata = BTreeMap<String, Json>;

// ---------------------------------------------------------------------------
// BlobKey
// ---------------------------------------------------------------------------

/// Content address of a blob: the lowercase hex SHA-256 of its bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlobKey(String);

impl BlobKey {
    /// Validate and wrap a hex digest string.
    pub fn from_hex(hex: impl Into<String>) -> Result<Self, EnvelopeError> {
        let hex = hex.into();
        let valid = hex.len() == 64 && hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        if !valid {
            return Err(EnvelopeError::InvalidBlobKey(hex));
        }
        Ok(Self(hex))
    }

    /// The hex digest as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for BlobKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for BlobKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        BlobKey::from_hex(hex).map_err(D::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Reference
// ---------------------------------------------------------------------------

/// A typed handle carried flat in the envelope's reference list.
///
/// References never carry inline payload; the tree points at them with
/// `{"type":"ref","index":i}` placeholders.
#[derive(Debug, Clone, PartialEq)]
pub enum Reference {
    /// A handle to another execution's eventual result.
    Execution {
        /// Server-assigned execution id.
        id: ExecutionId,
    },
    /// A handle to a persisted filesystem artifact.
    Asset {
        /// Server-assigned asset id.
        id: AssetId,
    },
    /// An opaque value serialised by a named codec and stored as a blob.
    Fragment {
        /// Tag of the codec that produced (and can decode) the bytes.
        serialiser: String,
        /// Content address of the serialised bytes.
        blob_key: BlobKey,
        /// Size of the serialised bytes.
        size: u64,
        /// Codec-specific metadata.
        metadata: Metadata,
    },
}

impl Reference {
    /// Encode to the positional wire array.
    pub fn to_json(&self) -> Json {
        match self {
            Reference::Execution { id } => json!(["execution", id]),
            Reference::Asset { id } => json!(["asset", id]),
            Reference::Fragment {
                serialiser,
                blob_key,
                size,
                metadata,
            } => json!(["fragment", serialiser, blob_key, size, metadata]),
        }
    }

    /// Decode from the positional wire array.
    pub fn from_json(value: &Json) -> Result<Self, EnvelopeError> {
        let items = value
            .as_array()
            .ok_or_else(|| EnvelopeError::unexpected_reference(value))?;
        match items.first().and_then(Json::as_str) {
            Some("execution") => match items.get(1).and_then(Json::as_u64) {
                Some(id) if items.len() == 2 => Ok(Reference::Execution { id }),
                _ => Err(EnvelopeError::unexpected_reference(value)),
            },
            Some("asset") => match items.get(1).and_then(Json::as_u64) {
                Some(id) if items.len() == 2 => Ok(Reference::Asset { id }),
                _ => Err(EnvelopeError::unexpected_reference(value)),
            },
            Some("fragment") if items.len() == 5 => {
                let serialiser = items[1]
                    .as_str()
                    .ok_or_else(|| EnvelopeError::unexpected_reference(value))?;
                let blob_key = items[2]
                    .as_str()
                    .ok_or_else(|| EnvelopeError::unexpected_reference(value))?;
                let size = items[3]
                    .as_u64()
                    .ok_or_else(|| EnvelopeError::unexpected_reference(value))?;
                let metadata = serde_json::from_value(items[4].clone())
                    .map_err(|_| EnvelopeError::unexpected_reference(value))?;
                Ok(Reference::Fragment {
                    serialiser: serialiser.to_string(),
                    blob_key: BlobKey::from_hex(blob_key)?,
                    size,
                    metadata,
                })
            }
            _ => Err(EnvelopeError::unexpected_reference(value)),
        }
    }
}

impl Serialize for Reference {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Reference {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Json::deserialize(deserializer)?;
        Reference::from_json(&value).map_err(D::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Value
// ---------------------------------------------------------------------------

/// The two-form argument/result envelope.
///
/// `Raw` inlines the (tagged) data tree; `Blob` stores the serialised tree
/// in the blob store and carries only its key and size. Both forms carry the
/// flat reference list the tree indexes into.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Inline JSON-compatible tree plus sidecar references.
    Raw {
        /// The tagged data tree.
        data: Json,
        /// Flat, deduplicated reference list.
        references: Vec<Reference>,
    },
    /// Blob-offloaded tree plus sidecar references.
    Blob {
        /// Content address of the serialised tree.
        key: BlobKey,
        /// Size in bytes of the serialised tree.
        size: u64,
        /// Flat, deduplicated reference list.
        references: Vec<Reference>,
    },
}

impl Value {
    /// A `Raw` envelope with no references.
    pub fn raw(data: Json) -> Self {
        Value::Raw {
            data,
            references: Vec::new(),
        }
    }

    /// The envelope's reference list.
    pub fn references(&self) -> &[Reference] {
        match self {
            Value::Raw { references, .. } | Value::Blob { references, .. } => references,
        }
    }

    /// Encode to the positional wire array.
    pub fn to_json(&self) -> Json {
        match self {
            Value::Raw { data, references } => {
                let refs: Vec<Json> = references.iter().map(Reference::to_json).collect();
                json!(["raw", data, refs])
            }
            Value::Blob {
                key,
                size,
                references,
            } => {
                let refs: Vec<Json> = references.iter().map(Reference::to_json).collect();
                json!(["blob", key, size, refs])
            }
        }
    }

    /// Decode from the positional wire array.
    pub fn from_json(value: &Json) -> Result<Self, EnvelopeError> {
        let items = value
            .as_array()
            .ok_or_else(|| EnvelopeError::unexpected_value(value))?;
        let references = |index: usize| -> Result<Vec<Reference>, EnvelopeError> {
            items
                .get(index)
                .and_then(Json::as_array)
                .ok_or_else(|| EnvelopeError::unexpected_value(value))?
                .iter()
                .map(Reference::from_json)
                .collect()
        };
        match items.first().and_then(Json::as_str) {
            Some("raw") if items.len() == 3 => Ok(Value::Raw {
                data: items[1].clone(),
                references: references(2)?,
            }),
            Some("blob") if items.len() == 4 => {
                let key = items[1]
                    .as_str()
                    .ok_or_else(|| EnvelopeError::unexpected_value(value))?;
                let size = items[2]
                    .as_u64()
                    .ok_or_else(|| EnvelopeError::unexpected_value(value))?;
                Ok(Value::Blob {
                    key: BlobKey::from_hex(key)?,
                    size,
                    references: references(3)?,
                })
            }
            _ => Err(EnvelopeError::unexpected_value(value)),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Json::deserialize(deserializer)?;
        Value::from_json(&value).map_err(D::Error::custom)
    }
}
