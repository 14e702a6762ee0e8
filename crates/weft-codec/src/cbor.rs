// SPDX-License-Identifier: MIT OR Apache-2.0
//! Opaque structured fallback codec over CBOR.
//!
//! Accepts any handle-free value tree. Sets carry IANA tag 258; tuples,
//! tables, and records use local first-come tags so the tree decodes back
//! into the same shapes.

use ciborium::value::Value as Cbor;
use weft_core::{Data, Metadata};

use crate::{CodecError, Serialiser};

const TAG_SET: u64 = 258;
const TAG_TUPLE: u64 = 128;
const TAG_TABLE: u64 = 129;
const TAG_RECORD: u64 = 130;

/// CBOR fallback codec, tagged `cbor`. Place it last in the registry.
#[derive(Debug, Clone, Copy, Default)]
pub struct CborSerialiser;

impl CborSerialiser {
    /// A new fallback codec.
    pub fn new() -> Self {
        Self
    }
}

fn contains_handle(data: &Data) -> bool {
    match data {
        Data::Execution(_) | Data::Asset(_) => true,
        Data::List(items) | Data::Set(items) | Data::Tuple(items) => {
            items.iter().any(contains_handle)
        }
        Data::Dict(pairs) => pairs
            .iter()
            .any(|(k, v)| contains_handle(k) || contains_handle(v)),
        Data::Table { rows, .. } => rows.iter().flatten().any(contains_handle),
        Data::Record { fields, .. } => fields.iter().any(|(_, v)| contains_handle(v)),
        _ => false,
    }
}

fn encode(data: &Data) -> Result<Cbor, CodecError> {
    let encoded = match data {
        Data::Null => Cbor::Null,
        Data::Bool(b) => Cbor::Bool(*b),
        Data::Int(i) => Cbor::Integer((*i).into()),
        Data::Float(f) => Cbor::Float(*f),
        Data::String(s) => Cbor::Text(s.clone()),
        Data::Bytes(b) => Cbor::Bytes(b.clone()),
        Data::List(items) => Cbor::Array(items.iter().map(encode).collect::<Result<_, _>>()?),
        Data::Set(items) => Cbor::Tag(
            TAG_SET,
            Box::new(Cbor::Array(
                items.iter().map(encode).collect::<Result<_, _>>()?,
            )),
        ),
        Data::Tuple(items) => Cbor::Tag(
            TAG_TUPLE,
            Box::new(Cbor::Array(
                items.iter().map(encode).collect::<Result<_, _>>()?,
            )),
        ),
        Data::Dict(pairs) => Cbor::Map(
            pairs
                .iter()
                .map(|(k, v)| Ok((encode(k)?, encode(v)?)))
                .collect::<Result<_, CodecError>>()?,
        ),
        Data::Table { columns, rows } => {
            let columns = Cbor::Array(columns.iter().map(|c| Cbor::Text(c.clone())).collect());
            let rows = Cbor::Array(
                rows.iter()
                    .map(|row| Ok(Cbor::Array(row.iter().map(encode).collect::<Result<_, CodecError>>()?)))
                    .collect::<Result<_, CodecError>>()?,
            );
            Cbor::Tag(TAG_TABLE, Box::new(Cbor::Array(vec![columns, rows])))
        }
        Data::Record { model, fields } => {
            let fields = Cbor::Map(
                fields
                    .iter()
                    .map(|(k, v)| Ok((Cbor::Text(k.clone()), encode(v)?)))
                    .collect::<Result<_, CodecError>>()?,
            );
            Cbor::Tag(
                TAG_RECORD,
                Box::new(Cbor::Array(vec![Cbor::Text(model.clone()), fields])),
            )
        }
        Data::Execution(_) | Data::Asset(_) => {
            // Unreachable: acceptance already refused trees with handles.
            return Err(CodecError::Encode {
                tag: "cbor".into(),
                reason: "handle in tree".into(),
            });
        }
    };
    Ok(encoded)
}

fn decode_error(reason: impl Into<String>) -> CodecError {
    CodecError::Decode {
        tag: "cbor".into(),
        reason: reason.into(),
    }
}

fn decode_array(value: Cbor) -> Result<Vec<Data>, CodecError> {
    match value {
        Cbor::Array(items) => items.into_iter().map(decode).collect(),
        _ => Err(decode_error("expected array")),
    }
}

fn decode(value: Cbor) -> Result<Data, CodecError> {
    match value {
        Cbor::Null => Ok(Data::Null),
        Cbor::Bool(b) => Ok(Data::Bool(b)),
        Cbor::Integer(i) => {
            let i: i64 = i.try_into().map_err(|_| decode_error("integer overflow"))?;
            Ok(Data::Int(i))
        }
        Cbor::Float(f) => Ok(Data::Float(f)),
        Cbor::Text(s) => Ok(Data::String(s)),
        Cbor::Bytes(b) => Ok(Data::Bytes(b)),
        Cbor::Array(items) => Ok(Data::List(
            items.into_iter().map(decode).collect::<Result<_, _>>()?,
        )),
        Cbor::Map(pairs) => Ok(Data::Dict(
            pairs
                .into_iter()
                .map(|(k, v)| Ok((decode(k)?, decode(v)?)))
                .collect::<Result<_, CodecError>>()?,
        )),
        Cbor::Tag(TAG_SET, inner) => Ok(Data::Set(decode_array(*inner)?)),
        Cbor::Tag(TAG_TUPLE, inner) => Ok(Data::Tuple(decode_array(*inner)?)),
        Cbor::Tag(TAG_TABLE, inner) => match *inner {
            Cbor::Array(mut parts) if parts.len() == 2 => {
                let rows = parts.pop().expect("len checked");
                let columns = parts.pop().expect("len checked");
                let columns = match columns {
                    Cbor::Array(items) => items
                        .into_iter()
                        .map(|c| match c {
                            Cbor::Text(c) => Ok(c),
                            _ => Err(decode_error("column name must be text")),
                        })
                        .collect::<Result<Vec<_>, _>>()?,
                    _ => return Err(decode_error("expected column array")),
                };
                let rows = match rows {
                    Cbor::Array(items) => items
                        .into_iter()
                        .map(decode_array)
                        .collect::<Result<Vec<_>, _>>()?,
                    _ => return Err(decode_error("expected row array")),
                };
                Ok(Data::Table { columns, rows })
            }
            _ => Err(decode_error("malformed table tag")),
        },
        Cbor::Tag(TAG_RECORD, inner) => match *inner {
            Cbor::Array(mut parts) if parts.len() == 2 => {
                let fields = parts.pop().expect("len checked");
                let model = parts.pop().expect("len checked");
                let model = match model {
                    Cbor::Text(model) => model,
                    _ => return Err(decode_error("model name must be text")),
                };
                let fields = match fields {
                    Cbor::Map(pairs) => pairs
                        .into_iter()
                        .map(|(k, v)| match k {
                            Cbor::Text(k) => Ok((k, decode(v)?)),
                            _ => Err(decode_error("field name must be text")),
                        })
                        .collect::<Result<Vec<_>, _>>()?,
                    _ => return Err(decode_error("expected field map")),
                };
                Ok(Data::Record { model, fields })
            }
            _ => Err(decode_error("malformed record tag")),
        },
        Cbor::Tag(tag, _) => Err(decode_error(format!("unknown tag {tag}"))),
        _ => Err(decode_error("unsupported cbor shape")),
    }
}

impl Serialiser for CborSerialiser {
    fn tag(&self) -> &'static str {
        "cbor"
    }

    fn try_serialise(&self, data: &Data) -> Result<Option<(Vec<u8>, Metadata)>, CodecError> {
        if contains_handle(data) {
            return Ok(None);
        }
        let encoded = encode(data)?;
        let mut content = Vec::new();
        ciborium::into_writer(&encoded, &mut content).map_err(|err| CodecError::Encode {
            tag: "cbor".into(),
            reason: err.to_string(),
        })?;
        Ok(Some((content, Metadata::new())))
    }

    fn deserialise(&self, content: &[u8], _metadata: &Metadata) -> Result<Data, CodecError> {
        let value: Cbor = ciborium::from_reader(content).map_err(|err| decode_error(err.to_string()))?;
        decode(value)
    }
}
