// SPDX-License-Identifier: MIT OR Apache-2.0
//! Validated-record codec.
//!
//! Records name a model; the codec validates their fields against the
//! model's registered JSON Schema before encoding. Field order is preserved
//! by encoding fields as a pair array rather than an object.

use std::collections::BTreeMap;

use serde_json::{json, Value as Json};
use weft_core::{Data, Metadata};

use crate::{CodecError, Serialiser};

/// Record codec, tagged `model`.
#[derive(Default)]
pub struct ModelSerialiser {
    validators: BTreeMap<String, jsonschema::Validator>,
}

impl ModelSerialiser {
    /// A codec with no registered models; every record is rejected until
    /// models are added.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a model schema. Fails when the schema itself is invalid.
    pub fn with_model(mut self, name: impl Into<String>, schema: &Json) -> Result<Self, CodecError> {
        let name = name.into();
        let validator = jsonschema::validator_for(schema).map_err(|err| CodecError::Validation {
            model: name.clone(),
            reason: err.to_string(),
        })?;
        self.validators.insert(name, validator);
        Ok(self)
    }

    /// Registered model names.
    pub fn models(&self) -> Vec<&str> {
        self.validators.keys().map(String::as_str).collect()
    }
}

/// Convert a plain field value to JSON; `None` when the value has no JSON
/// form (handles, bytes, nested records, non-string dict keys).
fn field_to_json(data: &Data) -> Option<Json> {
    match data {
        Data::Null => Some(Json::Null),
        Data::Bool(b) => Some(json!(b)),
        Data::Int(i) => Some(json!(i)),
        Data::Float(f) => Some(json!(f)),
        Data::String(s) => Some(json!(s)),
        Data::List(items) => items.iter().map(field_to_json).collect::<Option<Vec<_>>>().map(Json::Array),
        Data::Dict(pairs) => {
            let mut object = serde_json::Map::new();
            for (key, value) in pairs {
                let Data::String(key) = key else { return None };
                object.insert(key.clone(), field_to_json(value)?);
            }
            Some(Json::Object(object))
        }
        _ => None,
    }
}

fn json_to_field(value: Json) -> Data {
    match value {
        Json::Null => Data::Null,
        Json::Bool(b) => Data::Bool(b),
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                Data::Int(i)
            } else {
                Data::Float(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Json::String(s) => Data::String(s),
        Json::Array(items) => Data::List(items.into_iter().map(json_to_field).collect()),
        Json::Object(object) => Data::Dict(
            object
                .into_iter()
                .map(|(k, v)| (Data::String(k), json_to_field(v)))
                .collect(),
        ),
    }
}

impl Serialiser for ModelSerialiser {
    fn tag(&self) -> &'static str {
        "model"
    }

    fn try_serialise(&self, data: &Data) -> Result<Option<(Vec<u8>, Metadata)>, CodecError> {
        let Data::Record { model, fields } = data else {
            return Ok(None);
        };
        let Some(validator) = self.validators.get(model) else {
            // Unknown models fall through to the next codec.
            return Ok(None);
        };

        let mut pairs = Vec::with_capacity(fields.len());
        let mut object = serde_json::Map::new();
        for (name, value) in fields {
            let Some(encoded) = field_to_json(value) else {
                return Ok(None);
            };
            object.insert(name.clone(), encoded.clone());
            pairs.push(json!([name, encoded]));
        }

        if let Err(err) = validator.validate(&Json::Object(object)) {
            return Err(CodecError::Validation {
                model: model.clone(),
                reason: err.to_string(),
            });
        }

        let content = serde_json::to_vec(&Json::Array(pairs))?;
        let mut metadata = Metadata::new();
        metadata.insert("model".into(), json!(model));
        Ok(Some((content, metadata)))
    }

    fn deserialise(&self, content: &[u8], metadata: &Metadata) -> Result<Data, CodecError> {
        let model = metadata
            .get("model")
            .and_then(Json::as_str)
            .ok_or_else(|| CodecError::Decode {
                tag: "model".into(),
                reason: "missing model name".into(),
            })?
            .to_string();
        let pairs: Vec<(String, Json)> =
            serde_json::from_slice(content).map_err(|err| CodecError::Decode {
                tag: "model".into(),
                reason: err.to_string(),
            })?;
        let fields = pairs
            .into_iter()
            .map(|(name, value)| (name, json_to_field(value)))
            .collect();
        Ok(Data::Record { model, fields })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point_codec() -> ModelSerialiser {
        ModelSerialiser::new()
            .with_model(
                "point",
                &json!({
                    "type": "object",
                    "properties": {"x": {"type": "integer"}, "y": {"type": "integer"}},
                    "required": ["x", "y"],
                }),
            )
            .unwrap()
    }

    fn point(x: i64, y: i64) -> Data {
        Data::Record {
            model: "point".into(),
            fields: vec![("x".into(), Data::Int(x)), ("y".into(), Data::Int(y))],
        }
    }

    #[test]
    fn valid_record_round_trips() {
        let codec = point_codec();
        let record = point(3, 4);
        let (content, metadata) = codec.try_serialise(&record).unwrap().unwrap();
        assert_eq!(metadata["model"], json!("point"));
        assert_eq!(codec.deserialise(&content, &metadata).unwrap(), record);
    }

    #[test]
    fn invalid_record_is_an_error_not_a_rejection() {
        let codec = point_codec();
        let record = Data::Record {
            model: "point".into(),
            fields: vec![("x".into(), Data::string("three"))],
        };
        assert!(matches!(
            codec.try_serialise(&record),
            Err(CodecError::Validation { .. })
        ));
    }

    #[test]
    fn unknown_model_is_rejected() {
        let codec = point_codec();
        let record = Data::Record {
            model: "vector".into(),
            fields: vec![],
        };
        assert!(codec.try_serialise(&record).unwrap().is_none());
    }

    #[test]
    fn field_order_is_preserved() {
        let codec = point_codec();
        let record = Data::Record {
            model: "point".into(),
            fields: vec![("y".into(), Data::Int(2)), ("x".into(), Data::Int(1))],
        };
        let (content, metadata) = codec.try_serialise(&record).unwrap().unwrap();
        assert_eq!(codec.deserialise(&content, &metadata).unwrap(), record);
    }
}
