// SPDX-License-Identifier: MIT OR Apache-2.0
//! The result envelope reported for a finished execution.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value as Json};

use crate::error::EnvelopeError;
use crate::value::Value;

// ---------------------------------------------------------------------------
// ErrorFrame / ErrorDetail
// ---------------------------------------------------------------------------

/// One stack frame of a captured user error: `[file, line, func, src?]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorFrame {
    /// Source file path.
    pub file: String,
    /// 1-based line number.
    pub line: u32,
    /// Enclosing function name.
    pub func: String,
    /// The source line, when available.
    pub src: Option<String>,
}

impl ErrorFrame {
    fn to_json(&self) -> Json {
        match &self.src {
            Some(src) => json!([self.file, self.line, self.func, src]),
            None => json!([self.file, self.line, self.func]),
        }
    }

    fn from_json(value: &Json) -> Result<Self, EnvelopeError> {
        let items = value
            .as_array()
            .filter(|items| items.len() == 3 || items.len() == 4)
            .ok_or_else(|| EnvelopeError::unexpected_result(value))?;
        let file = items[0]
            .as_str()
            .ok_or_else(|| EnvelopeError::unexpected_result(value))?;
        let line = items[1]
            .as_u64()
            .ok_or_else(|| EnvelopeError::unexpected_result(value))?;
        let func = items[2]
            .as_str()
            .ok_or_else(|| EnvelopeError::unexpected_result(value))?;
        let src = match items.get(3) {
            Some(src) => Some(
                src.as_str()
                    .ok_or_else(|| EnvelopeError::unexpected_result(value))?
                    .to_string(),
            ),
            None => None,
        };
        Ok(ErrorFrame {
            file: file.to_string(),
            line: line as u32,
            func: func.to_string(),
            src,
        })
    }
}

/// A captured user error: type tag, message, and stack frames.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// The error's type name (e.g. the remote exception class).
    pub type_name: String,
    /// Human-readable message.
    pub message: String,
    /// Innermost-last stack frames, possibly empty.
    pub frames: Vec<ErrorFrame>,
}

impl ErrorDetail {
    /// An error with no frames.
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            message: message.into(),
            frames: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// ResultEnvelope
// ---------------------------------------------------------------------------

/// Tagged sum reported for a finished execution.
///
/// All five wire tags are accepted on parse; `Abandoned` and `Cancelled`
/// are distinguished by the server, not interpreted here.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultEnvelope {
    /// Successful completion with a value.
    Value(Value),
    /// Failure inside target code.
    Error(ErrorDetail),
    /// The worker died without reporting a terminal event.
    Abandoned,
    /// The execution was aborted.
    Cancelled,
    /// The execution yielded and will be re-executed later.
    Suspended,
}

impl ResultEnvelope {
    /// Encode to the positional wire array.
    pub fn to_json(&self) -> Json {
        match self {
            ResultEnvelope::Value(value) => json!(["value", value.to_json()]),
            ResultEnvelope::Error(detail) => {
                let frames: Vec<Json> = detail.frames.iter().map(ErrorFrame::to_json).collect();
                json!(["error", detail.type_name, detail.message, frames])
            }
            ResultEnvelope::Abandoned => json!(["abandoned"]),
            ResultEnvelope::Cancelled => json!(["cancelled"]),
            ResultEnvelope::Suspended => json!(["suspended"]),
        }
    }

    /// Decode from the positional wire array.
    pub fn from_json(value: &Json) -> Result<Self, EnvelopeError> {
        let items = value
            .as_array()
            .ok_or_else(|| EnvelopeError::unexpected_result(value))?;
        match items.first().and_then(Json::as_str) {
            Some("value") if items.len() == 2 => Ok(ResultEnvelope::Value(Value::from_json(&items[1])?)),
            Some("error") if items.len() == 4 => {
                let type_name = items[1]
                    .as_str()
                    .ok_or_else(|| EnvelopeError::unexpected_result(value))?;
                let message = items[2]
                    .as_str()
                    .ok_or_else(|| EnvelopeError::unexpected_result(value))?;
                let frames = items[3]
                    .as_array()
                    .ok_or_else(|| EnvelopeError::unexpected_result(value))?
                    .iter()
                    .map(ErrorFrame::from_json)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(ResultEnvelope::Error(ErrorDetail {
                    type_name: type_name.to_string(),
                    message: message.to_string(),
                    frames,
                }))
            }
            Some("abandoned") if items.len() == 1 => Ok(ResultEnvelope::Abandoned),
            Some("cancelled") if items.len() == 1 => Ok(ResultEnvelope::Cancelled),
            Some("suspended") if items.len() == 1 => Ok(ResultEnvelope::Suspended),
            _ => Err(EnvelopeError::unexpected_result(value)),
        }
    }
}

impl Serialize for ResultEnvelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ResultEnvelope {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Json::deserialize(deserializer)?;
        ResultEnvelope::from_json(&value).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_tags_round_trip() {
        let envelopes = [
            ResultEnvelope::Value(Value::raw(json!(3))),
            ResultEnvelope::Error(ErrorDetail {
                type_name: "ValueError".into(),
                message: "bad input".into(),
                frames: vec![ErrorFrame {
                    file: "flow.rs".into(),
                    line: 10,
                    func: "run".into(),
                    src: Some("let x = parse()?;".into()),
                }],
            }),
            ResultEnvelope::Abandoned,
            ResultEnvelope::Cancelled,
            ResultEnvelope::Suspended,
        ];
        for envelope in envelopes {
            let encoded = envelope.to_json();
            assert_eq!(ResultEnvelope::from_json(&encoded).unwrap(), envelope);
        }
    }

    #[test]
    fn frames_without_src_round_trip() {
        let frame = ErrorFrame {
            file: "a.rs".into(),
            line: 1,
            func: "f".into(),
            src: None,
        };
        assert_eq!(frame.to_json().as_array().unwrap().len(), 3);
        assert_eq!(ErrorFrame::from_json(&frame.to_json()).unwrap(), frame);
    }

    #[test]
    fn unknown_tag_is_rejected() {
        assert!(ResultEnvelope::from_json(&json!(["finished"])).is_err());
        assert!(ResultEnvelope::from_json(&json!(["value"])).is_err());
    }
}
