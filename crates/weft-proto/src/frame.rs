// SPDX-License-Identifier: MIT OR Apache-2.0
//! Wire frames: positional JSON arrays tagged by a leading integer.

use serde_json::{json, Value as Json};

use crate::ProtoError;

// ---------------------------------------------------------------------------
// Server → client
// ---------------------------------------------------------------------------

/// A frame received from the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    /// `[0, session_id]`: identity announcement, first frame per connect.
    Session {
        /// The server-issued session identifier.
        session_id: String,
    },
    /// `[1, {request, params}]`: fire-and-forget command.
    Command {
        /// Command name.
        request: String,
        /// Positional parameters.
        params: Vec<Json>,
    },
    /// `[2, id, result]`: success response to a client request.
    Response {
        /// The correlated request id.
        id: u64,
        /// The result payload.
        result: Json,
    },
    /// `[3, id, error]`: error response to a client request.
    ResponseError {
        /// The correlated request id.
        id: u64,
        /// The error payload.
        error: Json,
    },
}

impl ServerFrame {
    /// Parse a text frame.
    pub fn parse(text: &str) -> Result<Self, ProtoError> {
        let value: Json =
            serde_json::from_str(text).map_err(|err| ProtoError::Frame(err.to_string()))?;
        let items = value
            .as_array()
            .ok_or_else(|| ProtoError::Frame(format!("expected array frame: {value}")))?;
        let malformed = || ProtoError::Frame(format!("malformed frame: {value}"));
        match items.first().and_then(Json::as_u64) {
            Some(0) if items.len() == 2 => {
                let session_id = items[1].as_str().ok_or_else(malformed)?;
                Ok(ServerFrame::Session {
                    session_id: session_id.to_string(),
                })
            }
            Some(1) if items.len() == 2 => {
                let body = items[1].as_object().ok_or_else(malformed)?;
                let request = body
                    .get("request")
                    .and_then(Json::as_str)
                    .ok_or_else(malformed)?;
                let params = match body.get("params") {
                    Some(params) => params.as_array().ok_or_else(malformed)?.clone(),
                    None => Vec::new(),
                };
                Ok(ServerFrame::Command {
                    request: request.to_string(),
                    params,
                })
            }
            Some(2) if items.len() == 3 => Ok(ServerFrame::Response {
                id: items[1].as_u64().ok_or_else(malformed)?,
                result: items[2].clone(),
            }),
            Some(3) if items.len() == 3 => Ok(ServerFrame::ResponseError {
                id: items[1].as_u64().ok_or_else(malformed)?,
                error: items[2].clone(),
            }),
            _ => Err(malformed()),
        }
    }
}

// ---------------------------------------------------------------------------
// Client → server
// ---------------------------------------------------------------------------

/// A frame sent to the server: a notification, or a request when `id` is
/// set.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientFrame {
    /// Request name.
    pub request: String,
    /// Positional parameters.
    pub params: Vec<Json>,
    /// Correlation id; present only for requests expecting a response.
    pub id: Option<u64>,
}

impl ClientFrame {
    /// A fire-and-forget notification.
    pub fn notification(request: impl Into<String>, params: Vec<Json>) -> Self {
        Self {
            request: request.into(),
            params,
            id: None,
        }
    }

    /// A correlated request.
    pub fn request(request: impl Into<String>, params: Vec<Json>, id: u64) -> Self {
        Self {
            request: request.into(),
            params,
            id: Some(id),
        }
    }

    /// Encode to the wire text.
    pub fn encode(&self) -> String {
        let mut body = json!({"request": self.request});
        if !self.params.is_empty() {
            body["params"] = Json::Array(self.params.clone());
        }
        if let Some(id) = self.id {
            body["id"] = json!(id);
        }
        body.to_string()
    }
}
