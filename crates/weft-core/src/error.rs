// SPDX-License-Identifier: MIT OR Apache-2.0
//! Envelope parse errors and the error channel visible to target code.

use serde_json::Value as Json;
use thiserror::Error;

use crate::result::{ErrorDetail, ErrorFrame};
use crate::ExecutionId;

// ---------------------------------------------------------------------------
// EnvelopeError
// ---------------------------------------------------------------------------

/// A wire envelope failed to parse.
#[derive(Debug, Clone, Error)]
pub enum EnvelopeError {
    /// A value envelope had an unknown tag or malformed fields.
    #[error("unexpected value: {0}")]
    UnexpectedValue(String),

    /// A reference entry had an unknown kind or malformed fields.
    #[error("unexpected reference: {0}")]
    UnexpectedReference(String),

    /// A result envelope had an unknown tag or malformed fields.
    #[error("unexpected result: {0}")]
    UnexpectedResult(String),

    /// A blob key was not a lowercase hex SHA-256 digest.
    #[error("invalid blob key: {0}")]
    InvalidBlobKey(String),
}

impl EnvelopeError {
    pub(crate) fn unexpected_value(value: &Json) -> Self {
        EnvelopeError::UnexpectedValue(value.to_string())
    }

    pub(crate) fn unexpected_reference(value: &Json) -> Self {
        EnvelopeError::UnexpectedReference(value.to_string())
    }

    pub(crate) fn unexpected_result(value: &Json) -> Self {
        EnvelopeError::UnexpectedResult(value.to_string())
    }
}

// ---------------------------------------------------------------------------
// TargetError
// ---------------------------------------------------------------------------

/// The error channel of target code.
///
/// `Failure` is reported to the server as a `put_error`; `Suspended` is the
/// suspension marker that propagates out of a deadline-missed reference
/// resolution (or an explicit `suspend()`), which the worker converts into a
/// `suspend` notification and a clean exit. User code is expected to let
/// both pass through with `?`.
#[derive(Debug, Clone, Error)]
pub enum TargetError {
    /// A failure with a type tag, message, and optional stack frames.
    #[error("{type_name}: {message}")]
    Failure {
        /// Error type tag; remote errors keep their original tag so user
        /// code can match on it.
        type_name: String,
        /// Human-readable message.
        message: String,
        /// Captured stack frames, innermost last.
        frames: Vec<ErrorFrame>,
    },

    /// The execution is yielding on unresolved references.
    #[error("suspended waiting on {waiting_on:?}")]
    Suspended {
        /// Earliest time (unix ms) the server should re-execute, if any.
        execute_after_ms: Option<u64>,
        /// Executions whose results were still pending.
        waiting_on: Vec<ExecutionId>,
    },
}

impl TargetError {
    /// A failure with an explicit type tag.
    pub fn failure(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        TargetError::Failure {
            type_name: type_name.into(),
            message: message.into(),
            frames: Vec::new(),
        }
    }

    /// A generic failure tagged `"error"`.
    pub fn message(message: impl Into<String>) -> Self {
        TargetError::failure("error", message)
    }

    /// A failure that preserves a remote error's type tag, so downstream
    /// catch blocks can still match on it.
    pub fn remote(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        TargetError::failure(type_name, message)
    }

    pub(crate) fn detached_handle(kind: &str, id: u64) -> Self {
        TargetError::failure(
            "detached_handle",
            format!("{kind} handle ({id}) has no bound capability"),
        )
    }

    /// The failure detail, if this is a failure.
    pub fn detail(&self) -> Option<ErrorDetail> {
        match self {
            TargetError::Failure {
                type_name,
                message,
                frames,
            } => Some(ErrorDetail {
                type_name: type_name.clone(),
                message: message.clone(),
                frames: frames.clone(),
            }),
            TargetError::Suspended { .. } => None,
        }
    }
}

impl From<ErrorDetail> for TargetError {
    fn from(detail: ErrorDetail) -> Self {
        TargetError::Failure {
            type_name: detail.type_name,
            message: detail.message,
            frames: detail.frames,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_preserves_remote_tag() {
        let err = TargetError::remote("KeyError", "missing 'x'");
        match &err {
            TargetError::Failure { type_name, .. } => assert_eq!(type_name, "KeyError"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(err.detail().unwrap().type_name, "KeyError");
    }

    #[test]
    fn suspended_has_no_detail() {
        let err = TargetError::Suspended {
            execute_after_ms: None,
            waiting_on: vec![3],
        };
        assert!(err.detail().is_none());
    }
}
