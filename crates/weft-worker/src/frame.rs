// SPDX-License-Identifier: MIT OR Apache-2.0
//! Parent ↔ child frames: JSONL with a `"t"` discriminator tag.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use weft_core::{
    AssetId, ErrorDetail, ExecutionId, LogLevel, Metadata, Requires, Retries, TargetType, Value,
};

use crate::WorkerError;

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// The work order delivered to a freshly spawned worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartExecution {
    /// Server-assigned execution id.
    pub execution_id: ExecutionId,
    /// Repository the target lives in.
    pub repository: String,
    /// Target name.
    pub target: String,
    /// Serialised arguments, in call order.
    pub arguments: Vec<Value>,
}

/// Cache declaration resolved to a key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheKey {
    /// The derived cache key (opaque to the server-facing layers).
    pub key: String,
    /// Maximum acceptable age in milliseconds, if bounded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age_ms: Option<u64>,
}

/// A child-computed submission, ready for the manager to forward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitSpec {
    /// Kind of target being submitted.
    #[serde(rename = "type")]
    pub target_type: TargetType,
    /// Repository of the submitted target.
    pub repository: String,
    /// Name of the submitted target.
    pub target: String,
    /// Serialised arguments.
    pub arguments: Vec<Value>,
    /// Argument positions the server resolves before dispatch.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub wait_for: Vec<usize>,
    /// Cache key, when caching was requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheKey>,
    /// Dedup key, when deferral was requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defer_key: Option<String>,
    /// Memo key, when memoisation was requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memo_key: Option<String>,
    /// Earliest execution time (unix ms).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execute_after_ms: Option<u64>,
    /// Retry policy.
    pub retries: Retries,
    /// Environment tag requirements.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires: Option<Requires>,
}

/// What kind of filesystem entry an asset captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    /// A single file, uploaded verbatim.
    File,
    /// A directory, archived before upload.
    Directory,
}

/// A persisted asset as looked up from the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetLookup {
    /// File or directory.
    pub kind: AssetKind,
    /// The path the asset was captured from, relative to its execution's
    /// working directory.
    pub path: String,
    /// Content address of the backing blob.
    pub blob_key: weft_core::BlobKey,
}

/// A captured asset, ready to be persisted by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetEntry {
    /// File or directory.
    pub kind: AssetKind,
    /// Path relative to the execution's working directory.
    pub path: String,
    /// Content address of the uploaded file or archive.
    pub blob_key: weft_core::BlobKey,
    /// Uploaded size in bytes.
    pub size: u64,
    /// Capture metadata (entry counts, sizes).
    pub metadata: Metadata,
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

/// Child → parent frames: notifications plus correlated requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum ChildFrame {
    /// Arguments are materialised; user code is about to run.
    Executing,
    /// Terminal success.
    Result {
        /// The serialised result.
        value: Value,
    },
    /// Terminal failure.
    Error {
        /// The captured error.
        error: ErrorDetail,
    },
    /// Terminal suspension on unresolved references.
    Suspend {
        /// Earliest re-execution time (unix ms), if requested.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        execute_after_ms: Option<u64>,
        /// Executions whose results were pending.
        waiting_on: Vec<ExecutionId>,
    },
    /// Informational argument snapshot for retries.
    Checkpoint {
        /// Serialised checkpoint arguments.
        arguments: Vec<Value>,
    },
    /// A structured log message.
    Log {
        /// Severity.
        level: LogLevel,
        /// Message template.
        template: String,
        /// Structured label values.
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        labels: BTreeMap<String, Json>,
        /// Unix milliseconds.
        timestamp_ms: u64,
    },
    /// Request: submit a child execution.
    Submit {
        /// Correlation id.
        id: u64,
        /// The submission.
        spec: SubmitSpec,
    },
    /// Request: resolve another execution's result.
    Resolve {
        /// Correlation id.
        id: u64,
        /// The execution to resolve.
        execution_id: ExecutionId,
    },
    /// Request: persist a captured asset.
    PersistAsset {
        /// Correlation id.
        id: u64,
        /// The captured asset.
        entry: AssetEntry,
    },
    /// Request: look up a persisted asset.
    ResolveAsset {
        /// Correlation id.
        id: u64,
        /// The asset to look up.
        asset_id: AssetId,
    },
}

impl ChildFrame {
    /// The correlation id, when this frame is a request.
    pub fn request_id(&self) -> Option<u64> {
        match self {
            ChildFrame::Submit { id, .. }
            | ChildFrame::Resolve { id, .. }
            | ChildFrame::PersistAsset { id, .. }
            | ChildFrame::ResolveAsset { id, .. } => Some(*id),
            _ => None,
        }
    }

    /// Returns `true` for the frames that end an execution.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ChildFrame::Result { .. } | ChildFrame::Error { .. } | ChildFrame::Suspend { .. }
        )
    }
}

/// Parent → child frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum ParentFrame {
    /// The initial work order.
    Start {
        /// The execution to run.
        execution: StartExecution,
    },
    /// Success response to a child request.
    Response {
        /// Correlated request id.
        id: u64,
        /// The result payload.
        result: Json,
    },
    /// Error response to a child request.
    ResponseError {
        /// Correlated request id.
        id: u64,
        /// Failure description.
        error: String,
    },
}

// ---------------------------------------------------------------------------
// JSONL codec
// ---------------------------------------------------------------------------

/// Encode a frame as one newline-terminated JSON line.
pub fn encode_line<T: Serialize>(frame: &T) -> Result<String, WorkerError> {
    let mut line = serde_json::to_string(frame).map_err(WorkerError::Encode)?;
    line.push('\n');
    Ok(line)
}

/// Decode one JSON line into a frame.
pub fn decode_line<'a, T: Deserialize<'a>>(line: &'a str) -> Result<T, WorkerError> {
    serde_json::from_str(line.trim_end()).map_err(WorkerError::Decode)
}
