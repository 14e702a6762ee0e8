// SPDX-License-Identifier: MIT OR Apache-2.0
//! Target metadata: what a repository declares about each registered
//! workflow, task, or sensor.

use std::collections::BTreeMap;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value as Json;

/// The kind of a registered target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    /// A top-level orchestration entry point.
    Workflow,
    /// A unit of work submitted by workflows or other tasks.
    Task,
    /// A long-running poller that checkpoints a cursor between runs.
    Sensor,
}

impl TargetType {
    /// The wire name of the type.
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetType::Workflow => "workflow",
            TargetType::Task => "task",
            TargetType::Sensor => "sensor",
        }
    }
}

/// One declared parameter of a target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    /// Parameter name.
    pub name: String,
    /// Display annotation (type hint), if declared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotation: Option<String>,
    /// Rendered default value, if the parameter is optional.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

impl Parameter {
    /// A required parameter with no annotation.
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            annotation: None,
            default: None,
        }
    }

    /// An optional parameter whose default is rendered as `default`.
    pub fn optional(name: impl Into<String>, default: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            annotation: None,
            default: Some(default.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Parameter selections
// ---------------------------------------------------------------------------

/// Which argument positions participate in a derived key.
///
/// On the wire this is either `true` (all) or a list of indexes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamSelection {
    /// Every argument participates.
    All,
    /// Only the listed argument positions participate.
    Indexes(Vec<usize>),
}

impl Serialize for ParamSelection {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ParamSelection::All => serializer.serialize_bool(true),
            ParamSelection::Indexes(indexes) => indexes.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for ParamSelection {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Json::deserialize(deserializer)? {
            Json::Bool(true) => Ok(ParamSelection::All),
            Json::Array(items) => {
                let indexes = items
                    .into_iter()
                    .map(|item| {
                        item.as_u64()
                            .map(|index| index as usize)
                            .ok_or_else(|| D::Error::custom("expected parameter index"))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(ParamSelection::Indexes(indexes))
            }
            other => Err(D::Error::custom(format!(
                "expected true or index list, got {other}"
            ))),
        }
    }
}

/// Caching declaration: which params key the cache, and its bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cache {
    /// Argument positions that form the cache key.
    pub params: ParamSelection,
    /// Maximum acceptable age in seconds, if bounded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age: Option<f64>,
    /// Key namespace; defaults to `repository:target` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Version string mixed into the key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Deferral declaration: collapse duplicate pending submissions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Defer {
    /// Argument positions that form the dedup key.
    pub params: ParamSelection,
}

/// Retry policy for failed executions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Retries {
    /// Maximum number of retries.
    pub limit: u32,
    /// Minimum delay before a retry, in seconds.
    pub delay_min: u32,
    /// Maximum delay before a retry, in seconds.
    pub delay_max: u32,
}

impl Retries {
    /// A fixed number of immediate retries.
    pub fn limit(limit: u32) -> Self {
        Self {
            limit,
            delay_min: 0,
            delay_max: 0,
        }
    }
}

/// Tag requirements an execution places on the environment that runs it.
pub type Requires = BTreeMap<String, Vec<String>>;

// ---------------------------------------------------------------------------
// Target
// ---------------------------------------------------------------------------

/// Everything a repository declares about one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    /// Target kind.
    #[serde(rename = "type")]
    pub target_type: TargetType,
    /// Declared parameters, in call order.
    pub parameters: Vec<Parameter>,
    /// Argument positions resolved (awaited) before dispatch.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub wait_for: Vec<usize>,
    /// Caching declaration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<Cache>,
    /// Deferral declaration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defer: Option<Defer>,
    /// Scheduling delay in milliseconds applied to every submission.
    #[serde(default)]
    pub delay_ms: u64,
    /// Retry policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<Retries>,
    /// Memoisation declaration; absent means off.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memo: Option<ParamSelection>,
    /// Environment tag requirements.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires: Option<Requires>,
}

impl Target {
    /// A target of the given kind with the given parameters and no
    /// scheduling declarations.
    pub fn new(target_type: TargetType, parameters: Vec<Parameter>) -> Self {
        Self {
            target_type,
            parameters,
            wait_for: Vec::new(),
            cache: None,
            defer: None,
            delay_ms: 0,
            retries: None,
            memo: None,
            requires: None,
        }
    }
}

// ---------------------------------------------------------------------------
// LogLevel
// ---------------------------------------------------------------------------

/// Log severity, numeric on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    /// Diagnostic detail.
    Debug,
    /// Normal progress; captured stdout lands here.
    Info,
    /// Something suspect but not fatal.
    Warning,
    /// A failure; captured stderr lands here.
    Error,
}

impl LogLevel {
    /// The numeric wire encoding.
    pub fn as_wire(&self) -> u8 {
        match self {
            LogLevel::Debug => 0,
            LogLevel::Info => 1,
            LogLevel::Warning => 2,
            LogLevel::Error => 3,
        }
    }

    /// Decode the numeric wire encoding.
    pub fn from_wire(level: u8) -> Option<Self> {
        match level {
            0 => Some(LogLevel::Debug),
            1 => Some(LogLevel::Info),
            2 => Some(LogLevel::Warning),
            3 => Some(LogLevel::Error),
            _ => None,
        }
    }
}

impl Serialize for LogLevel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.as_wire())
    }
}

impl<'de> Deserialize<'de> for LogLevel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let level = u8::deserialize(deserializer)?;
        LogLevel::from_wire(level)
            .ok_or_else(|| D::Error::custom(format!("unknown log level {level}")))
    }
}
