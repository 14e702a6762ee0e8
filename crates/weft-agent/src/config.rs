// SPDX-License-Identifier: MIT OR Apache-2.0
//! Agent configuration: `weft.toml` plus CLI overrides.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use weft_blob::{BlobStore, HttpStore, S3Store, StoreChain};
use weft_codec::{CborSerialiser, ModelSerialiser, SerialiserRegistry, TableSerialiser};

/// Errors from loading or applying configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("cannot read config {path}: {reason}")]
    Unreadable {
        /// Path that was requested.
        path: String,
        /// Underlying failure.
        reason: String,
    },

    /// The file is not valid TOML for this schema.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config names a serialiser that does not exist.
    #[error("unknown serialiser '{0}'")]
    UnknownSerialiser(String),

    /// A model schema failed to compile.
    #[error("invalid model schema '{name}': {reason}")]
    InvalidModel {
        /// Model name.
        name: String,
        /// Compilation failure.
        reason: String,
    },
}

/// One blob store backend declaration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlobStoreConfig {
    /// The orchestrator's HTTP blob endpoint (or any compatible one).
    Http {
        /// Base URL; defaults to `http://{host}`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
    },
    /// An S3 bucket.
    S3 {
        /// Bucket name.
        bucket: String,
        /// Optional key prefix.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prefix: Option<String>,
    },
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_blob_threshold() -> usize {
    weft_codec::DEFAULT_BLOB_THRESHOLD
}

fn default_serialisers() -> Vec<String> {
    vec!["table".into(), "model".into(), "cbor".into()]
}

/// Agent settings, usually loaded from `weft.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
    /// Orchestrator host, e.g. `localhost:7777`.
    pub host: String,
    /// Project identifier.
    pub project: String,
    /// Environment name.
    #[serde(default = "default_environment")]
    pub environment: String,
    /// Capability tags this agent provides.
    #[serde(default)]
    pub provides: BTreeMap<String, Vec<String>>,
    /// Concurrency declared to the server; the server caps dispatch, the
    /// agent does not self-enforce.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<u32>,
    /// One-shot launch identifier handed over on first connect.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub launch_id: Option<String>,
    /// Envelope size above which values are offloaded to the blob store.
    #[serde(default = "default_blob_threshold")]
    pub blob_threshold: usize,
    /// Blob backends, queried in order. Defaults to the orchestrator's
    /// HTTP endpoint.
    #[serde(default)]
    pub blob_stores: Vec<BlobStoreConfig>,
    /// Enabled serialisers, tried in declaration order.
    #[serde(default = "default_serialisers")]
    pub serialisers: Vec<String>,
    /// Model schemas for the `model` serialiser, keyed by name.
    #[serde(default)]
    pub models: BTreeMap<String, serde_json::Value>,
    /// Seconds a worker gets between SIGINT and SIGKILL on abort.
    #[serde(default = "default_grace")]
    pub abort_grace_secs: u64,
}

fn default_grace() -> u64 {
    5
}

impl AgentConfig {
    /// Load from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|err| ConfigError::Unreadable {
            path: path.display().to_string(),
            reason: err.to_string(),
        })?;
        Ok(toml::from_str(&raw)?)
    }

    /// Build the blob store chain this config declares.
    pub async fn build_stores(&self) -> StoreChain {
        let mut backends: Vec<Arc<dyn BlobStore>> = Vec::new();
        for store in &self.blob_stores {
            match store {
                BlobStoreConfig::Http { url } => {
                    let url = url
                        .clone()
                        .unwrap_or_else(|| format!("http://{}", self.host));
                    backends.push(Arc::new(HttpStore::new(url)));
                }
                BlobStoreConfig::S3 { bucket, prefix } => {
                    backends.push(Arc::new(
                        S3Store::from_env(bucket.as_str(), prefix.clone()).await,
                    ));
                }
            }
        }
        if backends.is_empty() {
            backends.push(Arc::new(HttpStore::new(format!("http://{}", self.host))));
        }
        StoreChain::new(backends)
    }

    /// Build the serialiser registry this config declares, in order.
    pub fn build_serialisers(&self) -> Result<SerialiserRegistry, ConfigError> {
        let mut serialisers: Vec<Arc<dyn weft_codec::Serialiser>> = Vec::new();
        for name in &self.serialisers {
            match name.as_str() {
                "table" => serialisers.push(Arc::new(TableSerialiser::new())),
                "cbor" => serialisers.push(Arc::new(CborSerialiser::new())),
                "model" => {
                    let mut model = ModelSerialiser::new();
                    for (name, schema) in &self.models {
                        model = model.with_model(name, schema).map_err(|err| {
                            ConfigError::InvalidModel {
                                name: name.clone(),
                                reason: err.to_string(),
                            }
                        })?;
                    }
                    serialisers.push(Arc::new(model));
                }
                other => return Err(ConfigError::UnknownSerialiser(other.to_string())),
            }
        }
        Ok(SerialiserRegistry::new(serialisers))
    }
}
