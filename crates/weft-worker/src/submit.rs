// SPDX-License-Identifier: MIT OR Apache-2.0
//! Submission options and derived cache/defer/memo keys.
//!
//! Keys are opaque SHA-256 strings over the serialised argument envelopes;
//! the worker computes them and passes them through without interpreting
//! their contents.

use std::time::Duration;

use weft_blob::key_of;
use weft_core::{Cache, Defer, ParamSelection, Requires, Retries, Value};

use crate::frame::CacheKey;

/// Per-submission scheduling options.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Argument positions the server resolves before dispatch.
    pub wait_for: Vec<usize>,
    /// Caching declaration.
    pub cache: Option<Cache>,
    /// Deferral declaration.
    pub defer: Option<Defer>,
    /// Memoisation declaration.
    pub memo: Option<ParamSelection>,
    /// Retry policy; `None` means no retries.
    pub retries: Option<Retries>,
    /// Absolute earliest execution time (unix ms).
    pub execute_after_ms: Option<u64>,
    /// Relative scheduling delay, added to `execute_after_ms` (or to now).
    pub delay: Option<Duration>,
    /// Environment tag requirements.
    pub requires: Option<Requires>,
}

/// Derive an opaque key from the selected argument envelopes.
///
/// The key is the SHA-256 of the canonical envelope JSON of each selected
/// argument, NUL-separated, with an optional NUL-separated prefix.
pub fn derive_key(selection: &ParamSelection, arguments: &[Value], prefix: Option<&str>) -> String {
    let mut buffer = Vec::new();
    if let Some(prefix) = prefix {
        buffer.extend_from_slice(prefix.as_bytes());
        buffer.push(0);
    }
    let mut feed = |value: &Value| {
        buffer.extend_from_slice(value.to_json().to_string().as_bytes());
        buffer.push(0);
    };
    match selection {
        ParamSelection::All => arguments.iter().for_each(&mut feed),
        ParamSelection::Indexes(indexes) => {
            for index in indexes {
                if let Some(value) = arguments.get(*index) {
                    feed(value);
                }
            }
        }
    }
    key_of(&buffer).as_str().to_string()
}

/// The cache key for a submission, when caching was requested.
pub fn cache_key(
    cache: &Cache,
    arguments: &[Value],
    repository: &str,
    target: &str,
) -> CacheKey {
    let namespace = cache
        .namespace
        .clone()
        .unwrap_or_else(|| format!("{repository}:{target}"));
    let prefix = match &cache.version {
        Some(version) => format!("{namespace}\u{0}{version}"),
        None => namespace,
    };
    CacheKey {
        key: derive_key(&cache.params, arguments, Some(&prefix)),
        max_age_ms: cache.max_age.map(|secs| (secs * 1000.0) as u64),
    }
}

/// The dedup key for a submission, when deferral was requested.
pub fn defer_key(defer: &Defer, arguments: &[Value]) -> String {
    derive_key(&defer.params, arguments, None)
}

/// The memo key for a submission, when memoisation was requested.
pub fn memo_key(
    memo: &ParamSelection,
    arguments: &[Value],
    repository: &str,
    target: &str,
) -> String {
    derive_key(memo, arguments, Some(&format!("{repository}:{target}")))
}
