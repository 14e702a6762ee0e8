// SPDX-License-Identifier: MIT OR Apache-2.0
//! The user-code API: free functions over the process-global channel.
//!
//! The worker installs the channel before invoking the target and tears it
//! down afterwards; exactly one execution runs per process. Target code
//! calls these functions directly.

use std::path::Path;
use std::sync::RwLock;
use std::time::Duration;

use serde_json::Value as Json;
use weft_core::{
    AssetHandle, Data, ExecutionHandle, LogLevel, Requires, TargetError, TargetType,
};

use crate::channel::Channel;
use crate::submit::SubmitOptions;

static CHANNEL: RwLock<Option<Channel>> = RwLock::new(None);

pub(crate) fn install(channel: Channel) {
    *CHANNEL.write().unwrap() = Some(channel);
}

pub(crate) fn teardown() {
    *CHANNEL.write().unwrap() = None;
}

fn current() -> Result<Channel, TargetError> {
    CHANNEL
        .read()
        .unwrap()
        .clone()
        .ok_or_else(|| TargetError::failure("not_in_context", "not running in an execution"))
}

/// Submit a child execution and get a lazy handle to its result.
pub fn submit(
    target_type: TargetType,
    repository: &str,
    target: &str,
    arguments: Vec<Data>,
    options: SubmitOptions,
) -> Result<ExecutionHandle, TargetError> {
    current()?.submit(target_type, repository, target, arguments, options)
}

/// Shorthand: submit a task with default options.
pub fn submit_task(
    repository: &str,
    target: &str,
    arguments: Vec<Data>,
) -> Result<ExecutionHandle, TargetError> {
    submit(
        TargetType::Task,
        repository,
        target,
        arguments,
        SubmitOptions::default(),
    )
}

/// Run `f` under a reference-resolution deadline. A miss inside the scope
/// surfaces as a suspension, which target code should propagate with `?`.
pub fn suspense<T>(timeout: Duration, f: impl FnOnce() -> T) -> Result<T, TargetError> {
    Ok(current()?.suspense(timeout, f))
}

/// An explicit suspension. Return `Err(suspend(delay))` from target code
/// to yield now and be re-executed later.
pub fn suspend(delay: Option<Duration>) -> TargetError {
    match current() {
        Ok(channel) => channel.suspend(delay),
        Err(err) => err,
    }
}

/// Capture and persist a file or directory from the working directory.
pub fn persist_asset(path: Option<&Path>, match_glob: Option<&str>) -> Result<AssetHandle, TargetError> {
    current()?.persist_asset(path, match_glob)
}

/// Report an argument snapshot the server may use to resume a retry.
pub fn checkpoint(arguments: &[Data]) -> Result<(), TargetError> {
    current()?.checkpoint(arguments)
}

/// The execution's working directory.
pub fn working_dir() -> Result<std::path::PathBuf, TargetError> {
    Ok(current()?.working_dir().to_path_buf())
}

/// Environment tag requirements builder re-export for submissions.
pub fn requires(pairs: &[(&str, &[&str])]) -> Requires {
    pairs
        .iter()
        .map(|(key, values)| {
            (
                key.to_string(),
                values.iter().map(|v| v.to_string()).collect(),
            )
        })
        .collect()
}

/// Log at debug level.
pub fn log_debug(template: &str, labels: &[(&str, Json)]) -> Result<(), TargetError> {
    current()?.log(LogLevel::Debug, template, labels)
}

/// Log at info level.
pub fn log_info(template: &str, labels: &[(&str, Json)]) -> Result<(), TargetError> {
    current()?.log(LogLevel::Info, template, labels)
}

/// Log at warning level.
pub fn log_warning(template: &str, labels: &[(&str, Json)]) -> Result<(), TargetError> {
    current()?.log(LogLevel::Warning, template, labels)
}

/// Log at error level.
pub fn log_error(template: &str, labels: &[(&str, Json)]) -> Result<(), TargetError> {
    current()?.log(LogLevel::Error, template, labels)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outside_an_execution_everything_errors() {
        teardown();
        let err = submit_task("repo", "t", vec![]).unwrap_err();
        assert_eq!(err.detail().unwrap().type_name, "not_in_context");
        assert!(checkpoint(&[]).is_err());
        assert!(log_info("x", &[]).is_err());
    }

    #[test]
    fn requires_builder_shapes() {
        let tags = requires(&[("gpu", &["a100"]), ("region", &["eu", "us"])]);
        assert_eq!(tags["gpu"], vec!["a100"]);
        assert_eq!(tags["region"].len(), 2);
    }
}
