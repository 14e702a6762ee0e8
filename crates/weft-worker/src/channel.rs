// SPDX-License-Identifier: MIT OR Apache-2.0
//! The execution channel: the bridge between isolated target code and the
//! agent.
//!
//! Every method here is a suspension point: it observes a pending abort,
//! may block on the parent, and inside a suspense scope it may convert a
//! deadline miss into a suspension. User code runs on its own thread; the
//! channel bridges into the worker's runtime for blob and pipe I/O.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value as Json;
use tokio::sync::{mpsc, oneshot};
use weft_blob::BlobStore;
use weft_codec::{Capabilities, SerialiserRegistry};
use weft_core::{
    AssetHandle, AssetId, Data, ExecutionHandle, ExecutionId, LogLevel, ResolveResult,
    RestoreAsset, ResultEnvelope, TargetError, TargetType, Value,
};

use crate::assets;
use crate::frame::{AssetLookup, ChildFrame, SubmitSpec};
use crate::submit::{self, SubmitOptions};

type ResponseSender = oneshot::Sender<Result<Json, String>>;

struct Shared {
    execution_id: ExecutionId,
    working_dir: PathBuf,
    frames: mpsc::UnboundedSender<ChildFrame>,
    pending: Mutex<HashMap<u64, ResponseSender>>,
    next_request: AtomicU64,
    aborted: AtomicBool,
    terminal: AtomicBool,
    suspense: Mutex<Option<Instant>>,
    runtime: tokio::runtime::Handle,
    store: Arc<dyn BlobStore>,
    serialisers: SerialiserRegistry,
    threshold: usize,
}

/// The per-execution channel. Cheap to clone; one lives as process-global
/// state for the duration of the execution.
#[derive(Clone)]
pub struct Channel {
    shared: Arc<Shared>,
}

impl Channel {
    /// Create a channel and the frame stream its pump consumes.
    pub fn new(
        execution_id: ExecutionId,
        working_dir: PathBuf,
        runtime: tokio::runtime::Handle,
        store: Arc<dyn BlobStore>,
        serialisers: SerialiserRegistry,
        threshold: usize,
    ) -> (Self, mpsc::UnboundedReceiver<ChildFrame>) {
        let (frames, frame_rx) = mpsc::unbounded_channel();
        let channel = Self {
            shared: Arc::new(Shared {
                execution_id,
                working_dir,
                frames,
                pending: Mutex::new(HashMap::new()),
                next_request: AtomicU64::new(0),
                aborted: AtomicBool::new(false),
                terminal: AtomicBool::new(false),
                suspense: Mutex::new(None),
                runtime,
                store,
                serialisers,
                threshold,
            }),
        };
        (channel, frame_rx)
    }

    /// The execution this channel belongs to.
    pub fn execution_id(&self) -> ExecutionId {
        self.shared.execution_id
    }

    /// The execution's ephemeral working directory.
    pub fn working_dir(&self) -> &Path {
        &self.shared.working_dir
    }

    // -----------------------------------------------------------------------
    // Pump-side plumbing
    // -----------------------------------------------------------------------

    /// Flag an external abort; user code observes it at its next suspension
    /// point.
    pub fn mark_aborted(&self) {
        self.shared.aborted.store(true, Ordering::SeqCst);
    }

    /// Route a parent response to its waiting request.
    pub(crate) fn complete_request(&self, id: u64, result: Result<Json, String>) {
        let sender = self.shared.pending.lock().unwrap().remove(&id);
        if let Some(sender) = sender {
            let _ = sender.send(result);
        }
    }

    /// Fail every in-flight request; called when the parent pipe closes so
    /// blocked user code unwinds instead of waiting forever.
    pub(crate) fn fail_pending(&self, reason: &str) {
        let pending: Vec<ResponseSender> = {
            let mut pending = self.shared.pending.lock().unwrap();
            pending.drain().map(|(_, sender)| sender).collect()
        };
        for sender in pending {
            let _ = sender.send(Err(reason.to_string()));
        }
    }

    pub(crate) fn send_frame(&self, frame: ChildFrame) {
        // The pump only stops after the channel is gone; a send failure here
        // means the process is already tearing down.
        let _ = self.shared.frames.send(frame);
    }

    /// Send a terminal frame unless one was already sent. Returns whether
    /// this frame won.
    pub(crate) fn send_terminal(&self, frame: ChildFrame) -> bool {
        debug_assert!(frame.is_terminal());
        if self.shared.terminal.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.send_frame(frame);
        true
    }

    pub(crate) fn check_abort(&self) -> Result<(), TargetError> {
        if self.shared.aborted.load(Ordering::SeqCst) {
            Err(TargetError::failure("interrupted", "execution aborted"))
        } else {
            Ok(())
        }
    }

    // -----------------------------------------------------------------------
    // Serialisation bridges
    // -----------------------------------------------------------------------

    pub(crate) fn capabilities(&self) -> Capabilities {
        Capabilities::bound(
            Arc::new(ChannelResolver(self.clone())),
            Arc::new(ChannelRestorer(self.clone())),
        )
    }

    pub(crate) fn serialise_value(&self, data: &Data) -> Result<Value, TargetError> {
        let shared = &self.shared;
        shared
            .runtime
            .block_on(weft_codec::serialise(
                data,
                &shared.serialisers,
                shared.store.as_ref(),
                shared.threshold,
            ))
            .map_err(|err| TargetError::failure("serialisation_error", err.to_string()))
    }

    pub(crate) fn deserialise_value(&self, value: &Value) -> Result<Data, TargetError> {
        let shared = &self.shared;
        shared
            .runtime
            .block_on(weft_codec::deserialise(
                value,
                &shared.serialisers,
                shared.store.as_ref(),
                &self.capabilities(),
            ))
            .map_err(|err| TargetError::failure("deserialisation_error", err.to_string()))
    }

    // -----------------------------------------------------------------------
    // Requests
    // -----------------------------------------------------------------------

    fn begin_request(&self) -> (u64, oneshot::Receiver<Result<Json, String>>) {
        let id = self.shared.next_request.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().unwrap().insert(id, tx);
        (id, rx)
    }

    /// Wait for a response, without a deadline.
    fn wait(
        &self,
        id: u64,
        rx: oneshot::Receiver<Result<Json, String>>,
    ) -> Result<Json, TargetError> {
        let response = self
            .shared
            .runtime
            .block_on(rx)
            .map_err(|_| TargetError::failure("channel_closed", "worker channel closed"));
        if response.is_err() {
            self.shared.pending.lock().unwrap().remove(&id);
        }
        response?.map_err(|error| TargetError::failure("request_error", error))
    }

    /// Wait for a response under the current suspense deadline, if any.
    /// A deadline miss surfaces as [`TargetError::Suspended`].
    fn wait_suspense(
        &self,
        id: u64,
        rx: oneshot::Receiver<Result<Json, String>>,
        waiting_on: ExecutionId,
    ) -> Result<Json, TargetError> {
        let deadline = *self.shared.suspense.lock().unwrap();
        let Some(deadline) = deadline else {
            return self.wait(id, rx);
        };
        let outcome = self.shared.runtime.block_on(async {
            tokio::time::timeout_at(tokio::time::Instant::from_std(deadline), rx).await
        });
        match outcome {
            Ok(Ok(response)) => {
                response.map_err(|error| TargetError::failure("request_error", error))
            }
            Ok(Err(_closed)) => {
                self.shared.pending.lock().unwrap().remove(&id);
                Err(TargetError::failure("channel_closed", "worker channel closed"))
            }
            Err(_elapsed) => {
                self.shared.pending.lock().unwrap().remove(&id);
                Err(TargetError::Suspended {
                    execute_after_ms: None,
                    waiting_on: vec![waiting_on],
                })
            }
        }
    }

    // -----------------------------------------------------------------------
    // User-facing operations
    // -----------------------------------------------------------------------

    /// Submit a child execution and return a lazy handle to its result.
    pub fn submit(
        &self,
        target_type: TargetType,
        repository: &str,
        target: &str,
        arguments: Vec<Data>,
        options: SubmitOptions,
    ) -> Result<ExecutionHandle, TargetError> {
        self.check_abort()?;

        let serialised = arguments
            .iter()
            .map(|argument| self.serialise_value(argument))
            .collect::<Result<Vec<_>, _>>()?;

        let cache = options
            .cache
            .as_ref()
            .map(|cache| submit::cache_key(cache, &serialised, repository, target));
        let defer_key = options
            .defer
            .as_ref()
            .map(|defer| submit::defer_key(defer, &serialised));
        let memo_key = options
            .memo
            .as_ref()
            .map(|memo| submit::memo_key(memo, &serialised, repository, target));

        let execute_after_ms = match options.delay {
            Some(delay) => {
                let base = options
                    .execute_after_ms
                    .unwrap_or_else(|| Utc::now().timestamp_millis() as u64);
                Some(base + delay.as_millis() as u64)
            }
            None => options.execute_after_ms,
        };

        let spec = SubmitSpec {
            target_type,
            repository: repository.to_string(),
            target: target.to_string(),
            arguments: serialised,
            wait_for: options.wait_for,
            cache,
            defer_key,
            memo_key,
            execute_after_ms,
            retries: options.retries.unwrap_or(weft_core::Retries::limit(0)),
            requires: options.requires,
        };

        let (id, rx) = self.begin_request();
        self.send_frame(ChildFrame::Submit { id, spec });
        let response = self.wait(id, rx)?;
        let execution_id = response.as_u64().ok_or_else(|| {
            TargetError::failure("request_error", format!("bad submit response: {response}"))
        })?;
        Ok(ExecutionHandle::bound(
            execution_id,
            Arc::new(ChannelResolver(self.clone())),
        ))
    }

    /// Resolve another execution's result, blocking until available or
    /// until the enclosing suspense deadline passes.
    pub fn resolve(&self, execution_id: ExecutionId) -> Result<Data, TargetError> {
        self.check_abort()?;
        let (id, rx) = self.begin_request();
        self.send_frame(ChildFrame::Resolve { id, execution_id });
        let response = self.wait_suspense(id, rx, execution_id)?;

        let envelope = ResultEnvelope::from_json(&response).map_err(|err| {
            TargetError::failure("request_error", format!("bad result envelope: {err}"))
        })?;
        match envelope {
            ResultEnvelope::Value(value) => self.deserialise_value(&value),
            // Remote failures re-raise preserving their type tag.
            ResultEnvelope::Error(detail) => Err(TargetError::from(detail)),
            ResultEnvelope::Abandoned => {
                Err(TargetError::remote("abandoned", "execution was abandoned"))
            }
            ResultEnvelope::Cancelled => {
                Err(TargetError::remote("cancelled", "execution was cancelled"))
            }
            ResultEnvelope::Suspended => {
                Err(TargetError::remote("suspended", "execution is suspended"))
            }
        }
    }

    /// Run `f` with a resolution deadline. Inside the scope, reference
    /// resolution that misses the deadline yields a suspension instead of
    /// blocking forever. Scopes nest; the innermost deadline wins.
    pub fn suspense<T>(&self, timeout: Duration, f: impl FnOnce() -> T) -> T {
        let deadline = Instant::now() + timeout;
        let previous = self.shared.suspense.lock().unwrap().replace(deadline);
        let result = f();
        *self.shared.suspense.lock().unwrap() = previous;
        result
    }

    /// An explicit suspension, to be returned as an error from target code.
    pub fn suspend(&self, delay: Option<Duration>) -> TargetError {
        TargetError::Suspended {
            execute_after_ms: delay
                .map(|delay| Utc::now().timestamp_millis() as u64 + delay.as_millis() as u64),
            waiting_on: Vec::new(),
        }
    }

    /// Capture a file or directory from the working directory and persist
    /// it as an asset.
    pub fn persist_asset(
        &self,
        path: Option<&Path>,
        match_glob: Option<&str>,
    ) -> Result<AssetHandle, TargetError> {
        self.check_abort()?;
        let capture = assets::capture(&self.shared.working_dir, path, match_glob)?;
        let blob_key = self
            .shared
            .runtime
            .block_on(self.shared.store.upload(&capture.upload_path))
            .map_err(|err| TargetError::failure("asset_capture", err.to_string()))?;

        let entry = crate::frame::AssetEntry {
            kind: capture.kind,
            path: capture.relative_path,
            blob_key,
            size: capture.size,
            metadata: capture.metadata,
        };
        let (id, rx) = self.begin_request();
        self.send_frame(ChildFrame::PersistAsset { id, entry });
        let response = self.wait(id, rx)?;
        let asset_id = response.as_u64().ok_or_else(|| {
            TargetError::failure("request_error", format!("bad asset response: {response}"))
        })?;
        Ok(AssetHandle::bound(
            asset_id,
            Arc::new(ChannelRestorer(self.clone())),
        ))
    }

    /// Restore a persisted asset into the working directory.
    pub fn restore_asset(
        &self,
        asset_id: AssetId,
        to: Option<&Path>,
    ) -> Result<PathBuf, TargetError> {
        self.check_abort()?;
        let (id, rx) = self.begin_request();
        self.send_frame(ChildFrame::ResolveAsset { id, asset_id });
        let response = self.wait(id, rx)?;
        let lookup: AssetLookup = serde_json::from_value(response).map_err(|err| {
            TargetError::failure("request_error", format!("bad asset lookup: {err}"))
        })?;

        let dest = assets::resolve_within(
            &self.shared.working_dir,
            to.unwrap_or_else(|| Path::new(&lookup.path)),
        )?;
        match lookup.kind {
            crate::frame::AssetKind::File => {
                self.shared
                    .runtime
                    .block_on(self.shared.store.download(&lookup.blob_key, &dest))
                    .map_err(|err| TargetError::failure("asset_restore", err.to_string()))?;
            }
            crate::frame::AssetKind::Directory => {
                let archive = tempfile::NamedTempFile::new()
                    .map_err(|err| TargetError::failure("asset_restore", err.to_string()))?;
                self.shared
                    .runtime
                    .block_on(self.shared.store.download(&lookup.blob_key, archive.path()))
                    .map_err(|err| TargetError::failure("asset_restore", err.to_string()))?;
                assets::unpack_archive(archive.path(), &dest)?;
            }
        }
        Ok(dest)
    }

    /// Report an argument snapshot the server may use as a retry resume
    /// point. Does not affect termination.
    pub fn checkpoint(&self, arguments: &[Data]) -> Result<(), TargetError> {
        self.check_abort()?;
        let serialised = arguments
            .iter()
            .map(|argument| self.serialise_value(argument))
            .collect::<Result<Vec<_>, _>>()?;
        self.send_frame(ChildFrame::Checkpoint {
            arguments: serialised,
        });
        Ok(())
    }

    /// Emit a structured log message.
    pub fn log(
        &self,
        level: LogLevel,
        template: &str,
        labels: &[(&str, Json)],
    ) -> Result<(), TargetError> {
        self.check_abort()?;
        self.send_frame(ChildFrame::Log {
            level,
            template: template.to_string(),
            labels: labels
                .iter()
                .map(|(name, value)| (name.to_string(), value.clone()))
                .collect(),
            timestamp_ms: Utc::now().timestamp_millis() as u64,
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Capabilities over the channel
// ---------------------------------------------------------------------------

struct ChannelResolver(Channel);

impl ResolveResult for ChannelResolver {
    fn resolve(&self, id: ExecutionId) -> Result<Data, TargetError> {
        self.0.resolve(id)
    }
}

struct ChannelRestorer(Channel);

impl RestoreAsset for ChannelRestorer {
    fn restore(&self, id: AssetId, to: Option<&Path>) -> Result<PathBuf, TargetError> {
        self.0.restore_asset(id, to)
    }
}
