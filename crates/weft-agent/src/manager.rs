// SPDX-License-Identifier: MIT OR Apache-2.0
//! The execution manager: spawns workers, pumps their pipes, translates
//! worker frames into orchestrator requests, and tracks execution status.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value as Json};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};
use weft_core::{ErrorDetail, ExecutionId, Value};
use weft_proto::Connection;
use weft_worker::{
    AssetEntry, AssetKind, ChildFrame, ParentFrame, Registry, StartExecution, SubmitSpec,
};

use crate::signal;

/// How often execution statuses are considered for a heartbeat.
pub const EXECUTION_THRESHOLD: Duration = Duration::from_secs(1);
/// Longest the agent stays silent while idle.
pub const AGENT_THRESHOLD: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Worker spawning
// ---------------------------------------------------------------------------

/// The pipes and process handle of a spawned worker.
pub struct SpawnedWorker {
    /// The worker's stdin: parent → child frames.
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    /// The worker's stdout: child → parent frames (and captured prints).
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    /// The worker's stderr, forwarded as error-level logs.
    pub stderr: Option<Box<dyn AsyncRead + Send + Unpin>>,
    /// OS pid, when the worker is a real process.
    pub pid: Option<u32>,
    /// Process handle for reaping, when the worker is a real process.
    pub child: Option<tokio::process::Child>,
}

/// Spawns one worker per execution.
#[async_trait]
pub trait WorkerSpawner: Send + Sync {
    /// Spawn a fresh worker for `execution_id`.
    async fn spawn(&self, execution_id: ExecutionId) -> std::io::Result<SpawnedWorker>;
}

/// Spawns workers by re-executing the current binary with the worker-mode
/// environment flag; spawn, not fork, so the child starts clean.
pub struct SelfExecSpawner;

/// Environment variable that switches the binary into worker mode.
pub const WORKER_ENV: &str = "WEFT_WORKER";

#[async_trait]
impl WorkerSpawner for SelfExecSpawner {
    async fn spawn(&self, execution_id: ExecutionId) -> std::io::Result<SpawnedWorker> {
        let program = std::env::current_exe()?;
        let args: Vec<String> = std::env::args().skip(1).collect();
        let mut child = tokio::process::Command::new(program)
            .args(args)
            .env(WORKER_ENV, execution_id.to_string())
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let missing = |pipe: &str| std::io::Error::other(format!("worker {pipe} unavailable"));
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;
        Ok(SpawnedWorker {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Some(Box::new(stderr)),
            pid: child.id(),
            child: Some(child),
        })
    }
}

// ---------------------------------------------------------------------------
// Execution tracking
// ---------------------------------------------------------------------------

/// Execution status codes as reported in heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ExecutionStatus {
    /// Spawned, arguments not yet materialised.
    Starting,
    /// User code is running.
    Executing,
    /// An abort was requested.
    Aborting,
    /// A terminal frame was received; waiting for exit.
    Stopping,
}

impl ExecutionStatus {
    /// Numeric wire code.
    pub fn code(&self) -> u8 {
        match self {
            ExecutionStatus::Starting => 0,
            ExecutionStatus::Executing => 1,
            ExecutionStatus::Aborting => 2,
            ExecutionStatus::Stopping => 3,
        }
    }
}

struct ExecutionEntry {
    status: ExecutionStatus,
    touched_at: Instant,
    pid: Option<u32>,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Parent-side supervisor for all live executions.
pub struct Manager {
    connection: Arc<Connection>,
    registry: Arc<Registry>,
    spawner: Arc<dyn WorkerSpawner>,
    grace: Duration,
    executions: Mutex<HashMap<ExecutionId, ExecutionEntry>>,
    last_heartbeat: Mutex<Option<Instant>>,
}

impl Manager {
    /// A manager sending through `connection` and running targets from
    /// `registry` via `spawner`.
    pub fn new(
        connection: Arc<Connection>,
        registry: Arc<Registry>,
        spawner: Arc<dyn WorkerSpawner>,
        grace: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            connection,
            registry,
            spawner,
            grace,
            executions: Mutex::new(HashMap::new()),
            last_heartbeat: Mutex::new(None),
        })
    }

    /// Ids of currently live executions.
    pub fn live(&self) -> Vec<ExecutionId> {
        self.executions.lock().unwrap().keys().copied().collect()
    }

    /// The status of one live execution.
    pub fn status(&self, id: ExecutionId) -> Option<ExecutionStatus> {
        self.executions.lock().unwrap().get(&id).map(|e| e.status)
    }

    fn put_error(&self, id: ExecutionId, error: &ErrorDetail) {
        let encoded = json!([error.type_name, error.message, []]);
        self.connection.notify("put_error", vec![json!(id), encoded]);
    }

    /// Handle an `execute` command: verify the target, spawn a worker, and
    /// start pumping it.
    pub async fn execute(
        self: &Arc<Self>,
        id: ExecutionId,
        repository: String,
        target: String,
        arguments: Vec<Value>,
    ) {
        if self.executions.lock().unwrap().contains_key(&id) {
            warn!(target: "weft_agent", id, "ignoring execute for already-running execution");
            return;
        }
        if !self.registry.contains(&repository, &target) {
            // No worker is spawned for a target this agent doesn't know.
            self.put_error(
                id,
                &ErrorDetail::new(
                    "unknown_target",
                    format!("unknown target {repository}:{target}"),
                ),
            );
            return;
        }
        info!(target: "weft_agent", id, %repository, %target, "starting execution");
        let worker = match self.spawner.spawn(id).await {
            Ok(worker) => worker,
            Err(err) => {
                self.put_error(id, &ErrorDetail::new("spawn_error", err.to_string()));
                return;
            }
        };
        self.executions.lock().unwrap().insert(
            id,
            ExecutionEntry {
                status: ExecutionStatus::Starting,
                touched_at: Instant::now(),
                pid: worker.pid,
            },
        );
        let manager = self.clone();
        let start = StartExecution {
            execution_id: id,
            repository,
            target,
            arguments,
        };
        tokio::spawn(async move {
            manager.pump(id, start, worker).await;
        });
    }

    /// Abort one execution: SIGINT now, SIGKILL after the grace window.
    /// Returns `false` for unrecognised ids.
    pub fn abort(self: &Arc<Self>, id: ExecutionId) -> bool {
        let pid = {
            let mut executions = self.executions.lock().unwrap();
            let Some(entry) = executions.get_mut(&id) else {
                return false;
            };
            entry.status = entry.status.max(ExecutionStatus::Aborting);
            entry.pid
        };
        if let Some(pid) = pid {
            signal::interrupt(pid);
        }
        let manager = self.clone();
        let grace = self.grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let survivor = manager.executions.lock().unwrap().contains_key(&id);
            if survivor {
                warn!(target: "weft_agent", id, "grace expired, killing worker");
                if let Some(pid) = pid {
                    signal::kill(pid);
                }
            }
        });
        true
    }

    /// Abort every live execution and wait up to `timeout` for the workers
    /// to go away.
    pub async fn abort_all(self: &Arc<Self>, timeout: Duration) {
        for id in self.live() {
            self.abort(id);
        }
        let deadline = Instant::now() + timeout;
        while !self.executions.lock().unwrap().is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Advance an execution's status; statuses only move forward. The
    /// heartbeat timestamp is deliberately untouched: it resets on send
    /// only, so live executions beat at least once per threshold no matter
    /// how chatty they are.
    fn set_status(&self, id: ExecutionId, status: ExecutionStatus) {
        if let Some(entry) = self.executions.lock().unwrap().get_mut(&id) {
            entry.status = entry.status.max(status);
        }
    }

    // -----------------------------------------------------------------------
    // Heartbeats
    // -----------------------------------------------------------------------

    /// One heartbeat decision: send statuses for executions untouched for
    /// the execution threshold, or an empty liveness beat when the agent
    /// threshold lapsed.
    pub fn heartbeat_tick(&self, execution_threshold: Duration, agent_threshold: Duration) {
        let now = Instant::now();
        let stale: Vec<(ExecutionId, u8)> = {
            let executions = self.executions.lock().unwrap();
            executions
                .iter()
                .filter(|(_, entry)| now.duration_since(entry.touched_at) > execution_threshold)
                .map(|(id, entry)| (*id, entry.status.code()))
                .collect()
        };
        let mut last = self.last_heartbeat.lock().unwrap();
        let idle_due = last.map_or(true, |sent| now.duration_since(sent) > agent_threshold);
        if stale.is_empty() && !idle_due {
            return;
        }
        let mut beats = serde_json::Map::new();
        for (id, code) in &stale {
            beats.insert(id.to_string(), json!(code));
        }
        self.connection
            .notify("record_heartbeats", vec![Json::Object(beats)]);
        *last = Some(now);
        drop(last);
        let mut executions = self.executions.lock().unwrap();
        for (id, _) in stale {
            if let Some(entry) = executions.get_mut(&id) {
                entry.touched_at = now;
            }
        }
    }

    /// The heartbeat loop; runs until cancelled.
    pub async fn run_heartbeats(&self) {
        loop {
            tokio::time::sleep(EXECUTION_THRESHOLD).await;
            self.heartbeat_tick(EXECUTION_THRESHOLD, AGENT_THRESHOLD);
        }
    }

    // -----------------------------------------------------------------------
    // Worker pump
    // -----------------------------------------------------------------------

    async fn pump(self: Arc<Self>, id: ExecutionId, start: StartExecution, worker: SpawnedWorker) {
        let SpawnedWorker {
            mut stdin,
            stdout,
            stderr,
            pid: _,
            child,
        } = worker;

        // Hand over the work order.
        let start_line = match weft_worker::frame::encode_line(&ParentFrame::Start {
            execution: start,
        }) {
            Ok(line) => line,
            Err(err) => {
                warn!(target: "weft_agent", id, %err, "failed to encode start frame");
                self.finish(id, child).await;
                return;
            }
        };
        if stdin.write_all(start_line.as_bytes()).await.is_err()
            || stdin.flush().await.is_err()
        {
            warn!(target: "weft_agent", id, "worker pipe closed before start");
            self.finish(id, child).await;
            return;
        }

        // Stderr lines become error-level log messages.
        if let Some(stderr) = stderr {
            let manager = self.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.trim().is_empty() {
                        manager.forward_print(id, weft_core::LogLevel::Error, &line);
                    }
                }
            });
        }

        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match weft_worker::frame::decode_line::<ChildFrame>(&line) {
                Ok(frame) => self.handle_frame(id, frame, &mut stdin).await,
                Err(_) => {
                    // Not a frame: a stray print from user code.
                    if !line.trim().is_empty() {
                        self.forward_print(id, weft_core::LogLevel::Info, &line);
                    }
                }
            }
        }

        self.finish(id, child).await;
    }

    /// Reap the child (if real), report termination, and drop the entry.
    async fn finish(&self, id: ExecutionId, child: Option<tokio::process::Child>) {
        if let Some(mut child) = child {
            let _ = child.wait().await;
        }
        debug!(target: "weft_agent", id, "worker exited");
        self.connection
            .notify("notify_terminated", vec![json!([id])]);
        self.executions.lock().unwrap().remove(&id);
    }

    fn forward_print(&self, id: ExecutionId, level: weft_core::LogLevel, line: &str) {
        let timestamp = chrono::Utc::now().timestamp_millis();
        self.connection.notify(
            "log_messages",
            vec![json!([[id, timestamp, level.as_wire(), line, {}]])],
        );
    }

    async fn handle_frame(
        self: &Arc<Self>,
        id: ExecutionId,
        frame: ChildFrame,
        stdin: &mut (dyn AsyncWrite + Send + Unpin),
    ) {
        match frame {
            ChildFrame::Executing => {
                self.set_status(id, ExecutionStatus::Executing);
            }
            ChildFrame::Result { value } => {
                self.set_status(id, ExecutionStatus::Stopping);
                self.connection
                    .notify("put_result", vec![json!(id), value.to_json()]);
            }
            ChildFrame::Error { error } => {
                self.set_status(id, ExecutionStatus::Stopping);
                self.put_error(id, &error);
            }
            ChildFrame::Suspend {
                execute_after_ms,
                waiting_on,
            } => {
                self.set_status(id, ExecutionStatus::Stopping);
                self.connection.notify(
                    "suspend",
                    vec![json!(id), json!(execute_after_ms), json!(waiting_on)],
                );
            }
            ChildFrame::Checkpoint { arguments } => {
                let encoded: Vec<Json> = arguments.iter().map(Value::to_json).collect();
                self.connection
                    .notify("record_checkpoint", vec![json!(id), json!(encoded)]);
            }
            ChildFrame::Log {
                level,
                template,
                labels,
                timestamp_ms,
            } => {
                self.connection.notify(
                    "log_messages",
                    vec![json!([[id, timestamp_ms, level.as_wire(), template, labels]])],
                );
            }
            ChildFrame::Submit { id: request_id, spec } => {
                let response = self
                    .connection
                    .request("submit", submit_params(id, &spec))
                    .await;
                self.respond(id, request_id, response, stdin).await;
            }
            ChildFrame::Resolve {
                id: request_id,
                execution_id,
            } => {
                let response = self
                    .connection
                    .request("get_result", vec![json!(execution_id), json!(id)])
                    .await;
                self.respond(id, request_id, response, stdin).await;
            }
            ChildFrame::PersistAsset {
                id: request_id,
                entry,
            } => {
                let response = self
                    .connection
                    .request("put_asset", asset_params(id, &entry))
                    .await;
                self.respond(id, request_id, response, stdin).await;
            }
            ChildFrame::ResolveAsset {
                id: request_id,
                asset_id,
            } => {
                let response = self
                    .connection
                    .request("get_asset", vec![json!(asset_id), json!(id)])
                    .await
                    .and_then(|result| asset_lookup(&result));
                self.respond(id, request_id, response, stdin).await;
            }
        }
    }

    async fn respond(
        &self,
        id: ExecutionId,
        request_id: u64,
        response: Result<Json, weft_proto::ProtoError>,
        stdin: &mut (dyn AsyncWrite + Send + Unpin),
    ) {
        let frame = match response {
            Ok(result) => ParentFrame::Response {
                id: request_id,
                result,
            },
            Err(err) => ParentFrame::ResponseError {
                id: request_id,
                error: err.to_string(),
            },
        };
        let line = match weft_worker::frame::encode_line(&frame) {
            Ok(line) => line,
            Err(err) => {
                warn!(target: "weft_agent", id, %err, "failed to encode response");
                return;
            }
        };
        if stdin.write_all(line.as_bytes()).await.is_err() || stdin.flush().await.is_err() {
            warn!(target: "weft_agent", id, "worker pipe closed mid-response");
        }
    }
}

// ---------------------------------------------------------------------------
// Wire translations
// ---------------------------------------------------------------------------

fn submit_params(parent_id: ExecutionId, spec: &SubmitSpec) -> Vec<Json> {
    let arguments: Vec<Json> = spec.arguments.iter().map(Value::to_json).collect();
    let cache = spec
        .cache
        .as_ref()
        .map(|cache| json!([cache.key, cache.max_age_ms]))
        .unwrap_or(Json::Null);
    vec![
        json!(spec.target_type.as_str()),
        json!(spec.repository),
        json!(spec.target),
        json!(arguments),
        json!(parent_id),
        json!(spec.wait_for),
        cache,
        json!(spec.defer_key),
        json!(spec.memo_key),
        json!(spec.execute_after_ms),
        json!([spec.retries.limit, spec.retries.delay_min, spec.retries.delay_max]),
        json!(spec.requires),
    ]
}

fn asset_params(parent_id: ExecutionId, entry: &AssetEntry) -> Vec<Json> {
    let kind = match entry.kind {
        AssetKind::File => "file",
        AssetKind::Directory => "directory",
    };
    vec![
        json!(parent_id),
        json!(kind),
        json!(entry.path),
        json!(entry.blob_key),
        json!(entry.size),
        json!(entry.metadata),
    ]
}

/// The server answers `get_asset` with a `(type, path, blob_key)` tuple;
/// the child expects an object.
fn asset_lookup(result: &Json) -> Result<Json, weft_proto::ProtoError> {
    let malformed = || weft_proto::ProtoError::Frame(format!("bad asset lookup: {result}"));
    let items = result.as_array().ok_or_else(malformed)?;
    if items.len() != 3 {
        return Err(malformed());
    }
    Ok(json!({
        "kind": items[0],
        "path": items[1],
        "blob_key": items[2],
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::Retries;

    #[test]
    fn status_codes_are_ordered() {
        assert!(ExecutionStatus::Starting < ExecutionStatus::Executing);
        assert!(ExecutionStatus::Executing < ExecutionStatus::Aborting);
        assert!(ExecutionStatus::Aborting < ExecutionStatus::Stopping);
        assert_eq!(ExecutionStatus::Starting.code(), 0);
        assert_eq!(ExecutionStatus::Stopping.code(), 3);
    }

    #[test]
    fn submit_params_follow_wire_order() {
        let spec = SubmitSpec {
            target_type: weft_core::TargetType::Task,
            repository: "repo".into(),
            target: "child".into(),
            arguments: vec![Value::raw(json!(1))],
            wait_for: vec![0],
            cache: Some(weft_worker::CacheKey {
                key: "k".into(),
                max_age_ms: Some(60_000),
            }),
            defer_key: None,
            memo_key: Some("m".into()),
            execute_after_ms: Some(123),
            retries: Retries {
                limit: 2,
                delay_min: 1,
                delay_max: 5,
            },
            requires: None,
        };
        let params = submit_params(9, &spec);
        assert_eq!(params[0], json!("task"));
        assert_eq!(params[4], json!(9));
        assert_eq!(params[6], json!(["k", 60_000]));
        assert_eq!(params[7], Json::Null);
        assert_eq!(params[10], json!([2, 1, 5]));
    }

    #[test]
    fn asset_lookup_reshapes_tuple() {
        let key = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";
        let reshaped = asset_lookup(&json!(["file", "out.txt", key])).unwrap();
        assert_eq!(reshaped["kind"], json!("file"));
        assert_eq!(reshaped["blob_key"], json!(key));
        assert!(asset_lookup(&json!(["file", "x"])).is_err());
    }
}
