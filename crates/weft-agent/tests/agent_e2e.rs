// SPDX-License-Identifier: MIT OR Apache-2.0
//! End-to-end scenarios: a scripted orchestrator over a real WebSocket,
//! the agent loop, and in-process workers over duplex pipes.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::routing::any;
use axum::Router;
use serde_json::{json, Value as Json};
use tokio::io::{duplex, split};
use weft_agent::{Agent, AgentConfig, SpawnedWorker, WorkerSpawner};
use weft_blob::MemoryStore;
use weft_codec::SerialiserRegistry;
use weft_core::{Data, TargetError};
use weft_worker::{context, Registry, WorkerHost};

// ---------------------------------------------------------------------------
// Scripted orchestrator
// ---------------------------------------------------------------------------

type Responder = Arc<dyn Fn(&str, &[Json]) -> Option<Json> + Send + Sync>;

#[derive(Clone)]
struct Orchestrator {
    session: String,
    commands: Vec<Json>,
    responder: Responder,
    received: Arc<Mutex<Vec<Json>>>,
    connections: Arc<AtomicUsize>,
}

impl Orchestrator {
    fn new(session: &str, commands: Vec<Json>, responder: Responder) -> Self {
        Self {
            session: session.to_string(),
            commands,
            responder,
            received: Arc::new(Mutex::new(Vec::new())),
            connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn requests_named(&self, name: &str) -> Vec<Json> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .filter(|frame| frame["request"] == name)
            .cloned()
            .collect()
    }

    async fn serve(self) -> SocketAddr {
        let app = Router::new().route(
            "/agent",
            any(move |ws: WebSocketUpgrade| {
                let orchestrator = self.clone();
                async move { ws.on_upgrade(move |socket| orchestrator.handle(socket)) }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    async fn handle(self, mut socket: WebSocket) {
        self.connections.fetch_add(1, Ordering::SeqCst);
        let session = json!([0, self.session]).to_string();
        if socket.send(WsMessage::Text(session.into())).await.is_err() {
            return;
        }
        for command in &self.commands {
            let frame = json!([1, command]).to_string();
            if socket.send(WsMessage::Text(frame.into())).await.is_err() {
                return;
            }
        }
        while let Some(Ok(message)) = socket.recv().await {
            let WsMessage::Text(text) = message else {
                continue;
            };
            let Ok(frame) = serde_json::from_str::<Json>(&text) else {
                continue;
            };
            self.received.lock().unwrap().push(frame.clone());
            if let Some(id) = frame.get("id").and_then(Json::as_u64) {
                let request = frame["request"].as_str().unwrap_or_default();
                let params: Vec<Json> = frame
                    .get("params")
                    .and_then(Json::as_array)
                    .cloned()
                    .unwrap_or_default();
                if let Some(result) = (self.responder)(request, &params) {
                    let reply = json!([2, id, result]).to_string();
                    if socket.send(WsMessage::Text(reply.into())).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

fn no_responses() -> Responder {
    Arc::new(|_request, _params| None)
}

async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

// ---------------------------------------------------------------------------
// In-process workers
// ---------------------------------------------------------------------------

struct InProcessSpawner {
    registry: Arc<Registry>,
    store: Arc<MemoryStore>,
    threshold: usize,
    spawned: AtomicUsize,
}

impl InProcessSpawner {
    fn new(registry: Registry, store: Arc<MemoryStore>, threshold: usize) -> Arc<Self> {
        Arc::new(Self {
            registry: Arc::new(registry),
            store,
            threshold,
            spawned: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl WorkerSpawner for InProcessSpawner {
    async fn spawn(&self, _execution_id: u64) -> std::io::Result<SpawnedWorker> {
        self.spawned.fetch_add(1, Ordering::SeqCst);
        let host = WorkerHost::new(
            self.registry.clone(),
            self.store.clone(),
            SerialiserRegistry::standard(),
            self.threshold,
        )
        .process_scoped(false);
        let (parent_io, child_io) = duplex(64 * 1024);
        let (child_reader, child_writer) = split(child_io);
        tokio::spawn(async move {
            let _ = host.run(child_reader, child_writer).await;
        });
        let (parent_reader, parent_writer) = split(parent_io);
        Ok(SpawnedWorker {
            stdin: Box::new(parent_writer),
            stdout: Box::new(parent_reader),
            stderr: None,
            pid: None,
            child: None,
        })
    }
}

fn test_config(addr: SocketAddr) -> AgentConfig {
    toml::from_str::<AgentConfig>(&format!(
        r#"
        host = "127.0.0.1:{}"
        project = "proj_test"
        environment = "test"
        "#,
        addr.port()
    ))
    .unwrap()
}

fn execute_command(id: u64, target: &str, arguments: Json) -> Json {
    json!({"request": "execute", "params": [id, "repo", target, arguments]})
}

// ---------------------------------------------------------------------------
// Scenario: happy path
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
#[serial_test::serial]
async fn happy_path_executes_and_reports() {
    let orchestrator = Orchestrator::new(
        "S-1",
        vec![execute_command(42, "add", json!([["raw", 1, []], ["raw", 2, []]]))],
        no_responses(),
    );
    let addr = orchestrator.clone().serve().await;

    let registry = Registry::new().workflow("repo", "add", &["a", "b"], |arguments: Vec<Data>| {
        let (Data::Int(a), Data::Int(b)) = (&arguments[0], &arguments[1]) else {
            return Err(TargetError::message("expected integers"));
        };
        Ok(Data::Int(a + b))
    });
    let spawner = InProcessSpawner::new(registry.clone(), Arc::new(MemoryStore::new()), 200);
    let agent = Arc::new(Agent::new(
        test_config(addr),
        Arc::new(registry),
        spawner,
    ));
    let runner = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.run().await })
    };

    assert!(
        wait_until(Duration::from_secs(5), || {
            !orchestrator.requests_named("notify_terminated").is_empty()
        })
        .await,
        "worker never terminated"
    );

    // The session was announced and stored.
    assert_eq!(agent.connection().session_id(), Some("S-1".into()));

    // declare_targets went out first.
    let first = orchestrator.received.lock().unwrap()[0].clone();
    assert_eq!(first["request"], "declare_targets");
    assert_eq!(first["params"][0]["repo"]["add"]["type"], "workflow");

    let results = orchestrator.requests_named("put_result");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["params"], json!([42, ["raw", 3, []]]));

    let terminated = orchestrator.requests_named("notify_terminated");
    assert_eq!(terminated[0]["params"], json!([[42]]));

    runner.abort();
}

// ---------------------------------------------------------------------------
// Scenario: large result tiers to the blob store
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
#[serial_test::serial]
async fn large_result_goes_through_blob_store() {
    let orchestrator = Orchestrator::new(
        "S-1",
        vec![execute_command(9, "big", json!([]))],
        no_responses(),
    );
    let addr = orchestrator.clone().serve().await;

    let registry = Registry::new().task("repo", "big", &[], |_arguments: Vec<Data>| {
        Ok(Data::String("x".repeat(1000)))
    });
    let store = Arc::new(MemoryStore::new());
    let spawner = InProcessSpawner::new(registry.clone(), store.clone(), 200);
    let agent = Arc::new(Agent::new(test_config(addr), Arc::new(registry), spawner));
    let runner = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.run().await })
    };

    assert!(
        wait_until(Duration::from_secs(5), || {
            !orchestrator.requests_named("put_result").is_empty()
        })
        .await
    );

    let results = orchestrator.requests_named("put_result");
    let envelope = &results[0]["params"][1];
    assert_eq!(envelope[0], "blob");
    // 1000 chars plus the JSON quotes.
    assert_eq!(envelope[2], json!(1002));
    // Exactly one blob write for the offloaded envelope.
    assert_eq!(store.puts(), 1);

    runner.abort();
}

// ---------------------------------------------------------------------------
// Scenario: reference chain suspends inside a suspense scope
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
#[serial_test::serial]
async fn unresolved_reference_suspends() {
    // submit is answered with execution id 77; get_result never answers.
    let responder: Responder = Arc::new(|request, _params| match request {
        "submit" => Some(json!(77)),
        _ => None,
    });
    let orchestrator = Orchestrator::new(
        "S-1",
        vec![execute_command(5, "waiter", json!([]))],
        responder,
    );
    let addr = orchestrator.clone().serve().await;

    let registry = Registry::new().workflow("repo", "waiter", &[], |_arguments: Vec<Data>| {
        let child = context::submit_task("repo", "slow", vec![])?;
        context::suspense(Duration::from_millis(100), || child.result())?
    });
    let spawner = InProcessSpawner::new(registry.clone(), Arc::new(MemoryStore::new()), 200);
    let agent = Arc::new(Agent::new(test_config(addr), Arc::new(registry), spawner));
    let runner = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.run().await })
    };

    assert!(
        wait_until(Duration::from_secs(5), || {
            !orchestrator.requests_named("suspend").is_empty()
        })
        .await,
        "execution never suspended"
    );
    let suspends = orchestrator.requests_named("suspend");
    assert_eq!(suspends[0]["params"], json!([5, null, [77]]));

    // The worker exits normally afterwards.
    assert!(
        wait_until(Duration::from_secs(5), || {
            !orchestrator.requests_named("notify_terminated").is_empty()
        })
        .await
    );
    // No error was reported for the suspended execution.
    assert!(orchestrator.requests_named("put_error").is_empty());

    runner.abort();
}

// ---------------------------------------------------------------------------
// Failure semantics
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
#[serial_test::serial]
async fn unknown_target_reports_error_without_spawning() {
    let orchestrator = Orchestrator::new(
        "S-1",
        vec![execute_command(7, "missing", json!([]))],
        no_responses(),
    );
    let addr = orchestrator.clone().serve().await;

    let registry = Registry::new();
    let spawner = InProcessSpawner::new(registry.clone(), Arc::new(MemoryStore::new()), 200);
    let spawner_probe = spawner.clone();
    let agent = Arc::new(Agent::new(test_config(addr), Arc::new(registry), spawner));
    let runner = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.run().await })
    };

    assert!(
        wait_until(Duration::from_secs(5), || {
            !orchestrator.requests_named("put_error").is_empty()
        })
        .await
    );
    let errors = orchestrator.requests_named("put_error");
    assert_eq!(errors[0]["params"][0], json!(7));
    assert_eq!(errors[0]["params"][1][0], json!("unknown_target"));
    // No worker was spawned for it.
    assert_eq!(spawner_probe.spawned.load(Ordering::SeqCst), 0);

    runner.abort();
}

#[tokio::test(flavor = "multi_thread")]
#[serial_test::serial]
async fn abort_is_refused_for_unknown_executions() {
    let orchestrator = Orchestrator::new("S-1", vec![], no_responses());
    let addr = orchestrator.clone().serve().await;

    let registry = Registry::new();
    let spawner = InProcessSpawner::new(registry.clone(), Arc::new(MemoryStore::new()), 200);
    let agent = Arc::new(Agent::new(test_config(addr), Arc::new(registry), spawner));

    assert!(!agent.manager().abort(404));
}

// ---------------------------------------------------------------------------
// Heartbeats
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
#[serial_test::serial]
async fn heartbeats_report_live_executions_then_idle_liveness() {
    let orchestrator = Orchestrator::new(
        "S-1",
        vec![execute_command(11, "sleepy", json!([]))],
        no_responses(),
    );
    let addr = orchestrator.clone().serve().await;

    let registry = Registry::new().task("repo", "sleepy", &[], |_arguments: Vec<Data>| {
        std::thread::sleep(Duration::from_millis(400));
        Ok(Data::Null)
    });
    let spawner = InProcessSpawner::new(registry.clone(), Arc::new(MemoryStore::new()), 200);
    let agent = Arc::new(Agent::new(test_config(addr), Arc::new(registry), spawner));
    let runner = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.run().await })
    };

    // Give the execution time to start, then force a beat: the live
    // execution appears with its status code.
    assert!(
        wait_until(Duration::from_secs(2), || {
            agent.manager().status(11).is_some()
        })
        .await
    );
    agent
        .manager()
        .heartbeat_tick(Duration::ZERO, Duration::from_secs(999));
    assert!(
        wait_until(Duration::from_secs(2), || {
            orchestrator
                .requests_named("record_heartbeats")
                .iter()
                .any(|frame| frame["params"][0].get("11").is_some())
        })
        .await,
        "no heartbeat for the live execution"
    );

    // After it finishes, an idle-due beat carries an empty map.
    assert!(
        wait_until(Duration::from_secs(5), || {
            !orchestrator.requests_named("notify_terminated").is_empty()
        })
        .await
    );
    agent.manager().heartbeat_tick(Duration::ZERO, Duration::ZERO);
    assert!(
        wait_until(Duration::from_secs(2), || {
            orchestrator
                .requests_named("record_heartbeats")
                .iter()
                .any(|frame| frame["params"][0] == json!({}))
        })
        .await,
        "no idle liveness heartbeat"
    );

    runner.abort();
}

// ---------------------------------------------------------------------------
// Session invalidation
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
#[serial_test::serial]
async fn session_invalid_resets_and_reconnects_fresh() {
    // First connection: announce a session, then close with
    // session_invalid. Later connections: announce a new session and stay
    // open.
    let connections = Arc::new(AtomicUsize::new(0));
    let queries = Arc::new(Mutex::new(Vec::<String>::new()));

    let app = {
        let connections = connections.clone();
        let queries = queries.clone();
        Router::new().route(
            "/agent",
            any(
                move |ws: WebSocketUpgrade,
                      axum::extract::RawQuery(query): axum::extract::RawQuery| {
                    let connections = connections.clone();
                    let queries = queries.clone();
                    async move {
                        queries.lock().unwrap().push(query.unwrap_or_default());
                        let n = connections.fetch_add(1, Ordering::SeqCst);
                        ws.on_upgrade(move |mut socket: WebSocket| async move {
                            if n == 0 {
                                let session = json!([0, "S-1"]).to_string();
                                let _ = socket.send(WsMessage::Text(session.into())).await;
                                let _ = socket
                                    .send(WsMessage::Close(Some(axum::extract::ws::CloseFrame {
                                        code: 1000,
                                        reason: "session_invalid".into(),
                                    })))
                                    .await;
                            } else {
                                let session = json!([0, "S-2"]).to_string();
                                let _ = socket.send(WsMessage::Text(session.into())).await;
                                while socket.recv().await.is_some() {}
                            }
                        })
                    }
                },
            ),
        )
    };
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let registry = Registry::new();
    let spawner = InProcessSpawner::new(registry.clone(), Arc::new(MemoryStore::new()), 200);
    let agent = Arc::new(Agent::new(test_config(addr), Arc::new(registry), spawner));
    let runner = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.run().await })
    };

    assert!(
        wait_until(Duration::from_secs(5), || {
            agent.connection().session_id() == Some("S-2".into())
        })
        .await,
        "agent never picked up the new session"
    );
    assert_eq!(connections.load(Ordering::SeqCst), 2);

    // The invalidated session id was not offered on reconnect.
    let queries = queries.lock().unwrap();
    assert!(!queries[1].contains("session="));

    runner.abort();
}
