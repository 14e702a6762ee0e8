// SPDX-License-Identifier: MIT OR Apache-2.0
//! The agent loop: connect, declare targets, dispatch commands, reconnect.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use rand::Rng;
use serde_json::Value as Json;
use tracing::{info, warn};
use weft_core::Value;
use weft_proto::{CommandDispatcher, Connection, Disconnect, ProtoError};
use weft_worker::Registry;

use crate::config::AgentConfig;
use crate::manager::{Manager, WorkerSpawner};

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Routes server commands into the manager. Bound after construction to
/// break the connection/manager cycle.
#[derive(Default)]
pub(crate) struct Commands {
    manager: OnceLock<Arc<Manager>>,
}

impl Commands {
    pub(crate) fn bind(&self, manager: Arc<Manager>) {
        let _ = self.manager.set(manager);
    }

    fn manager(&self) -> Result<&Arc<Manager>, ProtoError> {
        self.manager
            .get()
            .ok_or_else(|| ProtoError::Frame("command before manager bound".into()))
    }
}

#[async_trait]
impl CommandDispatcher for Commands {
    async fn dispatch(&self, request: &str, params: Vec<Json>) -> Result<(), ProtoError> {
        let malformed = || ProtoError::Frame(format!("bad {request} params"));
        match request {
            "execute" => {
                let id = params.first().and_then(Json::as_u64).ok_or_else(malformed)?;
                let repository = params
                    .get(1)
                    .and_then(Json::as_str)
                    .ok_or_else(malformed)?
                    .to_string();
                let target = params
                    .get(2)
                    .and_then(Json::as_str)
                    .ok_or_else(malformed)?
                    .to_string();
                let arguments = params
                    .get(3)
                    .and_then(Json::as_array)
                    .ok_or_else(malformed)?
                    .iter()
                    .map(Value::from_json)
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|err| ProtoError::Frame(err.to_string()))?;
                self.manager()?
                    .execute(id, repository, target, arguments)
                    .await;
                Ok(())
            }
            "abort" => {
                let id = params.first().and_then(Json::as_u64).ok_or_else(malformed)?;
                if !self.manager()?.abort(id) {
                    warn!(target: "weft_agent", id, "ignoring abort for unrecognised execution");
                }
                Ok(())
            }
            other => Err(ProtoError::UnknownCommand(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

/// The long-lived agent: owns the connection and the manager, reconnects
/// until a fatal close.
pub struct Agent {
    config: AgentConfig,
    registry: Arc<Registry>,
    connection: Arc<Connection>,
    manager: Arc<Manager>,
}

impl Agent {
    /// Build an agent over `registry`, spawning workers via `spawner`.
    pub fn new(config: AgentConfig, registry: Arc<Registry>, spawner: Arc<dyn WorkerSpawner>) -> Self {
        let commands = Arc::new(Commands::default());
        let connection = Arc::new(Connection::new(commands.clone()));
        let manager = Manager::new(
            connection.clone(),
            registry.clone(),
            spawner,
            Duration::from_secs(config.abort_grace_secs),
        );
        commands.bind(manager.clone());
        Self {
            config,
            registry,
            connection,
            manager,
        }
    }

    /// The manager, for embedding and tests.
    pub fn manager(&self) -> Arc<Manager> {
        self.manager.clone()
    }

    /// The connection, for embedding and tests.
    pub fn connection(&self) -> Arc<Connection> {
        self.connection.clone()
    }

    fn url(&self) -> String {
        let config = &self.config;
        let mut query = format!(
            "project={}&environment={}",
            config.project, config.environment
        );
        if let Some(session) = self.connection.session_id() {
            query.push_str(&format!("&session={session}"));
        } else if let Some(launch) = &config.launch_id {
            query.push_str(&format!("&launch={launch}"));
        } else {
            if !config.provides.is_empty() {
                query.push_str(&format!("&provides={}", encode_tags(&config.provides)));
            }
            if let Some(concurrency) = config.concurrency {
                query.push_str(&format!("&concurrency={concurrency}"));
            }
        }
        format!("ws://{}/agent?{}", config.host, query)
    }

    /// Run until the server reports a fatal configuration error or the
    /// process is asked to shut down; workers are aborted with grace on
    /// the way out.
    pub async fn run(&self) -> anyhow::Result<()> {
        tokio::select! {
            result = self.connect_loop() => result,
            _ = shutdown_signal() => {
                info!(target: "weft_agent", "shutting down, aborting workers");
                self.manager
                    .abort_all(Duration::from_secs(self.config.abort_grace_secs))
                    .await;
                Ok(())
            }
        }
    }

    async fn connect_loop(&self) -> anyhow::Result<()> {
        loop {
            let url = self.url();
            info!(
                target: "weft_agent",
                host = %self.config.host,
                project = %self.config.project,
                environment = %self.config.environment,
                "connecting"
            );
            let socket = match tokio_tungstenite::connect_async(url.as_str()).await {
                Ok((socket, _response)) => socket,
                Err(err) => {
                    warn!(target: "weft_agent", %err, "can't connect");
                    self.backoff().await;
                    continue;
                }
            };
            info!(target: "weft_agent", "connected");
            self.connection
                .notify("declare_targets", vec![self.registry.manifest()]);

            let disconnect = tokio::select! {
                result = self.connection.run(socket) => result,
                _ = self.manager.run_heartbeats() => unreachable!("heartbeat loop never returns"),
            };
            match disconnect {
                Ok(Disconnect::Fatal(reason)) => {
                    self.manager
                        .abort_all(Duration::from_secs(self.config.abort_grace_secs))
                        .await;
                    bail!("server rejected agent: {reason}");
                }
                Ok(Disconnect::SessionInvalid) => {
                    info!(target: "weft_agent", "session expired, resetting");
                    self.connection.reset();
                    self.manager
                        .abort_all(Duration::from_secs(self.config.abort_grace_secs))
                        .await;
                }
                Ok(Disconnect::Dropped) => {
                    info!(target: "weft_agent", "disconnected");
                    self.backoff().await;
                }
                Err(err) => {
                    warn!(target: "weft_agent", %err, "connection failed");
                    self.backoff().await;
                }
            }
        }
    }

    // TODO: exponential backoff
    async fn backoff(&self) {
        let delay = Duration::from_secs_f64(rand::thread_rng().gen_range(1.0..4.0));
        info!(target: "weft_agent", ?delay, "reconnecting after delay");
        tokio::time::sleep(delay).await;
    }
}

/// Resolves on Ctrl-C or, on unix, SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut terminate =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(terminate) => terminate,
                Err(_) => {
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn encode_tags(provides: &std::collections::BTreeMap<String, Vec<String>>) -> String {
    provides
        .iter()
        .flat_map(|(key, values)| values.iter().map(move |value| format!("{key}:{value}")))
        .collect::<Vec<_>>()
        .join(";")
}

/// Run the agent loop to completion; errors only on fatal rejection.
pub async fn run_agent(
    config: AgentConfig,
    registry: Arc<Registry>,
    spawner: Arc<dyn WorkerSpawner>,
) -> anyhow::Result<()> {
    Agent::new(config, registry, spawner)
        .run()
        .await
        .context("agent terminated")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn config() -> AgentConfig {
        toml::from_str(
            r#"
            host = "localhost:7777"
            project = "proj_1"
            environment = "production"
            concurrency = 4

            [provides]
            gpu = ["a100"]
            zone = ["eu", "us"]
            "#,
        )
        .unwrap()
    }

    #[test]
    fn tags_encode_as_pairs() {
        let mut provides = BTreeMap::new();
        provides.insert("gpu".to_string(), vec!["a100".to_string()]);
        provides.insert("zone".to_string(), vec!["eu".to_string(), "us".to_string()]);
        assert_eq!(encode_tags(&provides), "gpu:a100;zone:eu;zone:us");
    }

    #[test]
    fn url_carries_identity_params() {
        let agent = Agent::new(
            config(),
            Arc::new(Registry::new()),
            Arc::new(crate::manager::SelfExecSpawner),
        );
        let url = agent.url();
        assert!(url.starts_with("ws://localhost:7777/agent?"));
        assert!(url.contains("project=proj_1"));
        assert!(url.contains("environment=production"));
        assert!(url.contains("provides=gpu:a100;zone:eu;zone:us"));
        assert!(url.contains("concurrency=4"));
        assert!(!url.contains("session="));
    }

    #[test]
    fn launch_id_suppresses_provides() {
        let mut config = config();
        config.launch_id = Some("L-9".into());
        let agent = Agent::new(
            config,
            Arc::new(Registry::new()),
            Arc::new(crate::manager::SelfExecSpawner),
        );
        let url = agent.url();
        assert!(url.contains("launch=L-9"));
        assert!(!url.contains("provides="));
    }
}
