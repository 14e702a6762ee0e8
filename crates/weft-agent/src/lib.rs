// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! weft-agent
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;
use weft_worker::WorkerHost;

mod agent;
mod config;
mod manager;
#[allow(unsafe_code)]
mod signal;

pub use agent::{run_agent, Agent};
pub use config::{AgentConfig, BlobStoreConfig, ConfigError};
pub use manager::{
    ExecutionStatus, Manager, SelfExecSpawner, SpawnedWorker, WorkerSpawner, AGENT_THRESHOLD,
    EXECUTION_THRESHOLD, WORKER_ENV,
};
// The pieces an embedding binary needs alongside `launch`.
pub use weft_worker::{context, Registry, SubmitOptions, TargetHandler};

/// CLI options for an agent binary.
#[derive(Parser, Debug)]
#[command(name = "weft-agent", version, about = "Weft worker agent")]
struct Cli {
    /// Path to the agent configuration file.
    #[arg(long, default_value = "weft.toml")]
    config: PathBuf,

    /// Override the orchestrator host.
    #[arg(long)]
    host: Option<String>,

    /// Override the project id.
    #[arg(long)]
    project: Option<String>,

    /// Override the environment name.
    #[arg(long)]
    environment: Option<String>,

    /// Override the declared concurrency.
    #[arg(long)]
    concurrency: Option<u32>,

    /// One-shot launch id handed over on first connect.
    #[arg(long)]
    launch: Option<String>,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

impl Cli {
    fn into_config(self) -> anyhow::Result<AgentConfig> {
        let mut config = AgentConfig::load(&self.config)
            .with_context(|| format!("loading {}", self.config.display()))?;
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(project) = self.project {
            config.project = project;
        }
        if let Some(environment) = self.environment {
            config.environment = environment;
        }
        if let Some(concurrency) = self.concurrency {
            config.concurrency = Some(concurrency);
        }
        if let Some(launch) = self.launch {
            config.launch_id = Some(launch);
        }
        Ok(config)
    }
}

/// Run one execution in worker mode: pipes on stdin/stdout, then exit.
pub async fn run_worker(config: &AgentConfig, registry: Arc<Registry>) -> anyhow::Result<()> {
    let store = Arc::new(config.build_stores().await);
    let serialisers = config.build_serialisers()?;
    WorkerHost::new(registry, store, serialisers, config.blob_threshold)
        .run(tokio::io::stdin(), tokio::io::stdout())
        .await
        .context("worker failed")
}

/// The entry point agent binaries call from `main` with their registry.
///
/// Parses the CLI, loads configuration, and either runs the agent loop
/// or, when spawned with the worker-mode environment flag, hosts a single
/// execution over stdio.
pub fn launch(registry: Registry) -> anyhow::Result<()> {
    let cli = Cli::parse();
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env()
    };
    // Logs go to stderr: in worker mode stdout belongs to the pipe
    // protocol, and the parent forwards stderr lines as error logs.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let worker_mode = std::env::var(WORKER_ENV).is_ok();
    let config = cli.into_config()?;
    let registry = Arc::new(registry);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building runtime")?;
    if worker_mode {
        runtime.block_on(run_worker(&config, registry))
    } else {
        runtime.block_on(run_agent(config, registry, Arc::new(SelfExecSpawner)))
    }
}
