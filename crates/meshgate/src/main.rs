//! Meshgate gateway binary.
//!
//! `meshgate serve` runs the MCP endpoint with a colocated job worker.
//! Host, port, and path come from flags or `MESHGATE_*` environment
//! variables.

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Args, Parser, Subcommand};
use meshgate_logging::{init_logging, LogConfig};
use meshgate_mcp::{BackendRegistry, Gateway, GatewayConfig};
use meshgate_protocol::{Scope, DEFAULT_TENANT_ID, DEFAULT_WORKSPACE_ID};
use meshgate_security::StaticKeyAuthenticator;
use meshgate_state::Job;
use meshgate_store::{Workspace, WorkspaceMode};
use meshgate_worker::{JobExecutor, Worker, WorkerConfig};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "meshgate", about = "Multi-backend MCP gateway for 3D-modeling backends")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the gateway (MCP endpoint + colocated worker)
    Serve(ServeArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Bind host
    #[arg(long, env = "MESHGATE_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Bind port
    #[arg(long, env = "MESHGATE_PORT", default_value_t = 8736)]
    port: u16,

    /// MCP endpoint path
    #[arg(long = "path", env = "MESHGATE_PATH", default_value = "/mcp")]
    path: String,

    /// Agent key accepted as a member of the default workspace
    #[arg(long, env = "MESHGATE_AGENT_KEY")]
    agent_key: Option<String>,

    /// Skip the colocated job worker
    #[arg(long)]
    no_worker: bool,

    /// Verbose console logging
    #[arg(long, short)]
    verbose: bool,
}

/// Runs claimed jobs against the default backend.
struct RegistryExecutor {
    registry: Arc<BackendRegistry>,
}

#[async_trait]
impl JobExecutor for RegistryExecutor {
    async fn execute(&self, job: &Job) -> Result<Value, String> {
        let backend = self
            .registry
            .default_backend()
            .ok_or_else(|| "no default backend registered".to_string())?;
        let scope = Scope::new(
            DEFAULT_TENANT_ID,
            job.workspace_id.clone(),
            job.project_id.clone(),
        );
        backend.execute_job(&job.kind, &job.payload, &scope).await
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => serve(args).await,
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    init_logging(LogConfig {
        app_name: "meshgate",
        verbose: args.verbose,
    })?;

    let mut config = GatewayConfig::default();
    config.http.host = args.host;
    config.http.port = args.port;
    config.http.path = args.path;

    let authenticator = Arc::new(StaticKeyAuthenticator::new());
    if let Some(key) = &args.agent_key {
        authenticator.register_workspace_key(key.clone(), "acct_local", DEFAULT_WORKSPACE_ID);
        info!("Registered agent key for the default workspace");
    }

    let gateway = Gateway::build(config, authenticator);

    // A fresh deployment is usable without setup: one open workspace.
    gateway
        .workspaces
        .put_workspace(Workspace {
            workspace_id: DEFAULT_WORKSPACE_ID.to_string(),
            tenant_id: DEFAULT_TENANT_ID.to_string(),
            name: "Default Workspace".to_string(),
            mode: WorkspaceMode::AllOpen,
            created_by: "system".to_string(),
            created_at: 0,
            updated_at: 0,
        })
        .await
        .context("Failed to seed the default workspace")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutdown requested");
        let _ = shutdown_tx.send(true);
    });

    if !args.no_worker {
        let worker = Worker::new(
            WorkerConfig::default(),
            gateway.queue.clone(),
            Arc::new(RegistryExecutor {
                registry: gateway.registry.clone(),
            }),
        );
        let worker_shutdown = shutdown_rx.clone();
        info!("Starting colocated worker {}", worker.worker_id());
        tokio::spawn(async move {
            worker.run(worker_shutdown).await;
        });
    }

    gateway.serve(shutdown_rx).await
}
