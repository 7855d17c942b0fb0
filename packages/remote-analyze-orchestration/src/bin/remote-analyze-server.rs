//! Remote analyze server
//!
//! # Usage
//!
//! ```bash
//! # Defaults: 0.0.0.0:9090, ./workspace, ./data, SQLite store
//! remote-analyze-server
//!
//! # From a config file, with overrides
//! remote-analyze-server --config server.yaml --bind 127.0.0.1:9090 --worker-slots 8
//! ```

use anyhow::Context;
use clap::Parser;
use remote_analyze_orchestration::{
    AnalyzeService, RoundRobinSlots, Server, ServerConfig, StoreBackend, WorkerPool,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "remote-analyze-server")]
#[command(version, about = "Remote analysis server with a content-addressed source cache", long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address
    #[arg(short, long)]
    bind: Option<String>,

    /// Directory holding one subdirectory per job
    #[arg(long)]
    workspace_root: Option<PathBuf>,

    /// Directory for the state database and blob store
    #[arg(long)]
    data_root: Option<PathBuf>,

    /// Store backend (memory, sqlite)
    #[arg(long)]
    store: Option<StoreBackend>,

    /// Number of parts analyzed concurrently
    #[arg(long)]
    worker_slots: Option<usize>,

    /// Log filter, e.g. "info" or "remote_analyze_orchestration=debug"
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    log_level: String,
}

fn load_config(args: &Args) -> anyhow::Result<ServerConfig> {
    let mut config = match &args.config {
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig::default(),
    };
    config.apply_env()?;

    if let Some(bind) = &args.bind {
        config.bind = bind.clone();
    }
    if let Some(root) = &args.workspace_root {
        config.workspace_root = root.clone();
    }
    if let Some(root) = &args.data_root {
        config.data_root = root.clone();
    }
    if let Some(backend) = args.store {
        config.store.backend = backend;
    }
    if let Some(slots) = args.worker_slots {
        config.worker_slots = slots;
    }

    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_config(&args)?;
    info!(
        "Starting with workspace {} and data root {} ({:?} store, {} slots)",
        config.workspace_root.display(),
        config.data_root.display(),
        config.store.backend,
        config.worker_slots
    );

    std::fs::create_dir_all(&config.data_root)
        .with_context(|| format!("creating {}", config.data_root.display()))?;
    let workspace = config.workspace();
    workspace
        .ensure_root()
        .await
        .with_context(|| format!("creating {}", config.workspace_root.display()))?;

    let (store, queue) = config.open_backends()?;
    let service = Arc::new(AnalyzeService::new(
        store,
        queue,
        workspace,
        config.blob_store(),
    ));

    let workers = Arc::new(WorkerPool::new(
        &service,
        Arc::new(config.analyzer()),
        Arc::new(RoundRobinSlots::new(config.worker_slots)),
        config.worker_config(),
    ));

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
                return;
            }
            info!("Shutdown requested");
            shutdown.cancel();
        });
    }

    let worker_task = tokio::spawn(workers.run(shutdown.clone()));

    let listener = TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("binding {}", config.bind))?;
    let server = Server::new(service, config.max_frame_bytes);
    server.serve(listener, shutdown.clone()).await?;

    shutdown.cancel();
    worker_task.await??;
    info!("Server stopped");
    Ok(())
}
