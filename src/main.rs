// src/main.rs

//! Reference host binary: wires the library up with the in-memory engine
//! and no hooks, for standalone and test-cluster operation.

use anyhow::{Context, Result};
use flotilla::engine::InMemoryEngine;
use flotilla::hooks::HookDispatcher;
use flotilla::{Daemon, DaemonConfig};
use std::env;
use std::sync::Arc;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    let config_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
        .unwrap_or("config.toml");

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .compact()
        .init();

    let config = DaemonConfig::from_file(config_path)
        .with_context(|| format!("failed to load configuration from {config_path:?}"))?;

    let engine = InMemoryEngine::new(config.advertise_address());
    let hooks = Arc::new(HookDispatcher::default());

    let daemon = Daemon::new(config, engine, hooks)
        .await
        .context("failed to initialize daemon")?;

    if let Err(e) = daemon.run().await {
        error!(error = %e, "daemon exited with an error");
        std::process::exit(1);
    }

    Ok(())
}
