//! logfleet log manager.
//!
//! Watches the pods of the declared workloads and keeps the logkit agent
//! fleet configured to collect their log volumes.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use logfleet_manager::config::LogFormat;
use logfleet_manager::kube_observer::KubeObserver;
use logfleet_manager::{load_declarations, new_agent_manager, ClusterObserver, Config, LogManager};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    match config.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
    }

    if let Err(e) = run(config).await {
        error!(error = %format!("{e:#}"), "Log manager failed");
        return Err(e);
    }
    Ok(())
}

async fn run(config: Config) -> Result<()> {
    info!(
        name = %config.name,
        namespace = %config.namespace,
        agent_type = %config.agent_type,
        log_config_dir = %config.log_config_dir.display(),
        "Starting logfleet log manager"
    );

    let declarations = load_declarations(&config.log_config_dir)?;
    info!(count = declarations.len(), "Loaded log declarations");

    let client = kube::Client::try_default()
        .await
        .context("failed to create kubernetes client")?;
    let observer: Arc<dyn ClusterObserver> = Arc::new(
        KubeObserver::connect(client.clone(), &declarations)
            .await
            .context("failed to resolve workload selectors")?,
    );
    let agents = new_agent_manager(
        config.agent_type,
        config.agent_manager_config(),
        Arc::clone(&observer),
        Some(client),
    );

    let manager = LogManager::bootstrap(declarations, observer, agents, config.manager_options()).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let manager_handle = tokio::spawn(manager.run(shutdown_rx));

    shutdown_signal().await?;
    info!("Received shutdown signal");

    let _ = shutdown_tx.send(true);
    manager_handle.await.context("log manager task failed")?;

    info!("Log manager shutdown complete");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate =
            signal(SignalKind::terminate()).context("failed to listen for SIGTERM")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.context("failed to listen for SIGINT")?,
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    Ok(())
}
