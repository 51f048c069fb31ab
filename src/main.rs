use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use recovery_orchestrator::api;
use recovery_orchestrator::config::{ConfigManager, FileConfigManager};
use recovery_orchestrator::{Collaborators, RecoveryOrchestrator};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("recovery.toml"));

    let config_manager: Arc<dyn ConfigManager + Send + Sync> = Arc::new(FileConfigManager::new(config_path.clone()));
    let config = config_manager
        .load_config()
        .await
        .with_context(|| format!("loading {}", config_path.display()))?;

    tracing::info!("Starting recovery orchestrator for {} agents", config.agents.len());

    let collaborators = Collaborators::from_config(&config).context("building collaborators")?;
    let orchestrator = Arc::new(
        RecoveryOrchestrator::new(config.clone(), collaborators)
            .await
            .context("initialising orchestrator")?,
    );
    orchestrator.start(Some(config_manager)).await?;

    // api server in the background when a port is configured
    if config.monitoring.api_port.is_some() {
        let api_orchestrator = orchestrator.clone();
        let api_config = Arc::new(config.clone());
        tokio::spawn(async move {
            if let Err(e) = api::start_api_server(api_orchestrator, api_config).await {
                tracing::error!("API server error: {}", e);
            }
        });
    }

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("Shutdown requested");

    orchestrator.stop().await?;
    tracing::info!("Recovery orchestrator stopped.");
    Ok(())
}
