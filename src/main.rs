use std::sync::Arc;

use anyhow::Context;
use fleet_messenger::config::load_config;
use fleet_messenger::{MessengerService, TypeRegistry};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = load_config().context("Failed to load messenger configuration")?;
    info!(label = %config.label, exchanges = config.exchanges.len(), "Starting messenger");

    let connection = Arc::new(config.connection());
    let messenger = config.exchanges().into_iter().fold(
        MessengerService::new(connection, Arc::new(TypeRegistry::new()), config.settings()),
        MessengerService::with_exchange,
    );

    messenger.start().await.context("Failed to start messenger")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    messenger.stop().await.context("Failed to stop messenger")?;
    Ok(())
}
