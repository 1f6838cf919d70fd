//! CO2 Monitor - Main Entry Point

use anyhow::{anyhow, Context};
use api::{init_logging, run_server, ServerConfig};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::load().context("Failed to load configuration")?;

    init_logging(&config).map_err(|e| anyhow!("Failed to initialize logging: {}", e))?;

    info!("=== CO2 Monitor v{} ===", env!("CARGO_PKG_VERSION"));
    info!(
        "Storage: {}",
        config.database_url.as_deref().unwrap_or("in-memory")
    );

    run_server(config)
        .await
        .map_err(|e| anyhow!("Server error: {}", e))?;

    Ok(())
}
