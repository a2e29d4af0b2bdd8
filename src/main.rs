//! spibridge - SPI flash bridge emulator daemon
//!
//! Serves an in-memory flash chip over the bridge wire protocol so hosts can
//! be exercised without hardware.

use spibridge_emu::{BridgeServer, Config, ServerConfig};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // File from SPIBRIDGE_CONFIG if set, then env overrides.
    let config = match Config::load() {
        Ok(c) => {
            if let Ok(path) = std::env::var("SPIBRIDGE_CONFIG") {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            return Err(e.into());
        }
    };

    let flash = config.flash.build()?;
    let chip = flash.config().clone();

    tracing::info!("Starting spibridge emulator");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!("  Max connections: {}", config.network.max_connections);
    tracing::info!("  JEDEC id: {}", hex::encode_upper(chip.jedec_id));
    tracing::info!("  Flash size: {} KiB", chip.size / 1024);
    match &config.flash.image {
        Some(path) => tracing::info!("  Image: {}", path.display()),
        None => tracing::info!("  Image: none (erased)"),
    }

    let server_config = ServerConfig::new(config.network.bind_addr)
        .with_max_connections(config.network.max_connections);
    let server = Arc::new(BridgeServer::new(server_config, flash));

    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping emulator...");
        shutdown_server.shutdown();
    });

    // Blocks until shutdown
    server.run().await?;

    tracing::info!("Emulator stopped");
    Ok(())
}
