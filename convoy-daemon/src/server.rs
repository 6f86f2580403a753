//! Daemon bootstrap and server lifecycle.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

use convoy_storage::DriverRegistry;

use crate::config::Config;
use crate::daemon::Daemon;
use crate::http_server;

/// Load the daemon state with the built-in drivers and serve the API.
pub async fn run(config: Config) -> Result<()> {
    run_with_registry(config, DriverRegistry::with_defaults()).await
}

/// Like [`run`] with an explicit driver registry.
pub async fn run_with_registry(config: Config, registry: DriverRegistry) -> Result<()> {
    let daemon_config = config
        .daemon
        .load_or_persist()
        .context("Failed to initialize daemon root")?;

    let daemon = Daemon::new(&daemon_config, &registry).context("Failed to start daemon")?;

    match daemon.info().await {
        Ok(status) => {
            for (driver, driver_info) in &status.drivers {
                info!(driver = %driver, info = ?driver_info, "Driver ready");
            }
            info!(
                root = %status.root,
                default_driver = %status.default_driver,
                volumes = status.volume_count,
                "Daemon initialized"
            );
        }
        Err(e) => warn!(error = %e, "Cannot query driver status"),
    }

    let addr: SocketAddr = config
        .server
        .listen_address
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid listen address: {}", e))?;

    http_server::run_http_server(addr, Arc::new(daemon)).await
}
