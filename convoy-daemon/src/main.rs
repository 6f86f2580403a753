//! # Convoy Daemon
//!
//! Manages volumes, snapshots and backups on this host through the
//! configured storage drivers, and serves the HTTP API.
//!
//! ## Usage
//! ```bash
//! convoy-daemon --root /var/lib/convoy --driver vfs --driver-opt vfs.path=/opt/convoy
//! convoy-daemon --config /etc/convoy/convoy.yaml
//! ```

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use convoy_common::LogFormat;
use convoy_daemon::cli::Args;
use convoy_daemon::config::Config;
use convoy_daemon::server;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Initialize logging
    let log_format: LogFormat = args.log_format.parse()?;
    convoy_common::init_logging(&args.log_level, log_format)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting Convoy daemon"
    );

    // Load configuration
    let config = match &args.config {
        Some(config_path) => {
            // Explicit config file provided
            match Config::load(config_path) {
                Ok(cfg) => {
                    info!(config_path = %config_path, "Configuration loaded");
                    cfg.with_cli_overrides(&args)
                }
                Err(e) => {
                    error!(error = %e, path = %config_path, "Failed to load configuration");
                    return Err(e);
                }
            }
        }
        None => {
            // Try default location, fall back to CLI-only config
            let default_path = "/etc/convoy/convoy.yaml";
            match Config::load(default_path) {
                Ok(cfg) => {
                    info!(config_path = %default_path, "Configuration loaded from default location");
                    cfg.with_cli_overrides(&args)
                }
                Err(_) => {
                    info!("No config file found, using CLI arguments and defaults");
                    Config::default_with_cli(&args)
                }
            }
        }
    };

    info!(
        listen = %config.server.listen_address,
        root = %config.daemon.root.display(),
        drivers = ?config.daemon.drivers,
        "Daemon configured"
    );

    if let Err(e) = server::run(config).await {
        error!(error = %e, "Server failed");
        return Err(e);
    }

    Ok(())
}
