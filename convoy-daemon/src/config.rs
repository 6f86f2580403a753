//! Configuration management for the daemon.
//!
//! The YAML file and CLI flags give the requested configuration. The storage
//! part of it is persisted as `<root>/convoy.cfg` on first start; later
//! starts with the same root reuse the persisted drivers and options.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use convoy_storage::{util, DriverConfig, OPT_MOUNT_NAMESPACE};

use crate::cli::Args;

/// Name of the persisted daemon configuration under the root.
pub const DAEMON_CONFIG_FILE: &str = "convoy.cfg";

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP server configuration
    pub server: ServerConfig,
    /// Root, drivers and driver options
    pub daemon: DaemonConfig,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| "Failed to parse config file")?;

        Ok(config)
    }

    /// Apply CLI argument overrides to the configuration.
    pub fn with_cli_overrides(mut self, args: &Args) -> Self {
        if let Some(ref listen) = args.listen {
            self.server.listen_address = listen.clone();
        }

        if let Some(ref root) = args.root {
            self.daemon.root = PathBuf::from(root);
        }

        if !args.drivers.is_empty() {
            self.daemon.drivers = args.drivers.clone();
        }

        for (key, value) in &args.driver_opts {
            self.daemon.driver_opts.insert(key.clone(), value.clone());
        }

        if let Some(ref mnt_ns) = args.mnt_ns {
            self.daemon.mount_namespace = Some(mnt_ns.clone());
        }

        self
    }

    /// Configuration from CLI arguments and defaults only.
    pub fn default_with_cli(args: &Args) -> Self {
        Self::default().with_cli_overrides(args)
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on for the HTTP API
    pub listen_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1:9100".to_string(),
        }
    }
}

/// Storage side of the daemon configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Root directory for volume records and driver state
    pub root: PathBuf,
    /// Drivers to load; the first one is the default
    pub drivers: Vec<String>,
    /// Flat driver options such as `vfs.path`
    pub driver_opts: BTreeMap<String, String>,
    /// Mount namespace file for mount commands
    pub mount_namespace: Option<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/var/lib/convoy"),
            drivers: vec!["vfs".to_string()],
            driver_opts: BTreeMap::new(),
            mount_namespace: None,
        }
    }
}

impl DaemonConfig {
    /// Options handed to every driver initializer.
    pub fn driver_config(&self) -> DriverConfig {
        let mut config: DriverConfig = self
            .driver_opts
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if let Some(ref ns) = self.mount_namespace {
            config.insert(OPT_MOUNT_NAMESPACE.to_string(), ns.clone());
        }
        config
    }

    pub fn path(&self) -> PathBuf {
        self.root.join(DAEMON_CONFIG_FILE)
    }

    /// Return the configuration persisted under `root`, or persist this one
    /// if the root has none yet.
    pub fn load_or_persist(self) -> Result<Self> {
        let path = self.path();
        if path.exists() {
            let stored: DaemonConfig = util::load_json(&path)
                .with_context(|| format!("Failed to read daemon config: {}", path.display()))?;
            if stored.drivers != self.drivers || stored.driver_opts != self.driver_opts {
                warn!(
                    path = %path.display(),
                    drivers = ?stored.drivers,
                    "Root already initialized, ignoring requested drivers and options"
                );
            }
            // The root is where the file was found, even if it was moved.
            return Ok(DaemonConfig {
                root: self.root,
                ..stored
            });
        }

        util::ensure_dir(&self.root)
            .with_context(|| format!("Failed to create root: {}", self.root.display()))?;
        util::save_json(&path, &self)
            .with_context(|| format!("Failed to write daemon config: {}", path.display()))?;
        info!(path = %path.display(), drivers = ?self.drivers, "Daemon config persisted");
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_yaml_with_defaults() {
        let config: Config = serde_yaml::from_str(
            "daemon:\n  drivers: [vfs, nfs]\n  driver_opts:\n    vfs.path: /opt/convoy\n",
        )
        .unwrap();
        assert_eq!(config.server.listen_address, "127.0.0.1:9100");
        assert_eq!(config.daemon.root, PathBuf::from("/var/lib/convoy"));
        assert_eq!(config.daemon.drivers, vec!["vfs", "nfs"]);
        assert_eq!(config.daemon.driver_opts["vfs.path"], "/opt/convoy");
    }

    #[test]
    fn test_cli_overrides() {
        let args = Args::parse_from([
            "convoy-daemon",
            "--root",
            "/tmp/convoy",
            "--listen",
            "0.0.0.0:9200",
            "--driver",
            "ceph",
            "--driver-opt",
            "ceph.defaultvolumesize=5G",
            "--mnt-ns",
            "/proc/1/ns/mnt",
        ]);
        let config = Config::default_with_cli(&args);
        assert_eq!(config.server.listen_address, "0.0.0.0:9200");
        assert_eq!(config.daemon.root, PathBuf::from("/tmp/convoy"));
        assert_eq!(config.daemon.drivers, vec!["ceph"]);

        let driver_config = config.daemon.driver_config();
        assert_eq!(driver_config["ceph.defaultvolumesize"], "5G");
        assert_eq!(driver_config[OPT_MOUNT_NAMESPACE], "/proc/1/ns/mnt");
    }

    #[test]
    fn test_persisted_config_wins() {
        let dir = tempfile::tempdir().unwrap();
        let first = DaemonConfig {
            root: dir.path().to_path_buf(),
            drivers: vec!["vfs".to_string()],
            driver_opts: BTreeMap::from([("vfs.path".to_string(), "/a".to_string())]),
            mount_namespace: None,
        };
        assert_eq!(first.clone().load_or_persist().unwrap(), first);

        let second = DaemonConfig {
            drivers: vec!["nfs".to_string()],
            ..first.clone()
        };
        assert_eq!(second.load_or_persist().unwrap(), first);
    }
}
