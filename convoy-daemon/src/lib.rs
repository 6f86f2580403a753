//! # Convoy Daemon
//!
//! Host-local orchestration of volumes, snapshots and backups over the
//! storage drivers of `convoy-storage`.
//!
//! The daemon owns all volume and snapshot metadata, persisted as one
//! record per volume under its root, and three identity indices rebuilt
//! from those records at startup. Requests arrive over an HTTP/JSON API.
//!
//! ```rust,ignore
//! use convoy_daemon::{config::DaemonConfig, Daemon};
//! use convoy_storage::DriverRegistry;
//!
//! let daemon = Daemon::new(&DaemonConfig::default(), &DriverRegistry::with_defaults())?;
//! let volume = daemon.create_volume(Default::default()).await?;
//! ```

pub mod api;
pub mod cli;
pub mod config;
pub mod daemon;
pub mod error;
pub mod http_server;
pub mod index;
pub mod server;

pub use daemon::{Daemon, Snapshot, Volume};
pub use error::{DaemonError, Result};
pub use index::Index;
