//! # Convoy Common
//!
//! Shared utilities for the Convoy crates.
//!
//! ## Logging
//!
//! ```rust,ignore
//! use convoy_common::{init_logging, LogFormat};
//!
//! init_logging("info", LogFormat::Pretty).unwrap();
//! ```
//!
//! Operation logs share one field vocabulary (see [`logging::reason`],
//! [`logging::event`] and [`logging::object`]) so that a create/delete can be
//! followed from the `prepare` record to the `complete` record.

pub mod logging;

pub use logging::{init_logging, init_logging_json, init_logging_pretty, LogFormat};
