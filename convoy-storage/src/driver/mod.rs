//! Driver capability model and registry.
//!
//! Drivers are registered by name with an initializer. The daemon builds
//! one instance per configured driver at startup and routes every request
//! to it through the capability accessors of [`ConvoyDriver`].
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       DriverRegistry                            │
//! │  - name -> initializer(root, config)                            │
//! └─────────────────────────┬───────────────────────────────────────┘
//!                           │ init
//!       ┌───────────────────┼───────────────────┐
//!       ▼                   ▼                   ▼
//! ┌───────────┐      ┌───────────┐       ┌───────────┐
//! │   vfs     │      │   nfs     │       │   ceph    │
//! │ vol/snap/ │      │  volume   │       │  volume   │
//! │  backup   │      │   only    │       │   only    │
//! └───────────┘      └───────────┘       └───────────┘
//! ```

mod ceph;
mod nfs;
mod traits;
mod types;
mod vfs;

pub use ceph::CephDriver;
pub use nfs::NfsDriver;
pub use traits::*;
pub use types::*;
pub use vfs::VfsDriver;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, instrument};

use crate::error::{Result, StorageError};

/// Initializer building a driver from its root directory and configuration.
pub type DriverInitFn =
    Arc<dyn Fn(&Path, &DriverConfig) -> Result<Arc<dyn ConvoyDriver>> + Send + Sync>;

/// Registry of driver initializers keyed by driver name.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    initializers: HashMap<String, DriverInitFn>,
}

impl DriverRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `vfs`, `nfs` and `ceph` drivers.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.initializers.insert(
            vfs::DRIVER_NAME.to_string(),
            Arc::new(|root, config| Ok(Arc::new(VfsDriver::new(root, config)?) as Arc<dyn ConvoyDriver>)),
        );
        registry.initializers.insert(
            nfs::DRIVER_NAME.to_string(),
            Arc::new(|root, config| Ok(Arc::new(NfsDriver::new(root, config)?) as Arc<dyn ConvoyDriver>)),
        );
        registry.initializers.insert(
            ceph::DRIVER_NAME.to_string(),
            Arc::new(|root, config| Ok(Arc::new(CephDriver::new(root, config)?) as Arc<dyn ConvoyDriver>)),
        );
        registry
    }

    /// Register a driver initializer. Registering a name twice is an error.
    pub fn register<F>(&mut self, name: &str, init: F) -> Result<()>
    where
        F: Fn(&Path, &DriverConfig) -> Result<Arc<dyn ConvoyDriver>> + Send + Sync + 'static,
    {
        if self.initializers.contains_key(name) {
            return Err(StorageError::AlreadyExists(format!("driver {}", name)));
        }
        debug!(driver = %name, "Registering driver");
        self.initializers.insert(name.to_string(), Arc::new(init));
        Ok(())
    }

    /// Whether a driver of this name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.initializers.contains_key(name)
    }

    /// Registered driver names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.initializers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Build driver `name` rooted at `<root>/<name>`.
    #[instrument(skip(self, config), fields(driver = %name))]
    pub fn init(&self, name: &str, root: &Path, config: &DriverConfig) -> Result<Arc<dyn ConvoyDriver>> {
        let init = self
            .initializers
            .get(name)
            .ok_or_else(|| StorageError::NotFound(format!("driver {}", name)))?;

        let driver_root = driver_root(root, name);
        crate::util::ensure_dir(&driver_root)?;

        let driver = init(&driver_root, config)?;
        info!(root = %driver_root.display(), "Driver initialized");
        Ok(driver)
    }
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("drivers", &self.names())
            .finish()
    }
}

/// Directory a driver keeps its own state in.
pub fn driver_root(root: &Path, name: &str) -> PathBuf {
    root.join(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockCapabilities, MockDriver};

    #[test]
    fn test_defaults_are_registered() {
        let registry = DriverRegistry::with_defaults();
        assert_eq!(registry.names(), vec!["ceph", "nfs", "vfs"]);
        assert!(registry.contains("vfs"));
        assert!(!registry.contains("s3"));
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = DriverRegistry::new();
        registry
            .register("mock", |_, _| Ok(Arc::new(MockDriver::new("mock", MockCapabilities::all())) as Arc<dyn ConvoyDriver>))
            .unwrap();
        let err = registry
            .register("mock", |_, _| Ok(Arc::new(MockDriver::new("mock", MockCapabilities::all())) as Arc<dyn ConvoyDriver>))
            .unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists(_)));
    }

    #[test]
    fn test_init_unknown_driver() {
        let dir = tempfile::tempdir().unwrap();
        let registry = DriverRegistry::new();
        let err = registry
            .init("nope", dir.path(), &DriverConfig::new())
            .err()
            .unwrap();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_init_creates_driver_root() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = DriverRegistry::new();
        MockDriver::register(&mut registry, "mock", MockCapabilities::volume_only()).unwrap();

        let driver = registry.init("mock", dir.path(), &DriverConfig::new()).unwrap();
        assert_eq!(driver.name(), "mock");
        assert!(dir.path().join("mock").is_dir());
        assert!(driver.volume_ops().is_ok());
        assert!(matches!(
            driver.snapshot_ops().err().unwrap(),
            StorageError::NotSupported { .. }
        ));
    }
}
