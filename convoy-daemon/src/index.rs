//! String-keyed identity index.
//!
//! The daemon keeps three of these: UUID existence (uuid -> object kind),
//! name bindings (name -> uuid) and snapshot ownership (snapshot uuid ->
//! volume uuid). They are rebuilt from volume records at startup.

use std::collections::HashMap;

use crate::error::{DaemonError, Result};

/// A map with at most one value per key.
#[derive(Debug, Clone, Default)]
pub struct Index {
    label: &'static str,
    entries: HashMap<String, String>,
}

impl Index {
    /// Create an empty index; `label` names it in error messages.
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            entries: HashMap::new(),
        }
    }

    /// Bind `key` to `value`.
    ///
    /// Adding an existing binding again is a no-op; binding a key to a
    /// second value fails and keeps the first one.
    pub fn add(&mut self, key: &str, value: &str) -> Result<()> {
        if key.is_empty() || value.is_empty() {
            return Err(DaemonError::Validation(format!(
                "{} index needs a non-empty key and value, got {:?} -> {:?}",
                self.label, key, value
            )));
        }
        match self.entries.get(key) {
            Some(existing) if existing == value => Ok(()),
            Some(existing) => Err(DaemonError::Conflict(format!(
                "{} {} is already associated with {}",
                self.label, key, existing
            ))),
            None => {
                self.entries.insert(key.to_string(), value.to_string());
                Ok(())
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Remove the binding of `key`. Deleting an unbound key means the
    /// caller lost track of its own state.
    pub fn delete(&mut self, key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(DaemonError::invariant(format!(
                "delete of empty key from {} index",
                self.label
            )));
        }
        if self.entries.remove(key).is_none() {
            return Err(DaemonError::invariant(format!(
                "{} {} is not in the index",
                self.label, key
            )));
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
