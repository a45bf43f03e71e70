//! Name-keyed registry of storage engines.
//!
//! A database's configuration names its backend; the registry turns that
//! name plus a directory into an open [`KeyStore`]. Built with the two
//! bundled engines; callers may register more.

use crate::engine::{MemoryStore, WalStore};
use crate::keystore::{KeyStore, StorageError};
use crate::wal::FsyncPolicy;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

type Opener = Box<dyn Fn(&Path, FsyncPolicy) -> Result<Arc<dyn KeyStore>, StorageError> + Send + Sync>;

pub struct BackendRegistry {
    openers: BTreeMap<String, Opener>,
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.openers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        let mut registry = Self {
            openers: BTreeMap::new(),
        };
        registry.register("memory", |_, _| Ok(Arc::new(MemoryStore::new())));
        registry.register("wal", |dir, fsync| Ok(Arc::new(WalStore::open(dir, fsync)?)));
        registry
    }
}

impl BackendRegistry {
    /// Registry holding `memory` and `wal`.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: &str, opener: F)
    where
        F: Fn(&Path, FsyncPolicy) -> Result<Arc<dyn KeyStore>, StorageError> + Send + Sync + 'static,
    {
        self.openers.insert(name.to_string(), Box::new(opener));
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.openers.keys().map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.openers.contains_key(name)
    }

    /// Open the backend called `name` rooted at `dir`.
    pub fn open(
        &self,
        name: &str,
        dir: &Path,
        fsync: FsyncPolicy,
    ) -> Result<Arc<dyn KeyStore>, StorageError> {
        let opener = self
            .openers
            .get(name)
            .ok_or_else(|| StorageError::UnknownBackend(name.to_string()))?;
        opener(dir, fsync)
    }
}
