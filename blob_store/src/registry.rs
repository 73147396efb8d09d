//! Registry of backends keyed by symbolic name.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
};

use strum::IntoEnumIterator;
use tracing::info;

use crate::{
    BlobError,
    BlobResult,
    Capability,
    StorageBackend,
    StorageConfig,
};

#[derive(Clone)]
struct RegisteredBackend {
    backend: Arc<dyn StorageBackend>,
    capabilities: HashSet<Capability>,
}

/// Backends registered under symbolic keys such as `cache` and `store`.
///
/// Capabilities are resolved once, when a backend is registered.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: HashMap<String, RegisteredBackend>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds every configured backend.
    pub fn from_config(storages: &BTreeMap<String, StorageConfig>) -> BlobResult<Self> {
        let mut registry = Self::new();
        for (key, config) in storages {
            registry = registry.register(key, config.build()?);
        }
        Ok(registry)
    }

    pub fn register(mut self, key: &str, backend: Arc<dyn StorageBackend>) -> Self {
        let capabilities: HashSet<Capability> = Capability::iter()
            .filter(|capability| backend.supports(*capability))
            .collect();
        info!(
            key,
            backend = backend.name(),
            capabilities = ?capabilities,
            "registered storage backend"
        );

        self.backends.insert(
            key.to_string(),
            RegisteredBackend {
                backend,
                capabilities,
            },
        );
        self
    }

    pub fn get(&self, key: &str) -> BlobResult<Arc<dyn StorageBackend>> {
        self.backends
            .get(key)
            .map(|registered| registered.backend.clone())
            .ok_or_else(|| BlobError::UnknownBackend {
                key: key.to_string(),
            })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.backends.contains_key(key)
    }

    /// Capability lookup against what was resolved at registration.
    pub fn supports(&self, key: &str, capability: Capability) -> bool {
        self.backends
            .get(key)
            .is_some_and(|registered| registered.capabilities.contains(&capability))
    }

    pub fn capabilities(&self, key: &str) -> BlobResult<HashSet<Capability>> {
        self.backends
            .get(key)
            .map(|registered| registered.capabilities.clone())
            .ok_or_else(|| BlobError::UnknownBackend {
                key: key.to_string(),
            })
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.backends.keys().cloned().collect();
        keys.sort();
        keys
    }
}
