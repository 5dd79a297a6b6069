//! Shared helpers for registry integration tests.

pub mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use beacon_registry::{RegistryConfig, ServiceRegistry};
use beacon_state::{MemoryLockProvider, MemoryStore};

/// A store + lock pair shared by several registries, simulating independent
/// processes against one backing store.
pub struct TestCluster {
    pub store: MemoryStore,
    pub lock: MemoryLockProvider,
    pub config: RegistryConfig,
}

impl TestCluster {
    pub fn new() -> Self {
        Self::with_config(fast_config())
    }

    pub fn with_config(config: RegistryConfig) -> Self {
        Self {
            store: MemoryStore::new(),
            lock: MemoryLockProvider::new(),
            config,
        }
    }

    /// A registry using the shared distributed lock.
    pub fn registry(&self) -> ServiceRegistry {
        ServiceRegistry::new(
            Arc::new(self.store.clone()),
            Some(Arc::new(self.lock.clone())),
            self.config.clone(),
        )
    }

    /// A registry in fast-iteration mode (local serialisation only).
    pub fn registry_without_lock(&self) -> ServiceRegistry {
        ServiceRegistry::new(Arc::new(self.store.clone()), None, self.config.clone())
    }
}

/// Registry config with intervals tightened for tests. The heartbeat is
/// left slow so individual tests opt into heartbeat behaviour explicitly.
pub fn fast_config() -> RegistryConfig {
    RegistryConfig {
        grace_period: Duration::from_millis(20),
        lock_ttl: Duration::from_secs(5),
        lock_wait: Duration::from_secs(5),
        heartbeat_interval: Duration::from_secs(60),
        reregistration_backoff: Duration::from_millis(50),
        ..RegistryConfig::default()
    }
}
