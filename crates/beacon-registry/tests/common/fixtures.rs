//! Test fixtures for registry integration tests.

use std::time::{SystemTime, UNIX_EPOCH};

use beacon_registry::{ServiceRegistration, ServiceSpec, ServiceStatus};
use beacon_state::{MemoryStore, StoreBackend};

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

/// Builder for registration records written directly into the store,
/// bypassing the registry (to simulate other processes or stale leftovers).
pub struct RegistrationBuilder {
    name: String,
    instance_id: String,
    queue_name: String,
    status: ServiceStatus,
    registered_at: u64,
    last_heartbeat: u64,
}

impl RegistrationBuilder {
    pub fn new(name: &str, instance_id: &str) -> Self {
        let now = now_millis();
        Self {
            name: name.to_string(),
            instance_id: instance_id.to_string(),
            queue_name: format!("beacon:queue:{name}"),
            status: ServiceStatus::Healthy,
            registered_at: now,
            last_heartbeat: now,
        }
    }

    pub fn with_status(mut self, status: ServiceStatus) -> Self {
        self.status = status;
        self
    }

    /// Ages the heartbeat by `millis` to simulate a stopped heartbeat.
    pub fn heartbeat_age(mut self, millis: u64) -> Self {
        self.last_heartbeat = now_millis().saturating_sub(millis);
        self
    }

    pub fn registered_at(mut self, at: u64) -> Self {
        self.registered_at = at;
        self
    }

    pub fn build(self) -> ServiceRegistration {
        let spec = ServiceSpec::new(self.name, "1.0.0", self.queue_name)
            .with_status(self.status);
        let mut reg = ServiceRegistration::from_spec(spec, self.instance_id, self.registered_at);
        reg.last_heartbeat = self.last_heartbeat;
        reg
    }

    /// Builds the record and writes it under its storage key, without a TTL
    /// so the store itself never reclaims it.
    pub async fn write(self, store: &MemoryStore, prefix: &str) -> ServiceRegistration {
        let reg = self.build();
        store
            .set(
                &reg.storage_key(prefix),
                &serde_json::to_string(&reg).unwrap(),
                None,
            )
            .await
            .unwrap();
        reg
    }
}

/// Counts non-deprecated registration records currently stored for `name`.
pub async fn live_registrations(store: &MemoryStore, prefix: &str, name: &str) -> usize {
    let keys = store.keys(&format!("{prefix}:{name}:")).await.unwrap();
    let mut live = 0;

    for key in keys {
        if let Some(json) = store.get(&key).await.unwrap() {
            if let Ok(reg) = serde_json::from_str::<ServiceRegistration>(&json) {
                if !reg.deprecated {
                    live += 1;
                }
            }
        }
    }

    live
}
