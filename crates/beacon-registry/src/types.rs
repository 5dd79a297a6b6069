//! Registration records, service status, and registry events.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Lifecycle status a service instance reports for itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    /// Instance is starting up.
    Starting,
    /// Instance is ready to serve.
    Healthy,
    /// Instance is up but failing its own checks.
    Unhealthy,
    /// Instance is draining before shutdown.
    Stopping,
}

impl ServiceStatus {
    /// Returns true if the instance can accept traffic.
    #[must_use]
    pub const fn is_healthy(self) -> bool {
        matches!(self, Self::Healthy)
    }
}

/// Input to `ServiceRegistry::register`: what this process claims to be.
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    pub name: String,
    pub version: String,
    pub queue_name: String,
    pub status: ServiceStatus,
    pub capabilities: Vec<String>,
    pub metadata: HashMap<String, String>,
    pub host: Option<String>,
    pub port: Option<u16>,
}

impl ServiceSpec {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        queue_name: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            queue_name: queue_name.into(),
            status: ServiceStatus::Starting,
            capabilities: Vec::new(),
            metadata: HashMap::new(),
            host: None,
            port: None,
        }
    }

    pub fn with_status(mut self, status: ServiceStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_endpoint(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = Some(host.into());
        self.port = Some(port);
        self
    }
}

/// One row per live backend instance, JSON-serialised into the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRegistration {
    pub name: String,
    pub version: String,
    pub instance_id: String,
    pub queue_name: String,
    pub status: ServiceStatus,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Unix millis; also the timestamp component of the storage key.
    pub registered_at: u64,
    /// Unix millis of the last heartbeat write.
    pub last_heartbeat: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default)]
    pub deprecated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deprecated_at: Option<u64>,
    /// Pid of the process that superseded this instance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deprecated_by: Option<u32>,
}

impl ServiceRegistration {
    /// Builds a fresh registration from a spec.
    pub fn from_spec(spec: ServiceSpec, instance_id: String, now: u64) -> Self {
        Self {
            name: spec.name,
            version: spec.version,
            instance_id,
            queue_name: spec.queue_name,
            status: spec.status,
            capabilities: spec.capabilities,
            metadata: spec.metadata,
            registered_at: now,
            last_heartbeat: now,
            host: spec.host,
            port: spec.port,
            deprecated: false,
            deprecated_at: None,
            deprecated_by: None,
        }
    }

    /// The composite store key for this registration:
    /// `{prefix}:{name}:{registered_at}:{instance_id}`.
    #[must_use]
    pub fn storage_key(&self, prefix: &str) -> String {
        format!(
            "{}:{}:{}:{}",
            prefix, self.name, self.registered_at, self.instance_id
        )
    }
}

/// Parsed components of a registration key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageKey {
    pub name: String,
    pub registered_at: u64,
    pub instance_id: String,
}

/// Parses `{prefix}:{name}:{timestamp}:{instance_id}`. Lock keys
/// (`{prefix}:lock:...`) and anything malformed return `None`.
#[must_use]
pub fn parse_storage_key(prefix: &str, key: &str) -> Option<StorageKey> {
    let rest = key.strip_prefix(prefix)?.strip_prefix(':')?;
    if rest.starts_with("lock:") {
        return None;
    }

    // The service name may itself contain ':', so split from the right.
    let mut parts = rest.rsplitn(3, ':');
    let instance_id = parts.next()?;
    let registered_at: u64 = parts.next()?.parse().ok()?;
    let name = parts.next()?;

    if name.is_empty() || instance_id.is_empty() {
        return None;
    }

    Some(StorageKey {
        name: name.to_string(),
        registered_at,
        instance_id: instance_id.to_string(),
    })
}

/// Event published on the shared channel when a registration is written.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RegistryEvent {
    #[serde(rename = "SERVICE_REGISTERED", rename_all = "camelCase")]
    ServiceRegistered {
        service_name: String,
        timestamp: u64,
        pid: u32,
    },
}

/// Current wall-clock time in unix millis.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_key_round_trip() {
        let spec = ServiceSpec::new("auth", "1.2.0", "beacon:queue:auth");
        let reg = ServiceRegistration::from_spec(spec, "inst-1".into(), 1_700_000_000_123);

        let key = reg.storage_key("beacon:services");
        assert_eq!(key, "beacon:services:auth:1700000000123:inst-1");

        let parsed = parse_storage_key("beacon:services", &key).unwrap();
        assert_eq!(parsed.name, "auth");
        assert_eq!(parsed.registered_at, 1_700_000_000_123);
        assert_eq!(parsed.instance_id, "inst-1");
    }

    #[test]
    fn lock_keys_are_not_registrations() {
        assert!(parse_storage_key("beacon:services", "beacon:services:lock:auth").is_none());
    }

    #[test]
    fn malformed_keys_are_rejected() {
        assert!(parse_storage_key("beacon:services", "beacon:services:auth").is_none());
        assert!(parse_storage_key("beacon:services", "beacon:services:auth:not-a-ts:i").is_none());
        assert!(parse_storage_key("beacon:services", "other:auth:123:i").is_none());
    }

    #[test]
    fn event_wire_format() {
        let event = RegistryEvent::ServiceRegistered {
            service_name: "auth".into(),
            timestamp: 42,
            pid: 1234,
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "SERVICE_REGISTERED");
        assert_eq!(json["serviceName"], "auth");
        assert_eq!(json["pid"], 1234);
    }

    #[test]
    fn status_serialises_lowercase() {
        let json = serde_json::to_string(&ServiceStatus::Healthy).unwrap();
        assert_eq!(json, "\"healthy\"");
        assert!(ServiceStatus::Healthy.is_healthy());
        assert!(!ServiceStatus::Stopping.is_healthy());
    }
}
