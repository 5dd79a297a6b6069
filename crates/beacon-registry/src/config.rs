use std::time::Duration;

/// Tunables for the registration lifecycle.
///
/// `grace_period` and `reregistration_backoff` are empirically chosen
/// defaults; both are plain fields so deployments (and tests) can tighten
/// or relax them.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Key prefix for registration keys; lock keys live under
    /// `{prefix}:lock:`.
    pub prefix: String,
    /// Pub/sub channel carrying [`RegistryEvent`](crate::RegistryEvent)s.
    pub event_channel: String,
    /// TTL on registration keys; also the heartbeat recency bound.
    pub service_ttl: Duration,
    /// Interval between heartbeat writes. Must be well under `service_ttl`.
    pub heartbeat_interval: Duration,
    /// TTL on the per-service registration lock.
    pub lock_ttl: Duration,
    /// Bounded wait for lock acquisition before registration fails.
    pub lock_wait: Duration,
    /// Pause between deprecating old keys and deleting them, so their
    /// heartbeats can observe the flag.
    pub grace_period: Duration,
    /// Floor between heartbeat-triggered re-registrations.
    pub reregistration_backoff: Duration,
    /// Delete registrations that fail the heartbeat recency check.
    pub cleanup_stale: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            prefix: "beacon:services".to_string(),
            event_channel: "beacon:events".to_string(),
            service_ttl: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
            lock_ttl: Duration::from_secs(15),
            lock_wait: Duration::from_secs(10),
            grace_period: Duration::from_secs(1),
            reregistration_backoff: Duration::from_secs(5),
            cleanup_stale: true,
        }
    }
}

impl RegistryConfig {
    /// The lock resource for a service name.
    #[must_use]
    pub fn lock_resource(&self, name: &str) -> String {
        format!("{}:lock:{}", self.prefix, name)
    }

    /// Key prefix listing every registration, or one service's.
    #[must_use]
    pub fn key_prefix(&self, name: Option<&str>) -> String {
        match name {
            Some(name) => format!("{}:{}:", self.prefix, name),
            None => format!("{}:", self.prefix),
        }
    }
}
