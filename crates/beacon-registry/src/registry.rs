//! Registration lifecycle for the current process.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Instant;

use beacon_state::{LockBackend, LockError, StoreBackend};
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::RegistryConfig;
use crate::error::{RegistryError, Result};
use crate::types::{
    now_millis, parse_storage_key, RegistryEvent, ServiceRegistration, ServiceSpec, ServiceStatus,
};

/// Where this process's registration currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationPhase {
    Unregistered,
    Registering,
    Active,
    /// Superseded by another process; terminal for the heartbeat.
    Deprecated,
}

#[derive(Debug)]
enum RegistrationState {
    Unregistered,
    Registering,
    Active(ServiceRegistration),
    Deprecated,
}

impl RegistrationState {
    fn phase(&self) -> RegistrationPhase {
        match self {
            Self::Unregistered => RegistrationPhase::Unregistered,
            Self::Registering => RegistrationPhase::Registering,
            Self::Active(_) => RegistrationPhase::Active,
            Self::Deprecated => RegistrationPhase::Deprecated,
        }
    }
}

/// Owns at most one live registration for this process and keeps the
/// registry free of stale or duplicate entries for the same service name.
///
/// Cloning shares the underlying state; the heartbeat task is owned by the
/// registry and cancelled on deregistration or supersession.
#[derive(Clone)]
pub struct ServiceRegistry {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn StoreBackend>,
    lock: Option<Arc<dyn LockBackend>>,
    config: RegistryConfig,
    state: Mutex<RegistrationState>,
    /// Serialises registrations within this process, with or without the
    /// distributed lock.
    registration_gate: Mutex<()>,
    heartbeat: Mutex<Option<CancellationToken>>,
    last_reregistration: Mutex<Option<Instant>>,
}

impl ServiceRegistry {
    /// Creates a registry. Passing `None` for `lock` runs in fast-iteration
    /// mode: registration is serialised locally only.
    pub fn new(
        store: Arc<dyn StoreBackend>,
        lock: Option<Arc<dyn LockBackend>>,
        config: RegistryConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                lock,
                config,
                state: Mutex::new(RegistrationState::Unregistered),
                registration_gate: Mutex::new(()),
                heartbeat: Mutex::new(None),
                last_reregistration: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Current lifecycle phase.
    pub async fn phase(&self) -> RegistrationPhase {
        self.inner.state.lock().await.phase()
    }

    /// Snapshot of this process's registration, if active.
    pub async fn registration(&self) -> Option<ServiceRegistration> {
        match &*self.inner.state.lock().await {
            RegistrationState::Active(reg) => Some(reg.clone()),
            _ => None,
        }
    }

    /// Registers this process as the live instance of `spec.name`.
    ///
    /// Existing keys for the name are deprecated, given `grace_period` to
    /// notice, then deleted; a fresh key is written and a duplicate sweep
    /// resolves anything that raced in. Returns the new instance id.
    pub async fn register(&self, spec: ServiceSpec) -> Result<String> {
        let inner = &self.inner;
        let _gate = inner.registration_gate.lock().await;

        let guard = match &inner.lock {
            Some(lock) => {
                let resource = inner.config.lock_resource(&spec.name);
                match lock
                    .acquire(&resource, inner.config.lock_ttl, inner.config.lock_wait)
                    .await
                {
                    Ok(guard) => Some(guard),
                    Err(LockError::Timeout) => {
                        return Err(RegistryError::LockAcquisition(spec.name));
                    }
                    Err(e) => return Err(RegistryError::Lock(e)),
                }
            }
            None => None,
        };

        self.stop_heartbeat().await;
        *inner.state.lock().await = RegistrationState::Registering;

        let name = spec.name.clone();
        let result = self.register_locked(spec).await;

        if result.is_err() {
            *inner.state.lock().await = RegistrationState::Unregistered;
        }

        if let Some(guard) = guard {
            if let Err(e) = guard.release().await {
                tracing::warn!(service = %name, error = %e, "Failed to release registration lock");
            }
        }

        result
    }

    async fn register_locked(&self, spec: ServiceSpec) -> Result<String> {
        let inner = &self.inner;
        let name = spec.name.clone();

        let existing = self.keys_for(Some(&name)).await;
        if !existing.is_empty() {
            tracing::info!(
                service = %name,
                count = existing.len(),
                "Deprecating existing registrations"
            );
            for key in &existing {
                self.deprecate_key(key).await;
            }
            tokio::time::sleep(inner.config.grace_period).await;
            for key in &existing {
                if let Err(e) = inner.store.del(key).await {
                    tracing::warn!(key = %key, error = %e, "Failed to delete deprecated key");
                }
            }
        }

        let instance_id = Uuid::new_v4().to_string();
        let registration = ServiceRegistration::from_spec(spec, instance_id.clone(), now_millis());
        self.write_record(&registration).await?;

        self.publish_registered(&registration).await;
        self.sweep_duplicates(&registration).await;

        tracing::info!(
            service = %registration.name,
            instance_id = %registration.instance_id,
            queue = %registration.queue_name,
            "Service registered"
        );

        *inner.state.lock().await = RegistrationState::Active(registration);
        self.start_heartbeat().await;

        Ok(instance_id)
    }

    /// Updates the reported status and writes it out immediately.
    /// No-op with a warning when this process is not registered.
    pub async fn update_status(&self, status: ServiceStatus) {
        let updated = {
            let mut state = self.inner.state.lock().await;
            match &mut *state {
                RegistrationState::Active(reg) => {
                    reg.status = status;
                    reg.last_heartbeat = now_millis();
                    Some(reg.clone())
                }
                _ => None,
            }
        };

        match updated {
            Some(reg) => {
                if let Err(e) = self.write_record(&reg).await {
                    tracing::warn!(error = %e, "Failed to write status update");
                }
            }
            None => {
                tracing::warn!(status = ?status, "Status update ignored: not registered");
            }
        }
    }

    /// Lists all non-deprecated registrations, optionally for one name.
    /// Malformed records are logged and skipped; store failures degrade to
    /// an empty result.
    pub async fn discover(&self, name: Option<&str>) -> Vec<ServiceRegistration> {
        let mut services = Vec::new();

        for key in self.keys_for(name).await {
            let json = match self.inner.store.get(&key).await {
                Ok(Some(json)) => json,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Failed to read registration");
                    continue;
                }
            };

            match serde_json::from_str::<ServiceRegistration>(&json) {
                Ok(reg) if !reg.deprecated => services.push(reg),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Skipping malformed registration");
                }
            }
        }

        services
    }

    /// Registrations that are `healthy` and within the heartbeat recency
    /// bound. Entries failing the recency check are removed from the store
    /// when `cleanup_stale` is set.
    pub async fn healthy_services(&self, name: Option<&str>) -> Vec<ServiceRegistration> {
        let now = now_millis();
        let ttl_millis = self.inner.config.service_ttl.as_millis() as u64;

        let mut healthy = Vec::new();
        let mut stale = Vec::new();

        for reg in self.discover(name).await {
            if now.saturating_sub(reg.last_heartbeat) >= ttl_millis {
                stale.push(reg);
            } else if reg.status.is_healthy() {
                healthy.push(reg);
            }
        }

        if self.inner.config.cleanup_stale {
            for reg in &stale {
                let key = reg.storage_key(&self.inner.config.prefix);
                tracing::info!(
                    service = %reg.name,
                    instance_id = %reg.instance_id,
                    "Removing stale registration"
                );
                if let Err(e) = self.inner.store.del(&key).await {
                    tracing::warn!(key = %key, error = %e, "Failed to remove stale registration");
                }
            }
        }

        healthy
    }

    /// Stops the heartbeat and deletes this instance's key. Idempotent.
    pub async fn deregister(&self) {
        self.stop_heartbeat().await;

        let mut state = self.inner.state.lock().await;
        match std::mem::replace(&mut *state, RegistrationState::Unregistered) {
            RegistrationState::Active(reg) => {
                let key = reg.storage_key(&self.inner.config.prefix);
                match self.inner.store.del(&key).await {
                    Ok(_) => {
                        tracing::info!(
                            service = %reg.name,
                            instance_id = %reg.instance_id,
                            "Service deregistered"
                        );
                    }
                    Err(e) => {
                        tracing::warn!(key = %key, error = %e, "Failed to delete registration");
                    }
                }
            }
            _ => {
                tracing::debug!("Deregister called while not registered");
            }
        }
    }

    async fn keys_for(&self, name: Option<&str>) -> Vec<String> {
        let prefix = self.inner.config.key_prefix(name);
        match self.inner.store.keys(&prefix).await {
            Ok(keys) => keys
                .into_iter()
                .filter(|k| parse_storage_key(&self.inner.config.prefix, k).is_some())
                .collect(),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to list registration keys");
                Vec::new()
            }
        }
    }

    async fn write_record(&self, registration: &ServiceRegistration) -> Result<()> {
        let key = registration.storage_key(&self.inner.config.prefix);
        let json = serde_json::to_string(registration)?;
        self.inner
            .store
            .set(&key, &json, Some(self.inner.config.service_ttl))
            .await?;
        Ok(())
    }

    /// Flags an existing key as deprecated so its owner can observe the
    /// supersession; deletes the key outright when that fails.
    async fn deprecate_key(&self, key: &str) {
        let store = &self.inner.store;

        let record = match store.get(key).await {
            Ok(Some(json)) => serde_json::from_str::<ServiceRegistration>(&json).ok(),
            Ok(None) => return,
            Err(_) => None,
        };

        let written = match record {
            Some(mut reg) => {
                reg.deprecated = true;
                reg.deprecated_at = Some(now_millis());
                reg.deprecated_by = Some(std::process::id());
                match serde_json::to_string(&reg) {
                    Ok(json) => store
                        .set(key, &json, Some(self.inner.config.service_ttl))
                        .await
                        .is_ok(),
                    Err(_) => false,
                }
            }
            None => false,
        };

        if !written {
            tracing::warn!(key = %key, "Could not flag registration, deleting it instead");
            if let Err(e) = store.del(key).await {
                tracing::warn!(key = %key, error = %e, "Failed to delete registration");
            }
        }
    }

    async fn publish_registered(&self, registration: &ServiceRegistration) {
        let event = RegistryEvent::ServiceRegistered {
            service_name: registration.name.clone(),
            timestamp: registration.registered_at,
            pid: std::process::id(),
        };

        let payload = match serde_json::to_string(&event) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to serialise registry event");
                return;
            }
        };

        if let Err(e) = self
            .inner
            .store
            .publish(&self.inner.config.event_channel, &payload)
            .await
        {
            tracing::warn!(error = %e, "Failed to publish registration event");
        }
    }

    /// Timestamp-based duplicate sweep: keep our own key if it survived,
    /// otherwise the freshest timestamp, and delete the rest.
    async fn sweep_duplicates(&self, own: &ServiceRegistration) {
        let keys = self.keys_for(Some(&own.name)).await;
        if keys.len() <= 1 {
            return;
        }

        let prefix = &self.inner.config.prefix;
        let own_key = own.storage_key(prefix);

        let keep = if keys.contains(&own_key) {
            own_key
        } else {
            let mut parsed: Vec<_> = keys
                .iter()
                .filter_map(|k| parse_storage_key(prefix, k).map(|p| (p, k.clone())))
                .collect();
            parsed.sort_by(|a, b| {
                (a.0.registered_at, &a.0.instance_id).cmp(&(b.0.registered_at, &b.0.instance_id))
            });
            match parsed.pop() {
                Some((_, key)) => key,
                None => return,
            }
        };

        for key in keys {
            if key == keep {
                continue;
            }
            tracing::info!(service = %own.name, key = %key, "Sweeping duplicate registration");
            if let Err(e) = self.inner.store.del(&key).await {
                tracing::warn!(key = %key, error = %e, "Failed to sweep duplicate");
            }
        }
    }

    async fn start_heartbeat(&self) {
        let token = CancellationToken::new();
        {
            let mut slot = self.inner.heartbeat.lock().await;
            if let Some(old) = slot.replace(token.clone()) {
                old.cancel();
            }
        }

        let inner = self.inner.clone();
        tokio::spawn(heartbeat_loop(inner, token));
    }

    async fn stop_heartbeat(&self) {
        if let Some(token) = self.inner.heartbeat.lock().await.take() {
            token.cancel();
        }
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("prefix", &self.inner.config.prefix)
            .finish_non_exhaustive()
    }
}

async fn heartbeat_loop(inner: Arc<Inner>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(inner.config.heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately and the registration was just written.
    ticker.tick().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if heartbeat_tick(&inner).await.is_break() {
            break;
        }
    }
}

/// One heartbeat: re-read our own key, then decide whether to rewrite it,
/// re-register, or stop.
async fn heartbeat_tick(inner: &Arc<Inner>) -> ControlFlow<()> {
    let registration = match &*inner.state.lock().await {
        RegistrationState::Active(reg) => reg.clone(),
        _ => return ControlFlow::Break(()),
    };

    let key = registration.storage_key(&inner.config.prefix);

    let stored = match inner.store.get(&key).await {
        Ok(stored) => stored,
        Err(e) => {
            // Store hiccups degrade to a skipped beat, not a crash.
            tracing::warn!(error = %e, "Heartbeat read failed, skipping beat");
            return ControlFlow::Continue(());
        }
    };

    match stored {
        Some(json) => {
            let deprecated = serde_json::from_str::<ServiceRegistration>(&json)
                .map(|r| r.deprecated)
                .unwrap_or(false);

            if deprecated {
                tracing::info!(
                    service = %registration.name,
                    instance_id = %registration.instance_id,
                    "Registration deprecated by another process, stopping heartbeat"
                );
                *inner.state.lock().await = RegistrationState::Deprecated;
                return ControlFlow::Break(());
            }

            let mut updated = registration;
            updated.last_heartbeat = now_millis();

            match write_record_raw(inner, &updated).await {
                Ok(()) => store_if_still_active(inner, updated).await,
                Err(e) => {
                    tracing::warn!(error = %e, "Heartbeat write failed");
                }
            }
            ControlFlow::Continue(())
        }
        None => missing_key_tick(inner, registration).await,
    }
}

/// Our key vanished: either a duplicate sweep elsewhere took it (re-register
/// with a fresh timestamp, rate-limited) or another key claims our instance
/// id (genuine conflict, stop).
async fn missing_key_tick(
    inner: &Arc<Inner>,
    registration: ServiceRegistration,
) -> ControlFlow<()> {
    let prefix = inner.config.key_prefix(Some(&registration.name));
    let keys = match inner.store.keys(&prefix).await {
        Ok(keys) => keys,
        Err(e) => {
            tracing::warn!(error = %e, "Heartbeat key scan failed, skipping beat");
            return ControlFlow::Continue(());
        }
    };

    let conflict = keys
        .iter()
        .filter_map(|k| parse_storage_key(&inner.config.prefix, k))
        .any(|p| p.instance_id == registration.instance_id);

    if conflict {
        let err = RegistryError::StaleConflict(registration.instance_id.clone());
        tracing::warn!(
            service = %registration.name,
            error = %err,
            "Clearing local registration state"
        );
        *inner.state.lock().await = RegistrationState::Unregistered;
        return ControlFlow::Break(());
    }

    {
        let mut last = inner.last_reregistration.lock().await;
        if last.is_some_and(|at| at.elapsed() < inner.config.reregistration_backoff) {
            tracing::debug!(
                service = %registration.name,
                "Re-registration suppressed by backoff"
            );
            return ControlFlow::Continue(());
        }
        *last = Some(Instant::now());
    }

    let now = now_millis();
    let mut fresh = registration;
    fresh.registered_at = now;
    fresh.last_heartbeat = now;

    match write_record_raw(inner, &fresh).await {
        Ok(()) => {
            tracing::info!(
                service = %fresh.name,
                instance_id = %fresh.instance_id,
                "Re-registered after key loss"
            );
            publish_registered_raw(inner, &fresh).await;
            store_if_still_active(inner, fresh).await;
        }
        Err(e) => {
            tracing::warn!(error = %e, "Re-registration write failed");
        }
    }

    ControlFlow::Continue(())
}

async fn write_record_raw(inner: &Arc<Inner>, registration: &ServiceRegistration) -> Result<()> {
    let key = registration.storage_key(&inner.config.prefix);
    let json = serde_json::to_string(registration)?;
    inner
        .store
        .set(&key, &json, Some(inner.config.service_ttl))
        .await?;
    Ok(())
}

async fn publish_registered_raw(inner: &Arc<Inner>, registration: &ServiceRegistration) {
    let event = RegistryEvent::ServiceRegistered {
        service_name: registration.name.clone(),
        timestamp: registration.registered_at,
        pid: std::process::id(),
    };

    match serde_json::to_string(&event) {
        Ok(payload) => {
            if let Err(e) = inner
                .store
                .publish(&inner.config.event_channel, &payload)
                .await
            {
                tracing::warn!(error = %e, "Failed to publish registration event");
            }
        }
        Err(e) => tracing::warn!(error = %e, "Failed to serialise registry event"),
    }
}

/// Writes back heartbeat-updated state unless a concurrent deregister or
/// supersession moved us off `Active` in the meantime.
async fn store_if_still_active(inner: &Arc<Inner>, updated: ServiceRegistration) {
    let mut state = inner.state.lock().await;
    if let RegistrationState::Active(current) = &*state {
        if current.instance_id == updated.instance_id {
            *state = RegistrationState::Active(updated);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_state::MemoryStore;
    use std::time::Duration;

    fn test_config() -> RegistryConfig {
        RegistryConfig {
            grace_period: Duration::from_millis(10),
            heartbeat_interval: Duration::from_secs(60),
            ..RegistryConfig::default()
        }
    }

    fn registry(store: &MemoryStore) -> ServiceRegistry {
        ServiceRegistry::new(Arc::new(store.clone()), None, test_config())
    }

    #[tokio::test]
    async fn register_then_discover() {
        let store = MemoryStore::new();
        let reg = registry(&store);

        let spec = ServiceSpec::new("auth", "1.0.0", "beacon:queue:auth")
            .with_status(ServiceStatus::Healthy)
            .with_capabilities(vec!["auth.login".into()]);

        let instance_id = reg.register(spec).await.unwrap();
        assert_eq!(reg.phase().await, RegistrationPhase::Active);

        let found = reg.discover(Some("auth")).await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].instance_id, instance_id);
        assert_eq!(found[0].queue_name, "beacon:queue:auth");
    }

    #[tokio::test]
    async fn discover_skips_malformed_records() {
        let store = MemoryStore::new();
        let reg = registry(&store);

        reg.register(ServiceSpec::new("auth", "1.0.0", "q").with_status(ServiceStatus::Healthy))
            .await
            .unwrap();

        store
            .set("beacon:services:users:123:bogus", "{not json", None)
            .await
            .unwrap();

        let found = reg.discover(None).await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "auth");
    }

    #[tokio::test]
    async fn update_status_while_unregistered_is_a_noop() {
        let store = MemoryStore::new();
        let reg = registry(&store);

        reg.update_status(ServiceStatus::Healthy).await;
        assert_eq!(reg.phase().await, RegistrationPhase::Unregistered);
    }

    #[tokio::test]
    async fn healthy_services_filters_status() {
        let store = MemoryStore::new();
        let reg = registry(&store);

        reg.register(ServiceSpec::new("auth", "1.0.0", "q1").with_status(ServiceStatus::Healthy))
            .await
            .unwrap();

        let other = registry(&store);
        other
            .register(ServiceSpec::new("users", "1.0.0", "q2"))
            .await
            .unwrap(); // stays Starting

        let healthy = reg.healthy_services(None).await;
        assert_eq!(healthy.len(), 1);
        assert_eq!(healthy[0].name, "auth");
    }
}
