//! Discovery client: keeps a live map from service name to RPC client that
//! mirrors the registry, refreshed by a periodic task plus a debounced
//! subscription to registration events.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use beacon_registry::{RegistryEvent, ServiceRegistration, ServiceRegistry};
use beacon_rpc::RpcClient;
use beacon_state::{QueueBackend, StoreBackend};
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::routes::RouteTable;

/// Poll cadence while waiting for critical services at startup.
const STARTUP_POLL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Fallback full-refresh interval, insurance against missed events.
    pub poll_interval: Duration,
    /// Quiet window after the last registration event before refreshing.
    pub debounce: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            debounce: Duration::from_millis(1000),
        }
    }
}

/// A live connection to one selected instance of a service.
#[derive(Debug, Clone)]
pub struct ServiceClient {
    pub rpc: RpcClient,
    pub registration: ServiceRegistration,
}

/// Owns the service-to-client map and the tasks that keep it fresh.
#[derive(Clone)]
pub struct DiscoveryClient {
    inner: Arc<DiscoveryInner>,
}

struct DiscoveryInner {
    registry: ServiceRegistry,
    store: Arc<dyn StoreBackend>,
    queues: Arc<dyn QueueBackend>,
    routes: Arc<RouteTable>,
    clients: DashMap<String, ServiceClient>,
    config: DiscoveryConfig,
    runs: AtomicU64,
}

impl DiscoveryClient {
    pub fn new(
        registry: ServiceRegistry,
        store: Arc<dyn StoreBackend>,
        queues: Arc<dyn QueueBackend>,
        routes: Arc<RouteTable>,
        config: DiscoveryConfig,
    ) -> Self {
        Self {
            inner: Arc::new(DiscoveryInner {
                registry,
                store,
                queues,
                routes,
                clients: DashMap::new(),
                config,
                runs: AtomicU64::new(0),
            }),
        }
    }

    /// The RPC client for a service, if one is currently connected.
    pub fn client(&self, service: &str) -> Option<RpcClient> {
        self.inner.clients.get(service).map(|c| c.rpc.clone())
    }

    /// Cached registration backing the current client.
    pub fn registration(&self, service: &str) -> Option<ServiceRegistration> {
        self.inner
            .clients
            .get(service)
            .map(|c| c.registration.clone())
    }

    pub fn service_count(&self) -> usize {
        self.inner.clients.len()
    }

    pub fn has_service(&self, service: &str) -> bool {
        self.inner.clients.contains_key(service)
    }

    /// Number of completed discovery passes.
    pub fn discovery_runs(&self) -> u64 {
        self.inner.runs.load(Ordering::Relaxed)
    }

    /// One full refresh of the client map from the registry. Never fails;
    /// a registry that cannot be read simply looks empty.
    pub async fn discover_services(&self) {
        discover(&self.inner).await;
    }

    /// Spawns the periodic fallback and the debounced event listener. Both
    /// stop when `cancel` fires; cancelling twice is harmless.
    pub fn start(&self, cancel: CancellationToken) {
        let inner = self.inner.clone();
        let poll_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.config.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    () = poll_cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                discover(&inner).await;
            }
        });

        let inner = self.inner.clone();
        tokio::spawn(event_loop(inner, cancel));
    }

    /// Actively waits until every named service has a client, bounded by
    /// `max_wait`. Returns false (and proceeds) on timeout rather than
    /// hanging startup forever.
    pub async fn wait_for_services(&self, services: &[String], max_wait: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + max_wait;

        loop {
            self.discover_services().await;

            let missing: Vec<&String> = services
                .iter()
                .filter(|name| !self.inner.clients.contains_key(*name))
                .collect();

            if missing.is_empty() {
                return true;
            }

            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(
                    missing = ?missing,
                    "Startup discovery timed out, proceeding with available services"
                );
                return false;
            }

            tokio::time::sleep(STARTUP_POLL).await;
        }
    }
}

impl std::fmt::Debug for DiscoveryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryClient")
            .field("services", &self.inner.clients.len())
            .finish_non_exhaustive()
    }
}

async fn discover(inner: &Arc<DiscoveryInner>) {
    let healthy = inner.registry.healthy_services(None).await;

    // Collapse multiple instances of one name to a deterministic winner:
    // lowest instance id.
    let mut selected: HashMap<String, ServiceRegistration> = HashMap::new();
    for registration in healthy {
        match selected.get(&registration.name) {
            Some(current) if current.instance_id <= registration.instance_id => {}
            _ => {
                selected.insert(registration.name.clone(), registration);
            }
        }
    }

    for (name, registration) in &selected {
        let stale_queue = inner
            .clients
            .get(name)
            .map(|existing| existing.registration.queue_name != registration.queue_name);

        match stale_queue {
            None | Some(true) => {
                if stale_queue == Some(true) {
                    tracing::info!(
                        service = %name,
                        queue = %registration.queue_name,
                        "Queue address changed, recreating RPC client"
                    );
                } else {
                    tracing::info!(
                        service = %name,
                        queue = %registration.queue_name,
                        instance_id = %registration.instance_id,
                        "Connecting to discovered service"
                    );
                }
                inner.clients.insert(
                    name.clone(),
                    ServiceClient {
                        rpc: RpcClient::new(inner.queues.clone(), registration.queue_name.clone()),
                        registration: registration.clone(),
                    },
                );
            }
            Some(false) => {
                if let Some(mut existing) = inner.clients.get_mut(name) {
                    existing.registration = registration.clone();
                }
            }
        }

        inner
            .routes
            .update_service_capabilities(name, &registration.capabilities);
    }

    // Drop clients whose service vanished from the registry.
    let vanished: Vec<String> = inner
        .clients
        .iter()
        .map(|entry| entry.key().clone())
        .filter(|name| !selected.contains_key(name))
        .collect();

    for name in vanished {
        tracing::info!(service = %name, "Service no longer registered, dropping client");
        inner.clients.remove(&name);
        inner.routes.remove_service(&name);
    }

    inner.runs.fetch_add(1, Ordering::Relaxed);
    tracing::debug!(services = inner.clients.len(), "Discovery pass complete");
}

/// Listens for registration events and schedules a debounced refresh: a
/// burst of restarts triggers one discovery pass, not one per event.
async fn event_loop(inner: Arc<DiscoveryInner>, cancel: CancellationToken) {
    let channel = inner.registry.config().event_channel.clone();

    let mut rx = match inner.store.subscribe(&channel).await {
        Ok(rx) => rx,
        Err(e) => {
            tracing::warn!(
                channel = %channel,
                error = %e,
                "Event subscription failed, relying on periodic discovery only"
            );
            return;
        }
    };

    loop {
        let received = tokio::select! {
            () = cancel.cancelled() => return,
            received = rx.recv() => received,
        };

        match received {
            Ok(payload) => log_event(&payload),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Event stream lagged, refreshing anyway");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }

        // Debounce window: restart it on every further event.
        let mut deadline = tokio::time::Instant::now() + inner.config.debounce;
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep_until(deadline) => break,
                received = rx.recv() => match received {
                    Ok(payload) => {
                        log_event(&payload);
                        deadline = tokio::time::Instant::now() + inner.config.debounce;
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        deadline = tokio::time::Instant::now() + inner.config.debounce;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }

        discover(&inner).await;
    }
}

fn log_event(payload: &str) {
    match serde_json::from_str::<RegistryEvent>(payload) {
        Ok(RegistryEvent::ServiceRegistered {
            service_name, pid, ..
        }) => {
            tracing::debug!(service = %service_name, pid, "Registration event received");
        }
        Err(e) => {
            tracing::debug!(error = %e, "Unrecognised event payload");
        }
    }
}
