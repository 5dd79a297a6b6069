//! Gateway server assembly and run loop.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{any, get};
use axum::{Json, Router};
use beacon_registry::ServiceRegistry;
use beacon_state::{MemoryQueue, MemoryStore, QueueBackend, StoreBackend, ValkeyQueue, ValkeyStore};
use tokio_util::sync::CancellationToken;

use crate::auth::UserExtractor;
use crate::config::{GatewayConfig, StoreBackendKind};
use crate::discovery::DiscoveryClient;
use crate::dispatch::{handle_service_path, handle_service_root, GatewayState};
use crate::error::GatewayError;
use crate::routes::RouteTable;

/// Builds the gateway router: health endpoints plus one wildcard pair per
/// service prefix.
pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/api/v1/{service}", any(handle_service_root))
        .route("/api/v1/{service}/{*path}", any(handle_service_path))
        .with_state(state)
}

/// Runs the gateway until `cancel` fires.
pub async fn run(config: GatewayConfig, cancel: CancellationToken) -> Result<(), GatewayError> {
    let (store, queues) = build_backends(&config).await?;

    let registry = ServiceRegistry::new(
        store.clone(),
        None, // The gateway observes the registry; it never registers itself.
        config.registry.to_registry_config(),
    );

    let routes = Arc::new(RouteTable::new());
    for service in &config.services {
        routes.register_service_routes(service);
    }

    let discovery = DiscoveryClient::new(
        registry,
        store,
        queues,
        routes.clone(),
        config.discovery.to_discovery_config(),
    );
    discovery.start(cancel.child_token());

    let critical = config.discovery.critical_services.clone();
    if !critical.is_empty() {
        tracing::info!(services = ?critical, "Waiting for critical services");
        discovery
            .wait_for_services(&critical, config.discovery.startup_wait())
            .await;
    }

    let state = Arc::new(GatewayState {
        discovery,
        routes,
        user_extractor: UserExtractor::new(&config.auth.jwt_secret),
        rpc_timeout: config.rpc.timeout(),
        auth_service: config.auth.auth_service.clone(),
        critical_services: critical,
    });

    let app = router(state);
    let addr = config.server.bind_address;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(GatewayError::Io)?;

    tracing::info!(address = %addr, "Gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(GatewayError::Io)?;

    tracing::info!("Gateway shutdown complete");
    Ok(())
}

async fn build_backends(
    config: &GatewayConfig,
) -> Result<(Arc<dyn StoreBackend>, Arc<dyn QueueBackend>), GatewayError> {
    match config.store.backend {
        StoreBackendKind::Memory => {
            tracing::info!("Using in-memory store backend");
            Ok((
                Arc::new(MemoryStore::new()),
                Arc::new(MemoryQueue::new()),
            ))
        }
        StoreBackendKind::Valkey => {
            let url = &config.store.url;
            tracing::info!(url = %url, "Connecting to Valkey store");

            let store = ValkeyStore::new(url, config.store.pool_size)
                .await
                .map_err(|e| GatewayError::Store(e.to_string()))?;
            let queues = ValkeyQueue::new(url, config.store.pool_size)
                .await
                .map_err(|e| GatewayError::Store(e.to_string()))?;

            Ok((Arc::new(store), Arc::new(queues)))
        }
    }
}

/// Liveness: the process is up.
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "healthy" }))
}

/// Readiness: every critical service has a live client.
async fn readiness_check(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let missing: Vec<&String> = state
        .critical_services
        .iter()
        .filter(|name| !state.discovery.has_service(name))
        .collect();

    if missing.is_empty() {
        (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "services": state.discovery.service_count(),
            })),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "missing": missing,
            })),
        )
    }
}
