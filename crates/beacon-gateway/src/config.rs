//! Gateway configuration: TOML file plus `GATEWAY_`-prefixed environment
//! overrides, with serde-level defaults throughout.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use beacon_registry::RegistryConfig;
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;

use crate::discovery::DiscoveryConfig;
use crate::error::GatewayError;
use crate::routes::ServiceRouteConfig;

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewayConfig {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Backing store for the registry and RPC queues.
    #[serde(default)]
    pub store: StoreConfig,

    /// Registry prefix, TTLs, and lifecycle tunables.
    #[serde(default)]
    pub registry: RegistrySettings,

    /// Discovery cadence and startup requirements.
    #[serde(default)]
    pub discovery: DiscoverySettings,

    /// Token verification and auth-service identity.
    #[serde(default)]
    pub auth: AuthSettings,

    /// RPC dispatch settings.
    #[serde(default)]
    pub rpc: RpcSettings,

    /// Declared route tables, one per backend service.
    #[serde(default)]
    pub services: Vec<ServiceRouteConfig>,
}

impl GatewayConfig {
    /// Loads configuration from the default path (`gateway.toml`).
    pub fn load() -> Result<Self, GatewayError> {
        Self::load_from("gateway.toml")
    }

    /// Loads configuration from a file; `GATEWAY_`-prefixed environment
    /// variables override file settings (`GATEWAY_SERVER__BIND_ADDRESS=...`).
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, GatewayError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(GatewayError::Config(format!(
                "configuration file not found: {}",
                path.display()
            )));
        }

        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("GATEWAY_").split("__"))
            .extract()
            .map_err(|e| GatewayError::Config(e.to_string()))
    }

    /// Parses configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self, GatewayError> {
        Figment::new()
            .merge(Toml::string(content))
            .extract()
            .map_err(|e| GatewayError::Config(e.to_string()))
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address and port to bind the gateway to.
    #[serde(default = "default_bind_address")]
    pub bind_address: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
        }
    }
}

const fn default_bind_address() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8460)
}

/// Store backend selection.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackendKind,

    /// Valkey/Redis URL; unused by the memory backend.
    #[serde(default = "default_store_url")]
    pub url: String,

    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackendKind::default(),
            url: default_store_url(),
            pool_size: default_pool_size(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackendKind {
    /// In-process store: single-gateway dev mode only.
    Memory,
    #[default]
    Valkey,
}

fn default_store_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

const fn default_pool_size() -> usize {
    8
}

/// Registry tunables, mirrored into [`RegistryConfig`].
#[derive(Debug, Clone, Deserialize)]
pub struct RegistrySettings {
    #[serde(default = "default_registry_prefix")]
    pub prefix: String,

    #[serde(default = "default_event_channel")]
    pub event_channel: String,

    #[serde(default = "default_service_ttl_secs")]
    pub service_ttl_secs: u64,

    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,

    #[serde(default = "default_reregistration_backoff_secs")]
    pub reregistration_backoff_secs: u64,

    /// Delete registrations that fail the heartbeat recency check.
    #[serde(default = "default_true")]
    pub cleanup_stale: bool,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            prefix: default_registry_prefix(),
            event_channel: default_event_channel(),
            service_ttl_secs: default_service_ttl_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            grace_period_ms: default_grace_period_ms(),
            reregistration_backoff_secs: default_reregistration_backoff_secs(),
            cleanup_stale: true,
        }
    }
}

impl RegistrySettings {
    pub fn to_registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            prefix: self.prefix.clone(),
            event_channel: self.event_channel.clone(),
            service_ttl: Duration::from_secs(self.service_ttl_secs),
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
            grace_period: Duration::from_millis(self.grace_period_ms),
            reregistration_backoff: Duration::from_secs(self.reregistration_backoff_secs),
            cleanup_stale: self.cleanup_stale,
            ..RegistryConfig::default()
        }
    }
}

fn default_registry_prefix() -> String {
    "beacon:services".to_string()
}

fn default_event_channel() -> String {
    "beacon:events".to_string()
}

const fn default_service_ttl_secs() -> u64 {
    30
}

const fn default_heartbeat_interval_secs() -> u64 {
    10
}

const fn default_grace_period_ms() -> u64 {
    1_000
}

const fn default_reregistration_backoff_secs() -> u64 {
    5
}

const fn default_true() -> bool {
    true
}

/// Discovery cadence and startup requirements.
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoverySettings {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Services the gateway actively waits for before accepting traffic.
    #[serde(default)]
    pub critical_services: Vec<String>,

    #[serde(default = "default_startup_wait_secs")]
    pub startup_wait_secs: u64,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            debounce_ms: default_debounce_ms(),
            critical_services: Vec::new(),
            startup_wait_secs: default_startup_wait_secs(),
        }
    }
}

impl DiscoverySettings {
    pub fn to_discovery_config(&self) -> DiscoveryConfig {
        DiscoveryConfig {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            debounce: Duration::from_millis(self.debounce_ms),
        }
    }

    pub fn startup_wait(&self) -> Duration {
        Duration::from_secs(self.startup_wait_secs)
    }
}

const fn default_poll_interval_secs() -> u64 {
    30
}

const fn default_debounce_ms() -> u64 {
    1_000
}

const fn default_startup_wait_secs() -> u64 {
    30
}

/// Token verification and auth-service identity.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthSettings {
    /// HMAC secret for access-token verification.
    #[serde(default)]
    pub jwt_secret: String,

    /// Name of the service whose responses carry refresh tokens.
    #[serde(default = "default_auth_service")]
    pub auth_service: String,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            auth_service: default_auth_service(),
        }
    }
}

fn default_auth_service() -> String {
    "auth".to_string()
}

/// RPC dispatch settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcSettings {
    #[serde(default = "default_rpc_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_rpc_timeout_secs(),
        }
    }
}

impl RpcSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

const fn default_rpc_timeout_secs() -> u64 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let config = GatewayConfig::default();
        assert_eq!(config.server.bind_address.port(), 8460);
        assert_eq!(config.rpc.timeout_secs, 30);
        assert_eq!(config.discovery.debounce_ms, 1_000);
        assert_eq!(config.registry.prefix, "beacon:services");
        assert!(config.services.is_empty());
    }

    #[test]
    fn parse_full_config() {
        let config = GatewayConfig::parse(
            r#"
            [server]
            bind_address = "0.0.0.0:9000"

            [store]
            backend = "memory"

            [discovery]
            poll_interval_secs = 60
            critical_services = ["auth", "users"]

            [auth]
            jwt_secret = "dev-secret"

            [[services]]
            service_name = "users"

            [[services.routes]]
            method = "GET"
            path = "/users/:id"
            message_pattern = "users.getById"
            description = "Fetch one user"

            [[services.routes]]
            method = "GET"
            path = "/"
            message_pattern = "users.listAll"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.bind_address.port(), 9000);
        assert_eq!(config.store.backend, StoreBackendKind::Memory);
        assert_eq!(config.discovery.poll_interval_secs, 60);
        assert_eq!(config.discovery.critical_services, vec!["auth", "users"]);
        assert_eq!(config.services.len(), 1);
        assert_eq!(config.services[0].routes.len(), 2);
        assert_eq!(config.services[0].routes[0].message_pattern, "users.getById");
    }

    #[test]
    fn registry_settings_convert_to_config() {
        let settings = RegistrySettings {
            service_ttl_secs: 12,
            grace_period_ms: 250,
            ..RegistrySettings::default()
        };

        let config = settings.to_registry_config();
        assert_eq!(config.service_ttl, Duration::from_secs(12));
        assert_eq!(config.grace_period, Duration::from_millis(250));
        assert_eq!(config.prefix, "beacon:services");
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let result = GatewayConfig::load_from("/nonexistent/gateway.toml");
        assert!(matches!(result, Err(GatewayError::Config(_))));
    }
}
