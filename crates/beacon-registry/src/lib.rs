//! Self-registering service registry for beacon.
//!
//! Each backend process registers one [`ServiceRegistration`] for itself in
//! the shared store and keeps it alive with a heartbeat task. Registration
//! keys embed the registration timestamp, which is the only cross-process
//! freshness signal; lease expiry is delegated to the store's TTL. The
//! registry also exposes the read side (`discover` / `healthy_services`)
//! used by the gateway's discovery client.

mod config;
mod error;
mod registry;
mod types;

pub use config::RegistryConfig;
pub use error::{RegistryError, Result};
pub use registry::{RegistrationPhase, ServiceRegistry};
pub use types::{
    parse_storage_key, RegistryEvent, ServiceRegistration, ServiceSpec, ServiceStatus, StorageKey,
};
