//! HTTP ingress gateway for beacon.
//!
//! The gateway resolves each inbound request to a backend service via the
//! discovery client, maps the path onto a message pattern through the route
//! table, and forwards it over queue RPC, translating the reply (and auth
//! cookie side effects) back into an HTTP response.

pub mod auth;
pub mod config;
pub mod discovery;
pub mod dispatch;
pub mod error;
pub mod routes;
pub mod server;

pub use config::GatewayConfig;
pub use error::GatewayError;
pub use server::run;
