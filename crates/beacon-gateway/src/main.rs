//! Beacon gateway binary.
//!
//! HTTP ingress that routes requests onto queue-RPC backends discovered
//! from the shared service registry.

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use beacon_gateway::{run, GatewayConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("beacon_gateway=info".parse()?),
        )
        .init();

    info!("Beacon gateway starting");

    let config = load_config();

    info!(
        bind_address = %config.server.bind_address,
        store = ?config.store.backend,
        services = config.services.len(),
        "Configuration loaded"
    );

    let cancel = CancellationToken::new();

    let cancel_on_signal = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received, initiating graceful shutdown");
        cancel_on_signal.cancel();
    });

    if let Err(e) = run(config, cancel).await {
        error!(error = %e, "Gateway error");
        return Err(e.into());
    }

    Ok(())
}

fn load_config() -> GatewayConfig {
    match GatewayConfig::load() {
        Ok(config) => config,
        Err(e) => {
            info!(error = %e, "Failed to load gateway.toml, using default configuration");
            GatewayConfig::default()
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C");
        }
        () = terminate => {
            info!("Received SIGTERM");
        }
    }
}
