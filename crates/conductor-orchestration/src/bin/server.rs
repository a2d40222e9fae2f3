//! # Conductor Server
//!
//! Standalone deployment target for the orchestration system: dispatcher
//! workers, reply consumer, and recovery loop over the configured database.
//!
//! ## Usage
//!
//! ```bash
//! # Run with defaults (DATABASE_URL from the environment)
//! cargo run --bin conductor-server
//!
//! # Run with an explicit configuration file
//! CONDUCTOR_CONFIG_PATH=config/conductor.toml cargo run --bin conductor-server
//! ```

use std::time::Duration;

use tokio::signal;
use tracing::{error, info};

use conductor_orchestration::bootstrap::ConductorRuntime;
use conductor_shared::logging;
use conductor_shared::messaging::MessageTransport;
use conductor_shared::ConductorConfig;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    logging::init_tracing();

    info!("Starting Conductor Server...");
    info!("   Version: {}", env!("CARGO_PKG_VERSION"));

    let config = ConductorConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    let shutdown_timeout_ms = config.shutdown_timeout_ms;

    // Loopback transport; broker bindings attach here when deployed against
    // an external bus.
    let transport = MessageTransport::in_memory();

    let runtime = ConductorRuntime::bootstrap(config, transport)
        .await
        .map_err(|e| format!("Failed to bootstrap runtime: {e}"))?;

    info!("Conductor Server started successfully!");
    info!("   Press Ctrl+C to shutdown gracefully");

    shutdown_signal().await;

    info!("Shutdown signal received, initiating graceful shutdown...");

    match tokio::time::timeout(Duration::from_millis(shutdown_timeout_ms), runtime.stop()).await {
        Ok(Ok(())) => {
            info!("Conductor runtime stopped");
        }
        Ok(Err(e)) => {
            error!("Failed to stop runtime cleanly: {}", e);
        }
        Err(_) => {
            error!(
                timeout_ms = shutdown_timeout_ms,
                "Graceful shutdown timed out, forcing exit"
            );
        }
    }

    info!("Conductor Server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C");
        },
        _ = terminate => {
            info!("Received SIGTERM");
        },
    }
}
