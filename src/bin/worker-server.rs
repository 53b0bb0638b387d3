//! # Worker Server
//!
//! Standalone binary: loads configuration, starts the subscription loop and
//! serves the HTTP surface until SIGINT/SIGTERM, then drains gracefully.
//!
//! ## Usage
//!
//! ```bash
//! NATS_URL=nats://localhost:4222 cargo run --bin worker-server
//!
//! # Local run without a broker
//! WORKER__BROKER__PROVIDER=in_memory cargo run --bin worker-server
//! ```

use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tracing::{error, info, warn};

use worker_service::config::ConfigManager;
use worker_service::logging;
use worker_service::web::{create_app, WorkerWebState};
use worker_service::WorkerService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Configuration problems are fatal before anything is registered
    let manager = ConfigManager::load().context("failed to load worker configuration")?;
    let config = manager.config().clone();

    logging::init_tracing(&config.logging, manager.environment());

    info!("Starting worker server");
    info!("   Version: {}", env!("CARGO_PKG_VERSION"));
    info!("   Environment: {}", manager.environment());
    if let Some(path) = manager.source_path() {
        info!("   Config file: {}", path.display());
    }

    let service = WorkerService::from_config(config.clone()).context("failed to build worker service")?;
    service
        .register_default_subscription()
        .context("failed to register default subscription")?;
    service.start().context("failed to start subscription loop")?;

    info!("   Topics: {:?}", service.topics());
    info!("   Outbound topic: {}", config.topics.outbound);
    info!("   Press Ctrl+C to shutdown gracefully");

    if config.web.enabled {
        let listener = tokio::net::TcpListener::bind(&config.web.bind_address)
            .await
            .with_context(|| format!("failed to bind {}", config.web.bind_address))?;
        info!("   Web API: http://{}", config.web.bind_address);

        let app = create_app(Arc::new(WorkerWebState::new(service.clone())));
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
        {
            error!(error = %e, "HTTP server error");
        }
    } else {
        shutdown_signal().await;
    }

    info!("Shutdown signal received, draining");
    let report = service.shutdown(config.shutdown.graceful_deadline()).await;
    if report.graceful {
        info!("Worker server shutdown complete");
    } else {
        warn!(
            abandoned = report.in_flight_at_deadline,
            "Worker server shut down with handlers still running"
        );
    }

    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
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
        _ = ctrl_c => {
            info!("Received Ctrl+C");
        },
        _ = terminate => {
            info!("Received SIGTERM");
        },
    }
}
