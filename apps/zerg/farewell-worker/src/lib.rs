//! Farewell Worker Service
//!
//! A background worker that consumes client deletions from RabbitMQ and says goodbye.
//!
//! ## Architecture
//!
//! ```text
//! RabbitMQ queue (client_deleted)
//!   ↓ (prefetch from AMQP_DBC)
//! Supervisor<Client, FarewellHandler>
//!   ↓ (restarts the consumer, gives up after 5 failed attempts)
//! FarewellHandler
//! ```
//!
//! ## Features
//!
//! - Startup delay so the broker can come up first
//! - Bounded automatic restarts of the consumer
//! - Graceful shutdown handling
//! - Health check endpoint for Kubernetes probes

mod handler;
mod health;
mod settings;

pub use handler::FarewellHandler;
pub use health::{health_router, HealthState};
pub use settings::WorkerSettings;

use amqp_messaging::{
    metrics, AmqpConnector, ConnectionManager, ConsumeOptions, MessageService, Supervisor,
    SupervisorConfig,
};
use core_config::amqp::AmqpConfig;
use core_config::{app_info, Environment, FromEnv};
use domain_clients::{routing_keys, Client};
use eyre::{Result, WrapErr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Consumer options for the `client_deleted` queue.
///
/// No per-registration prefetch, so `AMQP_DBC` governs. Failed deliveries go back to
/// the queue.
pub fn farewell_options() -> ConsumeOptions {
    ConsumeOptions::for_queue(routing_keys::CLIENT_DELETED).with_requeue(true)
}

/// Start the health HTTP server
///
/// Provides endpoints for:
/// - Liveness probes: `/health`, `/healthz`
/// - Readiness probes: `/ready`, `/readyz`
/// - Prometheus metrics: `/metrics`
async fn start_health_server(health_state: HealthState<Client>, port: u16) -> Result<()> {
    let app = health_router(health_state);

    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("Failed to bind health server to {}", addr))?;

    info!(port = %port, "Health server listening");

    axum::serve(listener, app)
        .await
        .wrap_err("Health server failed")?;

    Ok(())
}

/// Run the farewell worker
///
/// This is the main entry point for the worker. It:
/// 1. Sets up structured logging (env-aware: JSON for prod, pretty for dev)
/// 2. Loads broker and worker settings from the environment
/// 3. Supervises the `client_deleted` consumer until shutdown
///
/// # Errors
///
/// Returns an error if:
/// - Broker or worker configuration is invalid
/// - The consumer failed too many times in a row
pub async fn run() -> Result<()> {
    core_config::tracing::install_color_eyre();

    // Initialize tracing (env-aware: JSON for prod, pretty for dev)
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    // Initialize Prometheus metrics
    metrics::init_metrics();

    let app_info = app_info!();
    info!(name = %app_info.name, version = %app_info.version, "Starting farewell worker service");
    info!("Environment: {:?}", environment);

    let amqp_config = AmqpConfig::from_env().wrap_err("Failed to load AMQP configuration")?;
    let settings = WorkerSettings::from_env().wrap_err("Failed to load worker settings")?;
    info!(
        broker = %amqp_config.redacted_uri(),
        default_prefetch = ?amqp_config.default_prefetch,
        health_port = settings.health_port,
        startup_delay_ms = settings.startup_delay.as_millis() as u64,
        "Worker configuration loaded"
    );

    let connector = Arc::new(AmqpConnector::from_config(&amqp_config));
    let service = MessageService::new(ConnectionManager::new(connector))
        .with_default_prefetch(amqp_config.default_prefetch);

    // Set up a shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Spawn shutdown signal handler
    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            error!("Error waiting for shutdown signal: {}", e);
        }
        let _ = shutdown_tx.send(true);
    });

    // Start health server in background
    let health_state = HealthState::<Client>::new(
        Arc::clone(service.consumers()),
        app_info.name,
        app_info.version,
        routing_keys::CLIENT_DELETED,
    );
    let health_port = settings.health_port;
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_state, health_port).await {
            error!(error = %e, "Health server failed");
        }
    });

    let supervisor = Supervisor::<Client, _>::new(
        Arc::clone(service.consumers()),
        Arc::new(FarewellHandler::new()),
        farewell_options(),
        SupervisorConfig::default().with_startup_delay(settings.startup_delay),
    );

    info!("Starting client farewell consumer...");
    if let Err(e) = supervisor.run(shutdown_rx).await {
        error!(error = %e, attempts = supervisor.attempts(), "Farewell consumer stopped");
        return Err(e).wrap_err("Farewell consumer gave up");
    }

    if service.connections().is_connected() {
        warn!("Broker connection still open at shutdown");
    }
    info!("Farewell worker service stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() -> Result<()> {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .wrap_err("Failed to install Ctrl+C handler")
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .wrap_err("Failed to install signal handler")?
            .recv()
            .await;
        Ok::<(), eyre::Report>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Result<()>>();

    tokio::select! {
        result = ctrl_c => {
            result?;
            info!("Received Ctrl+C, initiating shutdown...");
        },
        result = terminate => {
            result?;
            info!("Received SIGTERM, initiating shutdown...");
        },
    }

    Ok(())
}
