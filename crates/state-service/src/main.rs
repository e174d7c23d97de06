//! State Service
//!
//! Runs the shared-state layer as a process: connects to Redis, exposes
//! Prometheus metrics and drives the background session sweep.
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder and scrape listener
//! 3. Connect to Redis (`RedisStore`)
//! 4. Build the `Orchestrator` and check store health
//! 5. Start the session sweeper
//! 6. Wait for shutdown signal, then stop the sweeper

#![warn(clippy::pedantic)]

use std::net::SocketAddr;
use std::sync::Arc;

use secrecy::ExposeSecret;
use state_service::clock::SystemClock;
use state_service::config::Config;
use state_service::observability::init_metrics_recorder;
use state_service::state::{HealthStatus, Orchestrator};
use state_service::store::RedisStore;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    info!("Starting State Service");

    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        store_timeout_ms = config.store.op_timeout.as_millis() as u64,
        store_max_attempts = config.store.max_attempts,
        session_ttl_seconds = config.session.ttl.as_secs(),
        session_refresh_threshold_seconds = config.session.refresh_threshold.as_secs(),
        session_sweep_interval_seconds = config.session.sweep_interval.as_secs(),
        session_failure_policy = config.session.failure_policy.as_str(),
        rate_limit_requests = config.rate_limit.max_requests,
        rate_limit_window_seconds = config.rate_limit.window.as_secs(),
        rate_limit_failure_policy = config.rate_limit.failure_policy.as_str(),
        cache_ttl_seconds = config.cache_ttl.as_secs(),
        task_queue = %config.task_queue_name,
        "Configuration loaded successfully"
    );

    // Must happen before any metrics are recorded
    let metrics_addr: SocketAddr = config.metrics_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.metrics_bind_address, "Invalid metrics bind address");
        format!("Invalid metrics bind address: {e}")
    })?;
    init_metrics_recorder(metrics_addr).map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;
    info!(addr = %metrics_addr, "Prometheus metrics listener started");

    info!("Connecting to Redis...");
    let redis_store = RedisStore::connect(config.redis_url.expose_secret())
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to connect to Redis");
            e
        })?;
    info!("Redis connection established");

    let orchestrator: Orchestrator =
        Orchestrator::new(Arc::new(redis_store), Arc::new(SystemClock), &config);

    let health = orchestrator.health().await;
    if health.status == HealthStatus::Healthy {
        info!(latency_ms = health.store_latency_ms, "Store health check passed");
    } else {
        // The connection manager reconnects on its own; keep running degraded
        warn!(
            error = health.store_error.as_deref().unwrap_or("unknown"),
            "Store health check failed at startup"
        );
    }

    let shutdown_token = CancellationToken::new();
    let sweeper = orchestrator.start_sweeper(&shutdown_token);
    info!("Session sweeper started");

    info!("State Service running - press Ctrl+C to shutdown");
    shutdown_signal().await;

    info!("Shutdown signal received, initiating graceful shutdown...");
    sweeper.stop().await;
    shutdown_token.cancel();

    info!("State Service shutdown complete");
    Ok(())
}

/// Text output by default; `STATE_LOG_FORMAT=json` for structured JSON.
fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "state_service=debug,state=debug".into());

    let json = std::env::var("STATE_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
