//! Broker Worker Service
//!
//! Consumes the routes listed in `BROKER_ROUTES` with one delivery-mode broker
//! each, until SIGINT/SIGTERM.
//!
//! ```text
//! BROKER_ROUTES=orders/created/sequential,mail/send/normal,reports/nightly/scheduled
//!   -> Broker::for_mode(mode).start(channel, topic, LoggingHandler)
//!        dispatch loop + dead-letter reclaimer (+ scheduler for scheduled routes)
//!   -> Supervisor::run_until(shutdown_signal)
//! ```
//!
//! Environment: `APP_ENV`, `RUST_LOG`, `REDIS_URL`/`REDIS_HOST`, `BROKER_*`
//! (see `BrokerConfig` and [`settings::WorkerSettings`]).

pub mod handler;
pub mod health;
pub mod settings;

use core_config::redis::RedisConfig;
use core_config::{Environment, FromEnv};
use eyre::{Result, WrapErr};
use handler::LoggingHandler;
use settings::WorkerSettings;
use std::sync::Arc;
use stream_broker::{Broker, BrokerConfig, ConnectRetry, Supervisor, connect_with_retry};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};

/// Run the worker
///
/// # Errors
///
/// Returns an error if configuration is invalid, Redis is unreachable after
/// retries, or a broker loop exits with an error.
pub async fn run() -> Result<()> {
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    stream_broker::init_metrics().wrap_err("Failed to install metrics recorder")?;

    info!(
        name = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION"),
        environment = ?environment,
        "Starting broker worker"
    );

    let broker_config = BrokerConfig::from_env().wrap_err("Failed to load broker configuration")?;
    let settings = WorkerSettings::from_env().wrap_err("Failed to load worker settings")?;
    let redis_config = RedisConfig::from_env().wrap_err("Failed to load Redis configuration")?;

    info!(
        prefix = %broker_config.prefix,
        consumers = broker_config.consumers,
        workers = broker_config.worker_pool_size,
        routes = settings.routes.len(),
        "Configuration loaded"
    );

    let redis = connect_with_retry(&redis_config.url, ConnectRetry::default())
        .await
        .wrap_err("Failed to connect to Redis")?;

    let broker = Broker::connect(redis, broker_config);

    let health_state = health::HealthState {
        redis: broker.context().redis(),
        routes: settings.routes.len(),
    };
    let health_port = settings.health_port;
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_state, health_port).await {
            error!(error = %e, "Health server failed");
        }
    });

    let handler = Arc::new(LoggingHandler);
    let mut supervisor = Supervisor::new();
    for route in &settings.routes {
        let delivery = broker.for_mode(route.mode);
        supervisor.register(delivery.as_ref(), &route.channel, &route.topic, handler.clone());
    }

    supervisor
        .run_until(shutdown_signal())
        .await
        .wrap_err("Broker loop failed")?;

    info!("Broker worker stopped");
    Ok(())
}

async fn start_health_server(state: health::HealthState, port: u16) -> Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("Failed to bind health server to {}", addr))?;

    info!(port, "Health server listening");

    axum::serve(listener, health::router(state))
        .await
        .wrap_err("Health server failed")?;

    Ok(())
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, initiating shutdown"),
        _ = terminate => info!("Received SIGTERM, initiating shutdown"),
    }
}
