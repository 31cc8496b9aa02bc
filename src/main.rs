//! BaatCheet governance core.
//!
//! Main entry point. Loads configuration, connects to PostgreSQL when one is
//! configured, starts the key pool and webhook engine, and coordinates
//! graceful shutdown.

use std::time::Duration;

use anyhow::{Context, Result};
use baatcheet::{App, Config};
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    init_tracing(&config.rust_log)?;

    info!("Starting BaatCheet governance core");
    info!(
        database_url = config.database_url_masked().as_deref().unwrap_or("<in-memory>"),
        max_connections = config.database_max_connections,
        delivery_timeout_seconds = config.delivery_timeout_seconds,
        delivery_max_attempts = config.delivery_max_attempts,
        webhook_disable_threshold = config.webhook_disable_threshold,
        "Configuration loaded"
    );

    let database = match config.database_url.as_deref() {
        Some(url) => {
            let pool = create_database_pool(url, config.database_max_connections).await?;
            info!("Database connection pool established");
            Some(pool)
        },
        None => None,
    };

    let app = App::init(config, database).await?;

    let status = app.status().await;
    let healthy = status.pool.providers.iter().filter(|provider| provider.healthy).count();
    info!(healthy_providers = healthy, persistent = status.persistent, "BaatCheet governance core ready");

    shutdown_signal().await;
    info!("Shutdown signal received, starting graceful shutdown");

    app.shutdown().await;

    info!("BaatCheet shutdown complete");
    Ok(())
}

/// Initializes tracing with the configured filter.
fn init_tracing(filter: &str) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_new(filter).context("Invalid log filter")?;

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).try_init().context("Failed to install tracing")?;
    Ok(())
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(url: &str, max_connections: u32) -> Result<sqlx::PgPool> {
    let mut retries = 0;
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);

    loop {
        match PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .fetch_one(&pool)
                    .await
                    .context("Failed to verify database connection")?;

                return Ok(pool);
            },
            Err(e) if retries < MAX_RETRIES => {
                retries += 1;
                info!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    error = %e,
                    "Database connection failed, retrying..."
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("Failed to create database connection pool after retries");
            },
        }
    }
}

/// Waits for shutdown signal (CTRL+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received CTRL+C signal");
        },
        () = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
