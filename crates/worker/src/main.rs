//! Auto-renewal worker
//!
//! Runs the renewal engine's scheduled jobs:
//! - Auto-renewal run (hourly by default)
//! - Expiration notices (daily at 09:00 UTC by default)
//! - Retry of failed payments (every 4 hours by default)
//!
//! Schedules come from the environment on first start and from the stored
//! job configuration afterwards. SIGINT/SIGTERM stop the scheduler and let
//! in-flight renewals finish before exiting.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use autorenew_billing::{
    HttpGateway, Notifier, PgStore, RedisLockManager, RenewalConfig, RenewalEngine,
    TracingNotifier, WebhookNotifier,
};
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Create a database connection pool
async fn create_db_pool(max_connections: u32) -> anyhow::Result<sqlx::PgPool> {
    #[allow(clippy::expect_used)] // Fail-fast on startup if required config is missing
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await?;

    info!("Database pool created");
    Ok(pool)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,autorenew_billing=debug"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn build_notifier() -> Arc<dyn Notifier> {
    match std::env::var("NOTIFY_WEBHOOK_URL") {
        Ok(url) if !url.is_empty() => {
            info!("Notifications delivered by webhook");
            Arc::new(WebhookNotifier::new(url))
        }
        _ => {
            warn!("NOTIFY_WEBHOOK_URL not set - notifications are only logged");
            Arc::new(TracingNotifier)
        }
    }
}

/// Resolve on Ctrl+C or SIGTERM
async fn shutdown_signal() -> anyhow::Result<()> {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .context("failed to install Ctrl+C handler")
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("failed to install SIGTERM handler")?
            .recv()
            .await;
        Ok::<(), anyhow::Error>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<anyhow::Result<()>>();

    tokio::select! {
        res = ctrl_c => {
            res?;
            info!("Received Ctrl+C signal, draining renewal workers");
        },
        res = terminate => {
            res?;
            info!("Received terminate signal, draining renewal workers");
        },
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment before reading RUST_LOG / LOG_FORMAT
    dotenvy::dotenv().ok();
    init_tracing();

    info!("Starting auto-renewal worker");

    let config = RenewalConfig::from_env()?;
    config.validate()?;

    // Workers plus scanner and bookkeeping queries
    let max_connections = u32::try_from(config.worker_count + 2).unwrap_or(u32::MAX);
    let pool = create_db_pool(max_connections).await?;
    let store = Arc::new(PgStore::new(pool));

    let redis_url =
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    let locks = Arc::new(RedisLockManager::connect(&redis_url).await?);

    let gateway_url = std::env::var("GATEWAY_URL").context("GATEWAY_URL must be set")?;
    let gateway_key = std::env::var("GATEWAY_API_KEY").context("GATEWAY_API_KEY must be set")?;
    let gateway = Arc::new(HttpGateway::new(gateway_url, gateway_key));

    let engine = RenewalEngine::new(store, locks, gateway, build_notifier(), config.clone())?;

    for job in engine.admin.cron_config().await? {
        info!(
            job = job.job_name.as_str(),
            schedule = %job.schedule,
            enabled = job.enabled,
            "Scheduled job"
        );
    }

    engine.admin.start_scheduler().await?;
    info!(
        workers = config.worker_count,
        "Auto-renewal worker started"
    );

    shutdown_signal().await?;

    engine.admin.stop_scheduler().await?;
    let perf = engine.admin.performance_metrics().await;
    info!(
        attempts = perf.attempts_recorded,
        batches = perf.batches_completed,
        "Shutdown complete"
    );
    Ok(())
}
