use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tokio::time::Duration;

use subscription_engine::billing::{
    start_reconciliation_worker, BillingCycleScheduler, BillingService, StripeLikeAdapter,
};
use subscription_engine::clock::SystemClock;
use subscription_engine::config::{self, EngineConfig};
use subscription_engine::db::PgStore;
use subscription_engine::telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    telemetry::init();

    let pool = PgPoolOptions::new()
        .max_connections(*config::DATABASE_MAX_CONNECTIONS)
        .connect(config::DATABASE_URL.as_str())
        .await
        .context("failed to connect to the subscription database")?;

    // Run migrations if available
    if let Err(error) = sqlx::migrate!().run(&pool).await {
        if *config::ALLOW_MIGRATION_FAILURE {
            tracing::warn!(
                ?error,
                "Database migrations failed but continuing due to ALLOW_MIGRATION_FAILURE"
            );
        } else {
            return Err(error).context("database migrations failed");
        }
    }

    let engine_config = EngineConfig::from_env();
    let service = BillingService::new(
        Arc::new(PgStore::new(pool)),
        Arc::new(StripeLikeAdapter),
        Arc::new(SystemClock),
        engine_config,
    );
    let _reconciliation = start_reconciliation_worker(service.clone());

    let interval = Duration::from_secs(*config::BILLING_TICK_INTERVAL_SECS);
    let scheduler = BillingCycleScheduler::new(service).spawn(interval);
    tracing::info!(
        interval_secs = interval.as_secs(),
        "billing scheduler started"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested");
    scheduler.abort();
    Ok(())
}
