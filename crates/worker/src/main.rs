//! Payhook Background Worker
//!
//! Handles scheduled jobs including:
//! - Webhook queue processing (every minute)
//! - Webhook event cleanup (daily at 3:00 AM UTC)
//! - Health check heartbeat (every 5 minutes)
//!
//! The sweep job picks up events the API server's fire-and-forget tasks
//! missed: server restarts mid-processing, database blips, and anything
//! stuck in `processing` past the claim timeout.

use std::sync::Arc;
use std::time::Duration;

use payhook_billing::BillingService;
use payhook_shared::create_pool;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

/// Events claimed per sweep pass
const SWEEP_BATCH_SIZE: i64 = 100;

/// Days to keep processed webhook events before deletion
const WEBHOOK_RETENTION_DAYS: i32 = 30;

/// Delete processed webhook events older than the retention window.
/// Rows in `pending`, `processing`, or `error` state are kept for triage.
async fn cleanup_old_webhook_events(pool: &sqlx::PgPool, retention_days: i32) {
    let result = sqlx::query(
        r#"
        DELETE FROM webhook_events
        WHERE processing_result IN ('success', 'ignored')
          AND created_at < NOW() - $1 * INTERVAL '1 day'
        "#,
    )
    .bind(retention_days)
    .execute(pool)
    .await;

    match result {
        Ok(r) => info!(deleted = r.rows_affected(), "Webhook event cleanup complete"),
        Err(e) => error!(error = %e, "Webhook event cleanup failed"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting Payhook Worker");

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = create_pool(&database_url).await?;
    info!("Database pool created");

    let billing = Arc::new(BillingService::from_env(pool.clone())?);

    // Catch up on anything that accumulated while the worker was down
    match billing.processor.process_pending(SWEEP_BATCH_SIZE).await {
        Ok(count) => info!(count = count, "Startup webhook sweep complete"),
        Err(e) => error!(error = %e, "Startup webhook sweep failed"),
    }

    // Create scheduler
    let scheduler = JobScheduler::new().await?;

    // Job 1: Process webhook queue (every minute)
    let sweep_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 * * * * *", move |_uuid, _l| {
            let billing = sweep_billing.clone();
            Box::pin(async move {
                match billing.processor.process_pending(SWEEP_BATCH_SIZE).await {
                    Ok(0) => {}
                    Ok(count) => info!(count = count, "Webhook sweep processed events"),
                    Err(e) => error!(error = %e, "Webhook sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Webhook queue processing (every minute)");

    // Job 2: Cleanup old webhook events (daily at 3:00 AM UTC)
    let cleanup_pool = pool.clone();
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_uuid, _l| {
            let pool = cleanup_pool.clone();
            Box::pin(async move {
                info!("Running webhook event cleanup");
                cleanup_old_webhook_events(&pool, WEBHOOK_RETENTION_DAYS).await;
            })
        })?)
        .await?;
    info!("Scheduled: Webhook event cleanup (daily at 3:00 AM UTC)");

    // Job 3: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    // Start the scheduler
    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Payhook Worker started successfully with 3 scheduled jobs");

    // Keep the main task running
    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
