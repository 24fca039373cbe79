//! Shared infrastructure for the payhook workspace.
//!
//! Currently just database pool construction and migrations; both the API
//! server and the worker connect through here so pool settings stay in sync.

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Workspace-root migrations, embedded at compile time.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations");

/// Create a connection pool for regular queries.
pub async fn create_pool(database_url: &str) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await?;

    tracing::debug!("Database pool created");
    Ok(pool)
}

/// Create a pool and run pending migrations.
///
/// Used by binaries at startup; safe to call from multiple processes since
/// sqlx serializes migration runs through its lock table.
pub async fn create_migration_pool(database_url: &str) -> anyhow::Result<PgPool> {
    let pool = create_pool(database_url).await?;
    MIGRATOR.run(&pool).await?;
    tracing::info!("Database migrations applied");
    Ok(pool)
}
