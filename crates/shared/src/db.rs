//! Database pool and migration helpers

use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};

/// Create the pool used for regular queries
pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await?;

    tracing::debug!("Postgres pool created");
    Ok(pool)
}

/// Create a small pool with generous timeouts for running migrations
pub async fn create_migration_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(30))
        .connect(database_url)
        .await
}

/// Apply the embedded migrations in `crates/shared/migrations`
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("Database migrations applied");
    Ok(())
}
