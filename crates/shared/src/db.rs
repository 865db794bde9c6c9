//! Database pool helpers
//!
//! Two pool flavors: the regular request pool (sized for concurrent
//! handlers, short acquire timeout) and a migration pool (single
//! connection, generous timeouts, bypasses transaction poolers that
//! reject prepared statements).

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Create the request-serving connection pool.
pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(16)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(5))
        .idle_timeout(Duration::from_secs(600))
        .connect(database_url)
        .await
}

/// Create a pool suitable for running migrations.
///
/// Single connection with long timeouts; point this at the direct database
/// URL when the main URL goes through a statement-pooling proxy.
pub async fn create_migration_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(30))
        .connect(database_url)
        .await
}

/// Run the embedded migrations.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    tracing::info!("Running database migrations");
    sqlx::migrate!("../../migrations").run(pool).await?;
    tracing::info!("Database migrations complete");
    Ok(())
}
