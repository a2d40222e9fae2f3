//! # Database Access
//!
//! Pool construction and the embedded migrator. All conductor state lives in
//! six tables (`process`, `process_log`, `command`, `command_dlq`, `outbox`,
//! `inbox`); the models in [`crate::models`] own the SQL against them.

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::config::DatabaseConfig;
use crate::errors::ConductorResult;

pub mod unit_of_work;

pub use unit_of_work::UnitOfWork;

/// Embedded migrations, used by the server binary at startup and by
/// `#[sqlx::test(migrator = "conductor_shared::database::MIGRATOR")]` tests.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations");

/// Build a connection pool from configuration
pub async fn connect(config: &DatabaseConfig) -> ConductorResult<PgPool> {
    let url = config.resolve_url()?;
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_seconds))
        .connect(&url)
        .await?;
    Ok(pool)
}

/// Run pending migrations against the pool
pub async fn migrate(pool: &PgPool) -> ConductorResult<()> {
    MIGRATOR.run(pool).await?;
    Ok(())
}
