//! Postgres pool for the session, outbox and download-task tables

use anyhow::{Context, Result};
use fileflow_core::FileFlowConfig;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use std::str::FromStr;
use std::time::Duration;

const IDLE_TIMEOUT: Duration = Duration::from_secs(600);
const MAX_LIFETIME: Duration = Duration::from_secs(1800);

/// Pool sizing from `DB_MAX_CONNECTIONS` / `DB_TIMEOUT_SECONDS`.
pub(crate) fn pool_options(max_connections: u32, acquire_timeout: Duration) -> PgPoolOptions {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(acquire_timeout)
        .idle_timeout(IDLE_TIMEOUT)
        .max_lifetime(MAX_LIFETIME)
}

/// Connect to Postgres and bring the Fileflow schema up to date.
pub async fn setup_database(settings: &FileFlowConfig) -> Result<PgPool> {
    let connect = PgConnectOptions::from_str(&settings.database_url)
        .context("DATABASE_URL is not a valid Postgres connection string")?;
    let host = connect.get_host().to_string();
    let database = connect.get_database().unwrap_or("postgres").to_string();

    tracing::info!(
        host = %host,
        database = %database,
        max_connections = settings.db_max_connections,
        acquire_timeout_secs = settings.db_timeout_seconds,
        "Opening Fileflow database pool"
    );
    let acquire_timeout = Duration::from_secs(settings.db_timeout_seconds);
    let pool = pool_options(settings.db_max_connections, acquire_timeout)
        .connect_with(connect)
        .await
        .with_context(|| format!("Failed to reach Fileflow database {database} on {host}"))?;

    sqlx::migrate!("../../migrations")
        .run(&pool)
        .await
        .context("Failed to apply Fileflow schema migrations")?;
    tracing::info!(database = %database, "Fileflow schema is current");

    Ok(pool)
}
