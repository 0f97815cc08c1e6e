//! Database access for wbsync
//!
//! SQLite through sqlx. Each indicator is a logical collection inside the
//! `observations` table (partitioned by `indicator_code`); the composite
//! primary key keeps one row per (indicator, country, year).

pub mod indicator_mapping;
pub mod observations;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;

use crate::error::StoreError;

/// Initialize database connection pool
///
/// Creates the file and parent folder if missing, then creates the tables.
/// Every pooled connection runs with WAL journaling and `synchronous = FULL`
/// so a committed batch is durable before `commit` returns.
pub async fn init_database_pool(db_path: &Path, max_connections: u32) -> Result<SqlitePool, StoreError> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let newly_created = !db_path.exists();

    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .connect_with(options)
        .await
        .map_err(|e| StoreError::Connection(format!("{}: {}", db_path.display(), e)))?;

    if newly_created {
        tracing::info!("Initialized new database: {}", db_path.display());
    } else {
        tracing::info!("Opened existing database: {}", db_path.display());
    }

    ping(&pool).await?;
    init_tables(&pool).await?;

    Ok(pool)
}

/// Cheap liveness check
pub async fn ping(pool: &SqlitePool) -> Result<(), StoreError> {
    sqlx::query("SELECT 1")
        .execute(pool)
        .await
        .map_err(|e| StoreError::Connection(e.to_string()))?;
    Ok(())
}

/// Create the observation and indicator mapping tables if they don't exist
pub async fn init_tables(pool: &SqlitePool) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS observations (
            indicator_code TEXT NOT NULL,
            country_code TEXT NOT NULL,
            country_name TEXT NOT NULL,
            year INTEGER NOT NULL,
            value REAL,
            indicator_name TEXT NOT NULL,
            last_updated TEXT NOT NULL,
            PRIMARY KEY (indicator_code, country_code, year)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_observations_indicator_year
            ON observations (indicator_code, year)
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS indicator_mapping (
            code TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    tracing::info!("Database tables initialized (observations, indicator_mapping)");

    Ok(())
}
