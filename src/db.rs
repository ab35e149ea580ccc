//! SQLite connection pool.
//!
//! One pool serves the chunk store, the ingestion journal, and the
//! dead-letter log. WAL mode keeps readers unblocked during batch commits;
//! `test_before_acquire` pre-validates every checkout so a stale connection
//! surfaces as a retryable error instead of a failed statement mid-batch.

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;

use crate::config::Config;

pub async fn connect(config: &Config) -> Result<SqlitePool> {
    let db_path = &config.db.path;

    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(config.pool.acquire_timeout_s));

    let pool = SqlitePoolOptions::new()
        .max_connections(config.pool.size + config.pool.overflow)
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(config.pool.acquire_timeout_s))
        .test_before_acquire(true)
        .connect_with(options)
        .await?;

    Ok(pool)
}
