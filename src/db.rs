//! SQLite connection management.
//!
//! Every process (the coordinator and each shard worker) builds its own
//! pool from the configured path; pools are never handed across process
//! boundaries. WAL mode plus a busy timeout lets several worker processes
//! write to the same file, with SQLite serializing the writers.

use anyhow::{Context, Result};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
};
use sqlx::Connection;
use std::time::Duration;

use crate::config::Config;

fn connect_options(config: &Config) -> Result<SqliteConnectOptions> {
    let db_path = &config.db.path;

    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(config.db.busy_timeout_secs));

    Ok(options)
}

/// Create a connection pool to the configured SQLite database.
pub async fn connect(config: &Config) -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(connect_options(config)?)
        .await
        .with_context(|| format!("Failed to open database {}", config.db.path.display()))?;

    Ok(pool)
}

/// Open a single short-lived connection, used by the progress monitor so
/// that no connection is held for the whole run.
pub async fn connect_once(config: &Config) -> Result<SqliteConnection> {
    let conn = SqliteConnection::connect_with(&connect_options(config)?).await?;
    Ok(conn)
}
