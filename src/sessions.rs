//! Upload session store.
//!
//! Tracks in-progress uploads (filename, data type and a private temp
//! directory) in the `upload_sessions` table with an expiry time. Expired
//! sessions are invisible to lookups and are removed, together with their
//! temp directories, by [`evict_expired`].
//!
//! The upload transport itself lives outside this crate; it only needs a
//! key to stash chunks under and a way to clean up after itself.

use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::db;
use crate::models::Dimension;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadSession {
    pub session_key: String,
    pub filename: String,
    pub data_type: Dimension,
    pub temp_dir: PathBuf,
    pub created_at: i64,
    pub expires_at: i64,
}

fn session_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<UploadSession> {
    let data_type: String = row.get("data_type");
    let temp_dir: String = row.get("temp_dir");
    Ok(UploadSession {
        session_key: row.get("session_key"),
        filename: row.get("filename"),
        data_type: data_type.parse()?,
        temp_dir: PathBuf::from(temp_dir),
        created_at: row.get("created_at"),
        expires_at: row.get("expires_at"),
    })
}

fn remove_dir(dir: &Path) {
    if let Err(e) = std::fs::remove_dir_all(dir) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(dir = %dir.display(), error = %e, "Failed to remove session directory");
        }
    }
}

/// Create a session with its own directory under `upload_root`.
pub async fn open_session(
    pool: &SqlitePool,
    filename: &str,
    data_type: Dimension,
    upload_root: &Path,
    ttl_secs: i64,
) -> Result<UploadSession> {
    let session_key = Uuid::new_v4().to_string();
    let temp_dir = upload_root.join(&session_key);
    std::fs::create_dir_all(&temp_dir)
        .with_context(|| format!("Failed to create {}", temp_dir.display()))?;

    let now = chrono::Utc::now().timestamp();
    let session = UploadSession {
        session_key,
        filename: filename.to_string(),
        data_type,
        temp_dir,
        created_at: now,
        expires_at: now + ttl_secs,
    };

    let inserted = sqlx::query(
        "INSERT INTO upload_sessions (session_key, filename, data_type, temp_dir, created_at, expires_at) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&session.session_key)
    .bind(&session.filename)
    .bind(session.data_type.as_str())
    .bind(session.temp_dir.to_string_lossy().into_owned())
    .bind(session.created_at)
    .bind(session.expires_at)
    .execute(pool)
    .await;

    if let Err(e) = inserted {
        remove_dir(&session.temp_dir);
        return Err(e.into());
    }
    Ok(session)
}

/// Live session by key; expired sessions read as `None`.
pub async fn get_session(pool: &SqlitePool, key: &str) -> Result<Option<UploadSession>> {
    let row = sqlx::query("SELECT * FROM upload_sessions WHERE session_key = ? AND expires_at > ?")
        .bind(key)
        .bind(chrono::Utc::now().timestamp())
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(session_from_row).transpose()
}

/// Push a live session's expiry `ttl_secs` into the future. Returns false
/// if the session is unknown or already expired.
pub async fn touch_session(pool: &SqlitePool, key: &str, ttl_secs: i64) -> Result<bool> {
    let now = chrono::Utc::now().timestamp();
    let result =
        sqlx::query("UPDATE upload_sessions SET expires_at = ? WHERE session_key = ? AND expires_at > ?")
            .bind(now + ttl_secs)
            .bind(key)
            .bind(now)
            .execute(pool)
            .await?;
    Ok(result.rows_affected() > 0)
}

/// Remove a session and its directory.
pub async fn close_session(pool: &SqlitePool, key: &str) -> Result<bool> {
    let temp_dir: Option<String> =
        sqlx::query_scalar("DELETE FROM upload_sessions WHERE session_key = ? RETURNING temp_dir")
            .bind(key)
            .fetch_optional(pool)
            .await?;

    match temp_dir {
        Some(dir) => {
            remove_dir(Path::new(&dir));
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Delete every expired session and its directory. Returns the count.
pub async fn evict_expired(pool: &SqlitePool) -> Result<u64> {
    let dirs: Vec<String> =
        sqlx::query_scalar("DELETE FROM upload_sessions WHERE expires_at <= ? RETURNING temp_dir")
            .bind(chrono::Utc::now().timestamp())
            .fetch_all(pool)
            .await?;

    for dir in &dirs {
        remove_dir(Path::new(dir));
    }
    Ok(dirs.len() as u64)
}

/// CLI entry point for `sri sessions purge`.
pub async fn run_purge(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let evicted = evict_expired(&pool).await?;
    pool.close().await;

    info!(evicted, "Evicted expired upload sessions");
    println!("sessions purge");
    println!("  evicted:  {}", evicted);
    println!("ok");
    Ok(())
}
