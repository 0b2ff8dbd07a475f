//! Import statistics and database overview.
//!
//! Summarizes recent ingest runs (counts per status, rows imported, average
//! duration, success rate) together with record counts per dimension. Used
//! by `sri stats` to check that scheduled imports are landing.

use anyhow::Result;
use chrono::{Duration, NaiveDate, Utc};
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;
use crate::models::BatchStatus;

/// Batch statistics over a window of report dates.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchStatistics {
    pub since: NaiveDate,
    pub total_batches: i64,
    pub completed_batches: i64,
    pub failed_batches: i64,
    pub processing_batches: i64,
    /// Rows processed by completed batches.
    pub total_records: i64,
    /// Mean elapsed seconds of completed batches.
    pub avg_elapsed_seconds: f64,
    /// Completed share of all batches, in percent.
    pub success_rate: f64,
}

/// Statistics for batches whose report date is within the last `days` days.
pub async fn batch_statistics(pool: &SqlitePool, days: i64) -> Result<BatchStatistics> {
    let since = Utc::now().date_naive() - Duration::days(days);

    let row = sqlx::query(
        r#"
        SELECT
            COUNT(*) AS total,
            COALESCE(SUM(status = ?), 0) AS completed,
            COALESCE(SUM(status = ?), 0) AS failed,
            COALESCE(SUM(status = ?), 0) AS processing,
            COALESCE(SUM(CASE WHEN status = ? THEN processed_count END), 0) AS records,
            AVG(CASE WHEN status = ? THEN elapsed_seconds END) AS avg_elapsed
        FROM import_batches
        WHERE import_date >= ?
        "#,
    )
    .bind(BatchStatus::Completed.as_str())
    .bind(BatchStatus::Failed.as_str())
    .bind(BatchStatus::Processing.as_str())
    .bind(BatchStatus::Completed.as_str())
    .bind(BatchStatus::Completed.as_str())
    .bind(since.format("%Y-%m-%d").to_string())
    .fetch_one(pool)
    .await?;

    let total: i64 = row.get("total");
    let completed: i64 = row.get("completed");
    let avg_elapsed: Option<f64> = row.get("avg_elapsed");

    Ok(BatchStatistics {
        since,
        total_batches: total,
        completed_batches: completed,
        failed_batches: row.get("failed"),
        processing_batches: row.get("processing"),
        total_records: row.get("records"),
        avg_elapsed_seconds: avg_elapsed.unwrap_or(0.0),
        success_rate: if total > 0 {
            (completed as f64 / total as f64 * 1000.0).round() / 10.0
        } else {
            0.0
        },
    })
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config, days: i64, json: bool) -> Result<()> {
    let pool = db::connect(config).await?;
    let stats = batch_statistics(&pool, days).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        pool.close().await;
        return Ok(());
    }

    let total_records: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM search_records")
        .fetch_one(&pool)
        .await?;
    let daily: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM search_records WHERE report_date_day IS NOT NULL")
            .fetch_one(&pool)
            .await?;
    let weekly: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM search_records WHERE report_date_week IS NOT NULL")
            .fetch_one(&pool)
            .await?;
    let last_import: Option<i64> =
        sqlx::query_scalar("SELECT MAX(completed_at) FROM import_batches WHERE status = ?")
            .bind(BatchStatus::Completed.as_str())
            .fetch_one(&pool)
            .await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Search Rank Ingest - Database Stats");
    println!("===================================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Keywords:    {}", total_records);
    println!("  Daily:       {}", daily);
    println!("  Weekly:      {}", weekly);
    println!(
        "  Last import: {}",
        last_import
            .map(format_ts_relative)
            .unwrap_or_else(|| "never".to_string())
    );
    println!();
    println!("  Batches since {} ({} days):", stats.since, days);
    println!("    total:       {}", stats.total_batches);
    println!("    completed:   {}", stats.completed_batches);
    println!("    failed:      {}", stats.failed_batches);
    println!("    processing:  {}", stats.processing_batches);
    println!("    rows:        {}", stats.total_records);
    println!("    avg time:    {:.1}s", stats.avg_elapsed_seconds);
    println!("    success:     {:.1}%", stats.success_rate);
    println!();

    pool.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let delta = Utc::now().timestamp() - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
