//! Import batch lifecycle: the audit row for one ingest run.
//!
//! A batch is created `PROCESSING` when dispatch starts and finalized
//! exactly once as `COMPLETED` or `FAILED`. Every finalizing update is
//! conditioned on `status = 'PROCESSING'`, so a terminal batch can never be
//! overwritten.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::time::Instant;
use tracing::warn;

use crate::config::Config;
use crate::db;
use crate::models::{BatchStatus, Dimension, ImportBatch};
use crate::progress::format_number;

/// Stored error messages are cut to this many characters.
pub const MAX_ERROR_CHARS: usize = 500;

pub fn truncate_message(message: &str) -> String {
    message.chars().take(MAX_ERROR_CHARS).collect()
}

/// Handle on the batch row owned by the current run.
#[derive(Debug)]
pub struct BatchTracker {
    id: i64,
    started: Instant,
}

impl BatchTracker {
    /// Insert a new `PROCESSING` batch with an estimated record count.
    pub async fn create(
        pool: &SqlitePool,
        batch_name: &str,
        import_date: NaiveDate,
        dimension: Dimension,
        estimated_records: u64,
    ) -> Result<Self> {
        let now = chrono::Utc::now().timestamp();
        let id = sqlx::query(
            r#"
            INSERT INTO import_batches
                (batch_name, import_date, total_records, processed_count, elapsed_seconds,
                 status, is_day_data, is_week_data, error_message, created_at)
            VALUES (?, ?, ?, 0, 0, ?, ?, ?, '', ?)
            "#,
        )
        .bind(batch_name)
        .bind(import_date.format("%Y-%m-%d").to_string())
        .bind(estimated_records as i64)
        .bind(BatchStatus::Processing.as_str())
        .bind(dimension == Dimension::Daily)
        .bind(dimension == Dimension::Weekly)
        .bind(now)
        .execute(pool)
        .await
        .context("Failed to create import batch")?
        .last_insert_rowid();

        Ok(Self {
            id,
            started: Instant::now(),
        })
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn elapsed_secs(&self) -> i64 {
        self.started.elapsed().as_secs() as i64
    }

    /// Mark the batch completed. `total_records` replaces the estimate.
    pub async fn complete(
        &self,
        pool: &SqlitePool,
        processed_count: u64,
        total_records: u64,
    ) -> Result<bool> {
        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query(
            r#"
            UPDATE import_batches
            SET status = ?, processed_count = ?, total_records = ?, elapsed_seconds = ?,
                completed_at = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(BatchStatus::Completed.as_str())
        .bind(processed_count as i64)
        .bind(total_records as i64)
        .bind(self.elapsed_secs())
        .bind(now)
        .bind(self.id)
        .bind(BatchStatus::Processing.as_str())
        .execute(pool)
        .await?;

        Ok(self.check_finalized(result.rows_affected()))
    }

    /// Mark the batch failed with a truncated error message.
    pub async fn fail(&self, pool: &SqlitePool, processed_count: u64, message: &str) -> Result<bool> {
        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query(
            r#"
            UPDATE import_batches
            SET status = ?, processed_count = ?, elapsed_seconds = ?, error_message = ?,
                completed_at = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(BatchStatus::Failed.as_str())
        .bind(processed_count as i64)
        .bind(self.elapsed_secs())
        .bind(truncate_message(message))
        .bind(now)
        .bind(self.id)
        .bind(BatchStatus::Processing.as_str())
        .execute(pool)
        .await?;

        Ok(self.check_finalized(result.rows_affected()))
    }

    fn check_finalized(&self, rows: u64) -> bool {
        if rows == 0 {
            warn!(batch = self.id, "Batch already finalized; update ignored");
        }
        rows > 0
    }
}

fn batch_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<ImportBatch> {
    let import_date: String = row.get("import_date");
    let status: String = row.get("status");
    Ok(ImportBatch {
        id: row.get("id"),
        batch_name: row.get("batch_name"),
        import_date: NaiveDate::parse_from_str(&import_date, "%Y-%m-%d")
            .with_context(|| format!("Bad import_date '{}'", import_date))?,
        total_records: row.get("total_records"),
        processed_count: row.get("processed_count"),
        elapsed_seconds: row.get("elapsed_seconds"),
        status: status.parse()?,
        is_day_data: row.get("is_day_data"),
        is_week_data: row.get("is_week_data"),
        error_message: row.get("error_message"),
        created_at: row.get("created_at"),
        completed_at: row.get("completed_at"),
    })
}

pub async fn get_batch(pool: &SqlitePool, id: i64) -> Result<Option<ImportBatch>> {
    let row = sqlx::query("SELECT * FROM import_batches WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(batch_from_row).transpose()
}

/// Status view of a batch for display.
#[derive(Debug, Clone, Serialize)]
pub struct BatchProgress {
    pub id: i64,
    pub batch_name: String,
    pub import_date: NaiveDate,
    pub status: BatchStatus,
    pub progress_percent: f64,
    pub elapsed_seconds: i64,
    pub processed_count: i64,
    pub total_records: i64,
    pub error_message: String,
}

pub fn progress_percent(processed: i64, total: i64) -> f64 {
    let pct = processed as f64 / total.max(1) as f64 * 100.0;
    ((pct * 10.0).round() / 10.0).min(100.0)
}

impl From<ImportBatch> for BatchProgress {
    fn from(b: ImportBatch) -> Self {
        Self {
            id: b.id,
            progress_percent: progress_percent(b.processed_count, b.total_records),
            batch_name: b.batch_name,
            import_date: b.import_date,
            status: b.status,
            elapsed_seconds: b.elapsed_seconds,
            processed_count: b.processed_count,
            total_records: b.total_records,
            error_message: b.error_message,
        }
    }
}

/// Most recent batches, newest first, optionally only those carrying the
/// given dimension.
pub async fn recent_batches(
    pool: &SqlitePool,
    dimension: Option<Dimension>,
    limit: i64,
) -> Result<Vec<BatchProgress>> {
    let filter = match dimension {
        Some(Dimension::Daily) => "WHERE is_day_data = 1",
        Some(Dimension::Weekly) => "WHERE is_week_data = 1",
        None => "",
    };
    let sql = format!(
        "SELECT * FROM import_batches {} ORDER BY created_at DESC, id DESC LIMIT ?",
        filter
    );

    let rows = sqlx::query(&sql).bind(limit).fetch_all(pool).await?;
    rows.iter()
        .map(|row| batch_from_row(row).map(BatchProgress::from))
        .collect()
}

/// CLI entry point for `sri status`.
pub async fn run_status(
    config: &Config,
    dimension: Option<Dimension>,
    limit: i64,
    json: bool,
) -> Result<()> {
    let pool = db::connect(config).await?;
    let batches = recent_batches(&pool, dimension, limit).await?;
    pool.close().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&batches)?);
        return Ok(());
    }

    if batches.is_empty() {
        println!("No import batches.");
        return Ok(());
    }

    println!(
        "{:<6} {:<40} {:<10} {:>10} {:>8} {:>12} {:>12}",
        "ID", "BATCH", "STATUS", "REPORT", "PROGRESS", "PROCESSED", "ELAPSED"
    );
    for b in &batches {
        println!(
            "{:<6} {:<40} {:<10} {:>10} {:>7.1}% {:>12} {:>11}s",
            b.id,
            b.batch_name,
            b.status,
            b.import_date.to_string(),
            b.progress_percent,
            format_number(b.processed_count.max(0) as u64),
            b.elapsed_seconds
        );
        if b.status == BatchStatus::Failed && !b.error_message.is_empty() {
            println!("       error: {}", b.error_message);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_pool;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 2).unwrap()
    }

    #[tokio::test]
    async fn create_then_complete() {
        let (_tmp, pool) = test_pool().await;
        let tracker = BatchTracker::create(&pool, "a.csv", day(), Dimension::Daily, 120)
            .await
            .unwrap();

        let batch = get_batch(&pool, tracker.id()).await.unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::Processing);
        assert_eq!(batch.total_records, 120);
        assert!(batch.is_day_data && !batch.is_week_data);
        assert_eq!(batch.completed_at, None);

        assert!(tracker.complete(&pool, 100, 100).await.unwrap());
        let batch = get_batch(&pool, tracker.id()).await.unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::Completed);
        assert_eq!(batch.processed_count, 100);
        assert_eq!(batch.total_records, 100);
        assert!(batch.completed_at.is_some());
    }

    #[tokio::test]
    async fn terminal_batch_is_not_overwritten() {
        let (_tmp, pool) = test_pool().await;
        let tracker = BatchTracker::create(&pool, "a.csv", day(), Dimension::Weekly, 10)
            .await
            .unwrap();

        assert!(tracker.fail(&pool, 3, "boom").await.unwrap());
        assert!(!tracker.complete(&pool, 10, 10).await.unwrap());

        let batch = get_batch(&pool, tracker.id()).await.unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::Failed);
        assert_eq!(batch.error_message, "boom");
        assert_eq!(batch.processed_count, 3);
    }

    #[tokio::test]
    async fn long_errors_are_truncated() {
        let (_tmp, pool) = test_pool().await;
        let tracker = BatchTracker::create(&pool, "a.csv", day(), Dimension::Daily, 1)
            .await
            .unwrap();
        tracker.fail(&pool, 0, &"é".repeat(800)).await.unwrap();

        let batch = get_batch(&pool, tracker.id()).await.unwrap().unwrap();
        assert_eq!(batch.error_message.chars().count(), MAX_ERROR_CHARS);
    }

    #[test]
    fn percent_is_rounded_and_capped() {
        assert_eq!(progress_percent(1, 3), 33.3);
        assert_eq!(progress_percent(5, 0), 100.0);
        assert_eq!(progress_percent(0, 0), 0.0);
        assert_eq!(progress_percent(150, 100), 100.0);
    }

    #[tokio::test]
    async fn recent_batches_filters_by_dimension() {
        let (_tmp, pool) = test_pool().await;
        for i in 0..3 {
            BatchTracker::create(&pool, &format!("d{}.csv", i), day(), Dimension::Daily, 1)
                .await
                .unwrap();
        }
        BatchTracker::create(&pool, "w.csv", day(), Dimension::Weekly, 1)
            .await
            .unwrap();

        let all = recent_batches(&pool, None, 5).await.unwrap();
        assert_eq!(all.len(), 4);
        assert_eq!(all[0].batch_name, "w.csv");

        let daily = recent_batches(&pool, Some(Dimension::Daily), 2).await.unwrap();
        assert_eq!(daily.len(), 2);
        assert_eq!(daily[0].batch_name, "d2.csv");

        let weekly = recent_batches(&pool, Some(Dimension::Weekly), 5).await.unwrap();
        assert_eq!(weekly.len(), 1);
    }
}
