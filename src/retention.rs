//! Data retention for keyword records.

use anyhow::Result;
use chrono::{Duration, NaiveDate, Utc};
use sqlx::SqlitePool;
use tracing::info;

use crate::config::Config;
use crate::db;

/// Delete records whose daily and weekly report dates are both before
/// `cutoff`. A dimension that was never observed counts as old. Returns the
/// number of deleted rows.
pub async fn prune_before(pool: &SqlitePool, cutoff: NaiveDate) -> Result<u64> {
    let cutoff = cutoff.format("%Y-%m-%d").to_string();
    let result = sqlx::query(
        r#"
        DELETE FROM search_records
        WHERE (report_date_day IS NULL OR report_date_day < ?)
          AND (report_date_week IS NULL OR report_date_week < ?)
        "#,
    )
    .bind(&cutoff)
    .bind(&cutoff)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// CLI entry point for `sri prune --days N`.
pub async fn run_prune(config: &Config, keep_days: i64) -> Result<()> {
    let cutoff = Utc::now().date_naive() - Duration::days(keep_days);
    let pool = db::connect(config).await?;
    let deleted = prune_before(&pool, cutoff).await?;
    pool.close().await;

    info!(deleted, %cutoff, "Pruned old records");
    println!("prune");
    println!("  cutoff:   {}", cutoff);
    println!("  deleted:  {}", deleted);
    println!("ok");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Dimension;
    use crate::testutil::{row, test_pool};
    use crate::upsert::{fetch_record, upsert_batch};

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[tokio::test]
    async fn keeps_records_with_any_recent_dimension() {
        let (_tmp, pool) = test_pool().await;
        upsert_batch(&pool, Dimension::Daily, &[row("old", 1), row("mixed", 2)], d("2024-01-01"))
            .await
            .unwrap();
        upsert_batch(&pool, Dimension::Weekly, &[row("mixed", 2)], d("2024-03-01"))
            .await
            .unwrap();
        upsert_batch(&pool, Dimension::Daily, &[row("fresh", 3)], d("2024-03-02"))
            .await
            .unwrap();

        let deleted = prune_before(&pool, d("2024-02-01")).await.unwrap();
        assert_eq!(deleted, 1);
        assert!(fetch_record(&pool, "old").await.unwrap().is_none());
        assert!(fetch_record(&pool, "mixed").await.unwrap().is_some());
        assert!(fetch_record(&pool, "fresh").await.unwrap().is_some());
    }
}
