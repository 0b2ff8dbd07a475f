//! Keyword record retrieval.
//!
//! Fetches the merged record for one keyword, with both ranking dimensions,
//! the daily trend and the product snapshot. Used by `sri get`.

use anyhow::{bail, Result};

use crate::config::Config;
use crate::db;
use crate::models::{Dimension, RankState, SearchRecord};
use crate::upsert::fetch_record;

/// Core lookup returning structured data.
pub async fn get_record(config: &Config, keyword: &str) -> Result<SearchRecord> {
    let pool = db::connect(config).await?;
    let record = fetch_record(&pool, keyword).await;
    pool.close().await;

    match record? {
        Some(r) => Ok(r),
        None => bail!("keyword not found: {}", keyword),
    }
}

fn print_rank(label: &str, state: &RankState) {
    match &state.report_date {
        Some(date) => println!(
            "{:<8} rank {:>7}  prev {:>7}  change {:>+6}  {}  ({})",
            label,
            state.current_rank,
            state.previous_rank,
            state.rank_change,
            if state.is_new { "NEW" } else { "   " },
            date
        ),
        None => println!("{:<8} (not observed)", label),
    }
}

/// CLI entry point: print one record to stdout.
pub async fn run_get(config: &Config, keyword: &str, json: bool) -> Result<()> {
    let record = get_record(config, keyword).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&record)?);
        return Ok(());
    }

    println!("--- Keyword ---");
    println!("keyword:      {}", record.keyword);
    println!("created_at:   {}", format_ts_iso(record.created_at));
    println!("updated_at:   {}", format_ts_iso(record.updated_at));
    println!();

    println!("--- Ranks ---");
    for dimension in [Dimension::Daily, Dimension::Weekly] {
        print_rank(dimension.as_str(), record.dimension(dimension));
    }
    println!();

    println!("--- Trend ({}) ---", record.trend_day.len());
    for point in &record.trend_day {
        println!("{}  {}", point.date, point.rank);
    }
    println!();

    println!("--- Top products ---");
    for (i, p) in record.products.iter().enumerate() {
        if p.asin.is_empty() && p.brand.is_empty() {
            continue;
        }
        println!(
            "#{} {} | {} | {} | {} (click {:.2}%, conversion {:.2}%)",
            i + 1,
            p.asin,
            p.brand,
            p.category,
            p.title,
            p.click_share,
            p.conversion_share
        );
    }

    Ok(())
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate;
    use crate::testutil::{row, test_config};
    use crate::upsert::upsert_batch;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    #[tokio::test]
    async fn finds_and_misses() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(tmp.path());
        migrate::run_migrations(&config).await.unwrap();

        let pool = db::connect(&config).await.unwrap();
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        upsert_batch(&pool, Dimension::Daily, &[row("lamp", 8)], date)
            .await
            .unwrap();
        pool.close().await;

        let record = get_record(&config, "lamp").await.unwrap();
        assert_eq!(record.day.current_rank, 8);

        let err = get_record(&config, "missing").await.unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn iso_timestamps() {
        assert_eq!(format_ts_iso(0), "1970-01-01T00:00:00Z");
    }
}
