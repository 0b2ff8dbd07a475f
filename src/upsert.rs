//! Keyword-keyed merge of cleaned rows into `search_records`.
//!
//! Each row is applied with a single `INSERT ... ON CONFLICT(keyword) DO
//! UPDATE` statement, so concurrent worker processes never need a
//! read-modify-write cycle: SQLite evaluates the whole merge against the
//! stored row atomically. The statement is generated from one template per
//! [`Dimension`] and touches only that dimension's columns plus the shared
//! product snapshot.
//!
//! Merge rules for a dimension, given an incoming `(rank, date)`:
//!
//! - stored date is NULL (new keyword, or dimension never observed):
//!   `previous = 0`, `change = 0`, `is_new = true`, trend `[{date, rank}]`
//! - stored date equals `date`: only `current` is refreshed
//! - stored date differs: `previous = old current`, `change = rank - old
//!   current`, `is_new = false`; the daily trend drops any entry for `date`,
//!   prepends the new point and keeps the seven newest dates

use anyhow::{Context, Result};
use chrono::NaiveDate;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::sync::OnceLock;

use crate::models::{Dimension, ProductSlot, RankState, SearchRecord, SearchRow, TrendPoint};

/// Number of points kept in the daily trend.
pub const TREND_WINDOW: usize = 7;

/// Product snapshot columns, in bind order, per slot.
const PRODUCT_COLUMNS: [[&str; 6]; 3] = [
    [
        "top_brand",
        "top_category",
        "top_product_asin",
        "top_product_title",
        "top_product_click_share",
        "top_product_conversion_share",
    ],
    [
        "brand_2nd",
        "category_2nd",
        "product_asin_2nd",
        "product_title_2nd",
        "product_click_share_2nd",
        "product_conversion_share_2nd",
    ],
    [
        "brand_3rd",
        "category_3rd",
        "product_asin_3rd",
        "product_title_3rd",
        "product_click_share_3rd",
        "product_conversion_share_3rd",
    ],
];

// Bind layout: ?1 keyword, ?2 rank, ?3 report date, ?4..=?21 products, ?22 now.
const FIRST_PRODUCT_PARAM: usize = 4;
const NOW_PARAM: usize = FIRST_PRODUCT_PARAM + 18;

fn product_columns() -> impl Iterator<Item = &'static str> {
    PRODUCT_COLUMNS.iter().flat_map(|slot| slot.iter().copied())
}

fn build_sql(dimension: Dimension) -> String {
    let s = dimension.column_suffix();
    let stored_date = format!("search_records.report_date_{s}");
    let incoming_date = format!("excluded.report_date_{s}");

    let mut columns = vec![
        "keyword".to_string(),
        format!("current_rank_{s}"),
        format!("previous_rank_{s}"),
        format!("rank_change_{s}"),
        format!("is_new_{s}"),
        format!("report_date_{s}"),
    ];
    let mut values = vec![
        "?1".to_string(),
        "?2".to_string(),
        "0".to_string(),
        "0".to_string(),
        "1".to_string(),
        "?3".to_string(),
    ];
    if dimension.tracks_trend() {
        columns.push("trend_day".to_string());
        values.push("json_array(json_object('date', ?3, 'rank', ?2))".to_string());
    }
    for (i, col) in product_columns().enumerate() {
        columns.push(col.to_string());
        values.push(format!("?{}", FIRST_PRODUCT_PARAM + i));
    }
    columns.push("created_at".to_string());
    values.push(format!("?{NOW_PARAM}"));
    columns.push("updated_at".to_string());
    values.push(format!("?{NOW_PARAM}"));

    let mut sets = vec![
        format!(
            "previous_rank_{s} = CASE WHEN {stored_date} IS NULL THEN 0 \
             WHEN {stored_date} = {incoming_date} THEN search_records.previous_rank_{s} \
             ELSE search_records.current_rank_{s} END"
        ),
        format!(
            "rank_change_{s} = CASE WHEN {stored_date} IS NULL THEN 0 \
             WHEN {stored_date} = {incoming_date} THEN search_records.rank_change_{s} \
             ELSE excluded.current_rank_{s} - search_records.current_rank_{s} END"
        ),
        format!(
            "is_new_{s} = CASE WHEN {stored_date} IS NULL THEN 1 \
             WHEN {stored_date} = {incoming_date} THEN search_records.is_new_{s} \
             ELSE 0 END"
        ),
    ];
    if dimension.tracks_trend() {
        sets.push(format!(
            "trend_day = CASE WHEN {stored_date} = {incoming_date} THEN search_records.trend_day \
             ELSE (SELECT json_group_array(json(entry)) FROM ( \
                 SELECT entry FROM ( \
                     SELECT json_object('date', {incoming_date}, 'rank', excluded.current_rank_{s}) AS entry, \
                            {incoming_date} AS entry_date \
                     UNION ALL \
                     SELECT value, json_extract(value, '$.date') \
                     FROM json_each(search_records.trend_day) \
                     WHERE json_extract(value, '$.date') <> {incoming_date} \
                 ) ORDER BY entry_date DESC LIMIT {TREND_WINDOW} \
             )) END"
        ));
    }
    sets.push(format!("current_rank_{s} = excluded.current_rank_{s}"));
    sets.push(format!("report_date_{s} = {incoming_date}"));
    for col in product_columns() {
        sets.push(format!("{col} = excluded.{col}"));
    }
    sets.push("updated_at = excluded.updated_at".to_string());

    format!(
        "INSERT INTO search_records ({}) VALUES ({}) ON CONFLICT(keyword) DO UPDATE SET {}",
        columns.join(", "),
        values.join(", "),
        sets.join(", ")
    )
}

/// Upsert statement for a dimension, built on first use.
pub fn upsert_sql(dimension: Dimension) -> &'static str {
    static DAILY: OnceLock<String> = OnceLock::new();
    static WEEKLY: OnceLock<String> = OnceLock::new();
    let cell = match dimension {
        Dimension::Daily => &DAILY,
        Dimension::Weekly => &WEEKLY,
    };
    cell.get_or_init(|| build_sql(dimension))
}

/// Apply one row inside the caller's connection or transaction.
pub async fn upsert_row(
    conn: &mut SqliteConnection,
    dimension: Dimension,
    row: &SearchRow,
    report_date: &str,
    now: i64,
) -> Result<()> {
    let mut query = sqlx::query(upsert_sql(dimension))
        .bind(&row.keyword)
        .bind(row.rank)
        .bind(report_date);
    for product in &row.products {
        query = query
            .bind(&product.brand)
            .bind(&product.category)
            .bind(&product.asin)
            .bind(&product.title)
            .bind(product.click_share)
            .bind(product.conversion_share);
    }
    query.bind(now).execute(&mut *conn).await?;
    Ok(())
}

/// Apply a batch of rows in one transaction. Returns the number of rows
/// applied. Nothing is committed if any row fails.
pub async fn upsert_batch(
    pool: &SqlitePool,
    dimension: Dimension,
    rows: &[SearchRow],
    report_date: NaiveDate,
) -> Result<u64> {
    if rows.is_empty() {
        return Ok(0);
    }

    let date = report_date.format("%Y-%m-%d").to_string();
    let now = chrono::Utc::now().timestamp();

    let mut tx = pool.begin().await?;
    for row in rows {
        upsert_row(&mut tx, dimension, row, &date, now)
            .await
            .with_context(|| format!("Upsert failed for keyword '{}'", row.keyword))?;
    }
    tx.commit().await?;

    Ok(rows.len() as u64)
}

fn rank_state(row: &SqliteRow, suffix: &str) -> RankState {
    RankState {
        current_rank: row.get(format!("current_rank_{suffix}").as_str()),
        previous_rank: row.get(format!("previous_rank_{suffix}").as_str()),
        rank_change: row.get(format!("rank_change_{suffix}").as_str()),
        is_new: row.get(format!("is_new_{suffix}").as_str()),
        report_date: row.get(format!("report_date_{suffix}").as_str()),
    }
}

/// Load one merged record by keyword.
pub async fn fetch_record(pool: &SqlitePool, keyword: &str) -> Result<Option<SearchRecord>> {
    let row = sqlx::query("SELECT * FROM search_records WHERE keyword = ?")
        .bind(keyword)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(record_from_row).transpose()
}

/// Convert a `SELECT *` row of `search_records`.
pub(crate) fn record_from_row(row: &SqliteRow) -> Result<SearchRecord> {
    let keyword: String = row.get("keyword");
    let trend_json: String = row.get("trend_day");
    let trend_day: Vec<TrendPoint> = serde_json::from_str(&trend_json)
        .with_context(|| format!("Corrupt trend for keyword '{}'", keyword))?;

    let products = PRODUCT_COLUMNS.map(|cols| ProductSlot {
        brand: row.get(cols[0]),
        category: row.get(cols[1]),
        asin: row.get(cols[2]),
        title: row.get(cols[3]),
        click_share: row.get(cols[4]),
        conversion_share: row.get(cols[5]),
    });

    Ok(SearchRecord {
        keyword,
        day: rank_state(row, Dimension::Daily.column_suffix()),
        trend_day,
        week: rank_state(row, Dimension::Weekly.column_suffix()),
        products,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{row, test_pool};

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    async fn apply(pool: &SqlitePool, dim: Dimension, day: &str, rows: &[(&str, i64)]) {
        let rows: Vec<SearchRow> = rows.iter().map(|(k, r)| row(k, *r)).collect();
        upsert_batch(pool, dim, &rows, date(day)).await.unwrap();
    }

    async fn get(pool: &SqlitePool, keyword: &str) -> SearchRecord {
        fetch_record(pool, keyword).await.unwrap().unwrap()
    }

    #[test]
    fn statements_reference_only_their_dimension() {
        let daily = upsert_sql(Dimension::Daily);
        let weekly = upsert_sql(Dimension::Weekly);
        assert!(daily.contains("trend_day") && !daily.contains("_week"));
        assert!(!weekly.contains("trend_day") && !weekly.contains("_day "));
        assert!(std::ptr::eq(daily, upsert_sql(Dimension::Daily)));
    }

    #[tokio::test]
    async fn first_insert_marks_new() {
        let (_tmp, pool) = test_pool().await;
        apply(&pool, Dimension::Daily, "2024-01-01", &[("a", 1), ("b", 2), ("c", 3)]).await;

        for (kw, rank) in [("a", 1), ("b", 2), ("c", 3)] {
            let rec = get(&pool, kw).await;
            assert_eq!(rec.day.current_rank, rank);
            assert_eq!(rec.day.previous_rank, 0);
            assert_eq!(rec.day.rank_change, 0);
            assert!(rec.day.is_new);
            assert_eq!(rec.day.report_date.as_deref(), Some("2024-01-01"));
            assert_eq!(
                rec.trend_day,
                vec![TrendPoint { date: "2024-01-01".into(), rank }]
            );
            // weekly never observed
            assert_eq!(rec.week.report_date, None);
            assert_eq!(rec.week.current_rank, 0);
            assert!(!rec.week.is_new);
        }
    }

    #[tokio::test]
    async fn next_day_shifts_ranks() {
        let (_tmp, pool) = test_pool().await;
        apply(&pool, Dimension::Daily, "2024-01-01", &[("a", 1), ("b", 2), ("c", 3)]).await;
        apply(&pool, Dimension::Daily, "2024-01-02", &[("a", 2), ("b", 2), ("c", 4)]).await;

        let a = get(&pool, "a").await;
        assert_eq!((a.day.previous_rank, a.day.current_rank, a.day.rank_change), (1, 2, 1));
        assert!(!a.day.is_new);
        assert_eq!(a.trend_day.len(), 2);
        assert_eq!(a.trend_day[0].date, "2024-01-02");

        assert_eq!(get(&pool, "b").await.day.rank_change, 0);
        assert_eq!(get(&pool, "c").await.day.rank_change, 1);
    }

    #[tokio::test]
    async fn rank_improvement_is_negative_change() {
        let (_tmp, pool) = test_pool().await;
        apply(&pool, Dimension::Daily, "2024-01-01", &[("k", 5)]).await;
        apply(&pool, Dimension::Daily, "2024-01-02", &[("k", 3)]).await;

        let k = get(&pool, "k").await;
        assert_eq!(k.day.previous_rank, 5);
        assert_eq!(k.day.current_rank, 3);
        assert_eq!(k.day.rank_change, -2);
        assert!(!k.day.is_new);
    }

    #[tokio::test]
    async fn same_date_replay_is_idempotent() {
        let (_tmp, pool) = test_pool().await;
        apply(&pool, Dimension::Daily, "2024-01-01", &[("k", 5)]).await;
        apply(&pool, Dimension::Daily, "2024-01-02", &[("k", 3)]).await;
        let before = get(&pool, "k").await;

        apply(&pool, Dimension::Daily, "2024-01-02", &[("k", 3)]).await;
        let after = get(&pool, "k").await;

        assert_eq!(before.day, after.day);
        assert_eq!(before.trend_day, after.trend_day);
    }

    #[tokio::test]
    async fn same_date_updates_current_only() {
        let (_tmp, pool) = test_pool().await;
        apply(&pool, Dimension::Daily, "2024-01-01", &[("k", 5)]).await;
        apply(&pool, Dimension::Daily, "2024-01-02", &[("k", 3)]).await;
        apply(&pool, Dimension::Daily, "2024-01-02", &[("k", 9)]).await;

        let k = get(&pool, "k").await;
        assert_eq!(k.day.current_rank, 9);
        assert_eq!(k.day.previous_rank, 5);
        assert_eq!(k.day.rank_change, -2);
        assert_eq!(k.trend_day[0], TrendPoint { date: "2024-01-02".into(), rank: 3 });
    }

    #[tokio::test]
    async fn trend_keeps_seven_newest_dates() {
        let (_tmp, pool) = test_pool().await;
        for day in 1..=10 {
            let d = format!("2024-01-{:02}", day);
            apply(&pool, Dimension::Daily, &d, &[("k", day)]).await;
        }

        let trend = get(&pool, "k").await.trend_day;
        let dates: Vec<&str> = trend.iter().map(|p| p.date.as_str()).collect();
        assert_eq!(
            dates,
            vec![
                "2024-01-10", "2024-01-09", "2024-01-08", "2024-01-07", "2024-01-06",
                "2024-01-05", "2024-01-04"
            ]
        );
        assert_eq!(trend[0].rank, 10);
    }

    #[tokio::test]
    async fn out_of_order_dates_stay_sorted_and_unique() {
        let (_tmp, pool) = test_pool().await;
        apply(&pool, Dimension::Daily, "2024-01-03", &[("k", 3)]).await;
        apply(&pool, Dimension::Daily, "2024-01-01", &[("k", 1)]).await;
        apply(&pool, Dimension::Daily, "2024-01-03", &[("k", 7)]).await;

        let trend = get(&pool, "k").await.trend_day;
        assert_eq!(
            trend,
            vec![
                TrendPoint { date: "2024-01-03".into(), rank: 7 },
                TrendPoint { date: "2024-01-01".into(), rank: 1 },
            ]
        );
    }

    #[tokio::test]
    async fn dimensions_are_independent() {
        let (_tmp, pool) = test_pool().await;
        apply(&pool, Dimension::Daily, "2024-01-01", &[("k", 4)]).await;
        apply(&pool, Dimension::Weekly, "2024-01-07", &[("k", 40)]).await;

        let k = get(&pool, "k").await;
        assert_eq!(k.day.current_rank, 4);
        assert_eq!(k.day.report_date.as_deref(), Some("2024-01-01"));
        assert_eq!(k.trend_day.len(), 1);

        // first weekly observation of an existing keyword
        assert_eq!(k.week.current_rank, 40);
        assert_eq!(k.week.previous_rank, 0);
        assert_eq!(k.week.rank_change, 0);
        assert!(k.week.is_new);
        assert_eq!(k.week.report_date.as_deref(), Some("2024-01-07"));

        apply(&pool, Dimension::Weekly, "2024-01-14", &[("k", 30)]).await;
        let k = get(&pool, "k").await;
        assert_eq!(k.week.rank_change, -10);
        assert_eq!(k.day.current_rank, 4);
    }

    #[tokio::test]
    async fn weekly_insert_leaves_daily_unobserved() {
        let (_tmp, pool) = test_pool().await;
        apply(&pool, Dimension::Weekly, "2024-01-07", &[("w", 12)]).await;
        let w = get(&pool, "w").await;
        assert_eq!(w.day.report_date, None);
        assert!(w.trend_day.is_empty());
        assert!(w.week.is_new);

        apply(&pool, Dimension::Daily, "2024-01-08", &[("w", 6)]).await;
        let w = get(&pool, "w").await;
        assert!(w.day.is_new);
        assert_eq!(w.day.previous_rank, 0);
        assert_eq!(w.trend_day.len(), 1);
    }

    #[tokio::test]
    async fn product_snapshot_always_refreshed() {
        let (_tmp, pool) = test_pool().await;
        let mut first = row("k", 1);
        first.products[0].brand = "Old".into();
        upsert_batch(&pool, Dimension::Daily, &[first], date("2024-01-01")).await.unwrap();

        let mut second = row("k", 1);
        second.products[0].brand = "New".into();
        second.products[2].click_share = 4.5;
        upsert_batch(&pool, Dimension::Weekly, &[second], date("2024-01-07")).await.unwrap();

        let k = get(&pool, "k").await;
        assert_eq!(k.products[0].brand, "New");
        assert_eq!(k.products[2].click_share, 4.5);
    }

    #[tokio::test]
    async fn empty_batch_is_noop() {
        let (_tmp, pool) = test_pool().await;
        let n = upsert_batch(&pool, Dimension::Daily, &[], date("2024-01-01")).await.unwrap();
        assert_eq!(n, 0);
        assert!(fetch_record(&pool, "k").await.unwrap().is_none());
    }
}
