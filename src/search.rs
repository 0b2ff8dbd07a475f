//! Filtered, paginated record search for `sri search`.
//!
//! Every filter is optional and they combine with `AND`. Text filters are
//! case-insensitive substring matches against the keyword and the top
//! product's brand, category, ASIN and title. A report date matches either
//! the daily or the weekly date. The conversion rate is the top product's
//! conversion share over its click share, as a percentage; filtering on it
//! only considers records with a positive click share.
//!
//! Values are always bound. Only the sort column is spliced into the SQL,
//! and it comes from the [`OrderBy`] allowlist.

use anyhow::{bail, Result};
use chrono::NaiveDate;
use serde::Serialize;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use std::fmt;
use std::str::FromStr;

use crate::config::Config;
use crate::db;
use crate::models::{RankState, SearchRecord};
use crate::upsert::record_from_row;

pub const DEFAULT_LIMIT: i64 = 50;
pub const MAX_LIMIT: i64 = 200;

const CONVERSION_RATE_SQL: &str =
    "(top_product_conversion_share / top_product_click_share * 100)";

#[derive(Debug, Clone, Default, clap::Args)]
pub struct SearchFilter {
    /// Keyword contains this text.
    #[arg(long)]
    pub keyword: Option<String>,
    /// Top brand contains this text.
    #[arg(long)]
    pub brand: Option<String>,
    /// Top category contains this text.
    #[arg(long)]
    pub category: Option<String>,
    /// Top product ASIN contains this text.
    #[arg(long)]
    pub asin: Option<String>,
    /// Top product title contains this text.
    #[arg(long)]
    pub title: Option<String>,
    /// Daily or weekly report date (YYYY-MM-DD).
    #[arg(long)]
    pub report_date: Option<NaiveDate>,

    #[arg(long)]
    pub daily_rank_min: Option<i64>,
    #[arg(long)]
    pub daily_rank_max: Option<i64>,
    #[arg(long)]
    pub weekly_rank_min: Option<i64>,
    #[arg(long)]
    pub weekly_rank_max: Option<i64>,

    #[arg(long, allow_negative_numbers = true)]
    pub daily_change_min: Option<i64>,
    #[arg(long, allow_negative_numbers = true)]
    pub daily_change_max: Option<i64>,
    #[arg(long, allow_negative_numbers = true)]
    pub weekly_change_min: Option<i64>,
    #[arg(long, allow_negative_numbers = true)]
    pub weekly_change_max: Option<i64>,

    #[arg(long)]
    pub click_share_min: Option<f64>,
    #[arg(long)]
    pub click_share_max: Option<f64>,
    #[arg(long)]
    pub conversion_share_min: Option<f64>,
    #[arg(long)]
    pub conversion_share_max: Option<f64>,
    /// Minimum conversion rate in percent.
    #[arg(long)]
    pub conversion_rate_min: Option<f64>,
    /// Maximum conversion rate in percent.
    #[arg(long)]
    pub conversion_rate_max: Option<f64>,

    /// `true` or `false`.
    #[arg(long)]
    pub new_day: Option<bool>,
    /// `true` or `false`.
    #[arg(long)]
    pub new_week: Option<bool>,
}

/// Sortable columns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OrderBy {
    #[default]
    Keyword,
    DailyRank,
    WeeklyRank,
    DailyChange,
    WeeklyChange,
    ClickShare,
    ConversionShare,
    UpdatedAt,
}

impl OrderBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderBy::Keyword => "keyword",
            OrderBy::DailyRank => "daily_rank",
            OrderBy::WeeklyRank => "weekly_rank",
            OrderBy::DailyChange => "daily_change",
            OrderBy::WeeklyChange => "weekly_change",
            OrderBy::ClickShare => "click_share",
            OrderBy::ConversionShare => "conversion_share",
            OrderBy::UpdatedAt => "updated_at",
        }
    }

    fn column(&self) -> &'static str {
        match self {
            OrderBy::Keyword => "keyword",
            OrderBy::DailyRank => "current_rank_day",
            OrderBy::WeeklyRank => "current_rank_week",
            OrderBy::DailyChange => "rank_change_day",
            OrderBy::WeeklyChange => "rank_change_week",
            OrderBy::ClickShare => "top_product_click_share",
            OrderBy::ConversionShare => "top_product_conversion_share",
            OrderBy::UpdatedAt => "updated_at",
        }
    }
}

impl fmt::Display for OrderBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for OrderBy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "keyword" => Ok(OrderBy::Keyword),
            "daily_rank" => Ok(OrderBy::DailyRank),
            "weekly_rank" => Ok(OrderBy::WeeklyRank),
            "daily_change" => Ok(OrderBy::DailyChange),
            "weekly_change" => Ok(OrderBy::WeeklyChange),
            "click_share" => Ok(OrderBy::ClickShare),
            "conversion_share" => Ok(OrderBy::ConversionShare),
            "updated_at" => Ok(OrderBy::UpdatedAt),
            other => bail!(
                "Unknown sort column: '{}'. Use keyword, daily_rank, weekly_rank, daily_change, \
                 weekly_change, click_share, conversion_share, or updated_at.",
                other
            ),
        }
    }
}

#[derive(Debug, Clone, clap::Args)]
pub struct PageRequest {
    /// Sort column.
    #[arg(long, default_value_t = OrderBy::Keyword)]
    pub order_by: OrderBy,
    /// Sort descending.
    #[arg(long)]
    pub desc: bool,
    /// Records per page (1-200).
    #[arg(long, default_value_t = DEFAULT_LIMIT,
          value_parser = clap::value_parser!(i64).range(1..=MAX_LIMIT))]
    pub limit: i64,
    /// Records to skip.
    #[arg(long, default_value_t = 0,
          value_parser = clap::value_parser!(i64).range(0..))]
    pub offset: i64,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            order_by: OrderBy::default(),
            desc: false,
            limit: DEFAULT_LIMIT,
            offset: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    #[serde(flatten)]
    pub record: SearchRecord,
    /// Top product conversion rate in percent; `None` without clicks.
    pub conversion_rate: Option<f64>,
}

impl From<SearchRecord> for SearchHit {
    fn from(record: SearchRecord) -> Self {
        let top = &record.products[0];
        let conversion_rate = (top.click_share > 0.0)
            .then(|| top.conversion_share / top.click_share * 100.0);
        Self {
            record,
            conversion_rate,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchPage {
    /// Matching records before pagination.
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
    pub hits: Vec<SearchHit>,
}

/// Appends `WHERE` before the first condition and `AND` before the rest.
struct Conditions<'q> {
    qb: QueryBuilder<'q, Sqlite>,
    empty: bool,
}

impl<'q> Conditions<'q> {
    fn new(sql: &str) -> Self {
        Self {
            qb: QueryBuilder::new(sql),
            empty: true,
        }
    }

    fn next(&mut self) -> &mut QueryBuilder<'q, Sqlite> {
        self.qb.push(if self.empty { " WHERE " } else { " AND " });
        self.empty = false;
        &mut self.qb
    }

    fn contains(&mut self, column: &str, term: Option<&str>) {
        let Some(term) = term.map(str::trim).filter(|t| !t.is_empty()) else {
            return;
        };
        self.next()
            .push(column)
            .push(" LIKE ")
            .push_bind(like_pattern(term))
            .push(" ESCAPE '\\'");
    }

    fn range<T>(&mut self, expr: &str, min: Option<T>, max: Option<T>)
    where
        T: 'q + Send + sqlx::Encode<'q, Sqlite> + sqlx::Type<Sqlite>,
    {
        if let Some(min) = min {
            self.next().push(expr).push(" >= ").push_bind(min);
        }
        if let Some(max) = max {
            self.next().push(expr).push(" <= ").push_bind(max);
        }
    }

    fn equals(&mut self, column: &str, value: Option<bool>) {
        if let Some(value) = value {
            self.next().push(column).push(" = ").push_bind(value);
        }
    }
}

/// `%term%` with LIKE wildcards in `term` escaped.
fn like_pattern(term: &str) -> String {
    let mut pattern = String::with_capacity(term.len() + 2);
    pattern.push('%');
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

fn filtered<'q>(select: &str, filter: &SearchFilter) -> QueryBuilder<'q, Sqlite> {
    let mut w = Conditions::new(select);

    w.contains("keyword", filter.keyword.as_deref());
    w.contains("top_brand", filter.brand.as_deref());
    w.contains("top_category", filter.category.as_deref());
    w.contains("top_product_asin", filter.asin.as_deref());
    w.contains("top_product_title", filter.title.as_deref());

    if let Some(date) = filter.report_date {
        let date = date.format("%Y-%m-%d").to_string();
        w.next()
            .push("(report_date_day = ")
            .push_bind(date.clone())
            .push(" OR report_date_week = ")
            .push_bind(date)
            .push(")");
    }

    w.range("current_rank_day", filter.daily_rank_min, filter.daily_rank_max);
    w.range("current_rank_week", filter.weekly_rank_min, filter.weekly_rank_max);
    w.range("rank_change_day", filter.daily_change_min, filter.daily_change_max);
    w.range("rank_change_week", filter.weekly_change_min, filter.weekly_change_max);

    w.range("top_product_click_share", filter.click_share_min, filter.click_share_max);
    w.range(
        "top_product_conversion_share",
        filter.conversion_share_min,
        filter.conversion_share_max,
    );
    if filter.conversion_rate_min.is_some() || filter.conversion_rate_max.is_some() {
        w.next().push("top_product_click_share > 0");
        w.range(
            CONVERSION_RATE_SQL,
            filter.conversion_rate_min,
            filter.conversion_rate_max,
        );
    }

    w.equals("is_new_day", filter.new_day);
    w.equals("is_new_week", filter.new_week);

    w.qb
}

/// Core search returning one page of matching records and the total count.
pub async fn search_records(
    pool: &SqlitePool,
    filter: &SearchFilter,
    page: &PageRequest,
) -> Result<SearchPage> {
    if !(1..=MAX_LIMIT).contains(&page.limit) {
        bail!("limit must be between 1 and {}, got {}", MAX_LIMIT, page.limit);
    }
    if page.offset < 0 {
        bail!("offset must not be negative, got {}", page.offset);
    }

    let total = filtered("SELECT COUNT(*) FROM search_records", filter)
        .build_query_scalar::<i64>()
        .fetch_one(pool)
        .await?;

    let mut qb = filtered("SELECT * FROM search_records", filter);
    qb.push(" ORDER BY ")
        .push(page.order_by.column())
        .push(if page.desc { " DESC" } else { " ASC" })
        .push(", keyword ASC LIMIT ")
        .push_bind(page.limit)
        .push(" OFFSET ")
        .push_bind(page.offset);

    let rows = qb.build().fetch_all(pool).await?;
    let hits = rows
        .iter()
        .map(|row| record_from_row(row).map(SearchHit::from))
        .collect::<Result<Vec<_>>>()?;

    Ok(SearchPage {
        total,
        limit: page.limit,
        offset: page.offset,
        hits,
    })
}

fn format_rank(state: &RankState) -> String {
    match &state.report_date {
        Some(date) => format!(
            "rank {} (change {:+}){}  {}",
            state.current_rank,
            state.rank_change,
            if state.is_new { " NEW" } else { "" },
            date
        ),
        None => "(not observed)".to_string(),
    }
}

/// CLI entry point: print one page of matches to stdout.
pub async fn run_search(
    config: &Config,
    filter: &SearchFilter,
    page: &PageRequest,
    json: bool,
) -> Result<()> {
    let pool = db::connect(config).await?;
    let result = search_records(&pool, filter, page).await;
    pool.close().await;
    let result = result?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    if result.hits.is_empty() {
        println!("No results. ({} total)", result.total);
        return Ok(());
    }

    println!(
        "Showing {}-{} of {} (order: {} {})",
        result.offset + 1,
        result.offset + result.hits.len() as i64,
        result.total,
        page.order_by,
        if page.desc { "desc" } else { "asc" }
    );
    println!();

    for (i, hit) in result.hits.iter().enumerate() {
        let record = &hit.record;
        let top = &record.products[0];
        println!("{}. {}", result.offset + i as i64 + 1, record.keyword);
        println!("    daily:  {}", format_rank(&record.day));
        println!("    weekly: {}", format_rank(&record.week));
        if !top.asin.is_empty() || !top.brand.is_empty() {
            println!(
                "    top:    {} | {} | {} | {}",
                top.asin, top.brand, top.category, top.title
            );
            let rate = hit
                .conversion_rate
                .map(|r| format!("{:.2}%", r))
                .unwrap_or_else(|| "-".to_string());
            println!(
                "    shares: click {:.2}%  conversion {:.2}%  rate {}",
                top.click_share, top.conversion_share, rate
            );
        }
        println!();
    }

    Ok(())
}
