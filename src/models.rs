//! Core data models for the ranking ingest pipeline.
//!
//! These types represent the cleaned CSV rows, the keyword-keyed records
//! they are merged into, and the audit row tracking each ingest run.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::IngestError;

/// One of the two independent ranking time series tracked per keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dimension {
    Daily,
    Weekly,
}

impl Dimension {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::Daily => "daily",
            Dimension::Weekly => "weekly",
        }
    }

    /// Column suffix used by the `search_records` table.
    pub fn column_suffix(&self) -> &'static str {
        match self {
            Dimension::Daily => "day",
            Dimension::Weekly => "week",
        }
    }

    /// Only the daily series keeps a rolling trend.
    pub fn tracks_trend(&self) -> bool {
        matches!(self, Dimension::Daily)
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Dimension {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "daily" | "day" => Ok(Dimension::Daily),
            "weekly" | "week" => Ok(Dimension::Weekly),
            other => Err(IngestError::UnknownDimension(other.to_string())),
        }
    }
}

/// Brand/category/product columns for one of the top three ranked products.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductSlot {
    pub brand: String,
    pub category: String,
    pub asin: String,
    pub title: String,
    pub click_share: f64,
    pub conversion_share: f64,
}

/// A cleaned data row produced by the chunk reader.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchRow {
    pub rank: i64,
    pub keyword: String,
    pub products: [ProductSlot; 3],
    /// Date column as printed in the export. The merge uses the date
    /// taken from the filename; rows that disagree with it are counted and
    /// reported once per run.
    pub report_date: String,
}

/// One `{date, rank}` point of the daily trend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrendPoint {
    pub date: String,
    pub rank: i64,
}

/// Per-dimension state of a record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankState {
    pub current_rank: i64,
    pub previous_rank: i64,
    pub rank_change: i64,
    pub is_new: bool,
    /// `None` until the dimension has been observed.
    pub report_date: Option<String>,
}

/// Merged keyword record as stored in `search_records`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchRecord {
    pub keyword: String,
    pub day: RankState,
    pub trend_day: Vec<TrendPoint>,
    pub week: RankState,
    pub products: [ProductSlot; 3],
    pub created_at: i64,
    pub updated_at: i64,
}

impl SearchRecord {
    pub fn dimension(&self, dimension: Dimension) -> &RankState {
        match dimension {
            Dimension::Daily => &self.day,
            Dimension::Weekly => &self.week,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Processing,
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Processing => "PROCESSING",
            BatchStatus::Completed => "COMPLETED",
            BatchStatus::Failed => "FAILED",
        }
    }
}

impl FromStr for BatchStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PROCESSING" => Ok(BatchStatus::Processing),
            "COMPLETED" => Ok(BatchStatus::Completed),
            "FAILED" => Ok(BatchStatus::Failed),
            other => anyhow::bail!("Unknown batch status: '{}'", other),
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Audit row for one ingest run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImportBatch {
    pub id: i64,
    pub batch_name: String,
    pub import_date: NaiveDate,
    pub total_records: i64,
    pub processed_count: i64,
    pub elapsed_seconds: i64,
    pub status: BatchStatus,
    pub is_day_data: bool,
    pub is_week_data: bool,
    pub error_message: String,
    pub created_at: i64,
    pub completed_at: Option<i64>,
}
