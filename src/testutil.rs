//! Shared fixtures for unit tests.

use sqlx::SqlitePool;
use std::path::Path;
use tempfile::TempDir;

use crate::config::Config;
use crate::db;
use crate::migrate;
use crate::models::{ProductSlot, SearchRow};

pub fn test_config(dir: &Path) -> Config {
    let mut config = Config::with_db(&dir.join("test.sqlite"));
    config.ingest.work_dir = dir.join("shards");
    config.ingest.progress_interval_secs = 1;
    config
}

/// Migrated database in a fresh temp dir. Keep the `TempDir` alive for the
/// duration of the test.
pub async fn test_pool() -> (TempDir, SqlitePool) {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    let pool = db::connect(&config).await.unwrap();
    migrate::apply(&pool).await.unwrap();
    (tmp, pool)
}

pub fn row(keyword: &str, rank: i64) -> SearchRow {
    SearchRow {
        rank,
        keyword: keyword.to_string(),
        products: [
            ProductSlot::default(),
            ProductSlot::default(),
            ProductSlot::default(),
        ],
        report_date: String::new(),
    }
}

pub const PREAMBLE: &str = "报告范围=[\"每日\"],选择日期=[\"2024-01-01\"]\n\
搜索频率排名,搜索词,品牌 #1,品牌 #2,品牌 #3\n";

/// Write a minimal valid export with the given `(keyword, rank)` rows.
pub fn write_export(path: &Path, rows: &[(&str, i64)]) {
    let mut content = PREAMBLE.to_string();
    for (keyword, rank) in rows {
        content.push_str(&format!("{},{},BrandA,BrandB,BrandC\n", rank, keyword));
    }
    std::fs::write(path, content).unwrap();
}
