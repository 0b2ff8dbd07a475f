use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create all tables and indexes. Idempotent.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // Keyword-keyed aggregate. Report dates are NULL until that dimension
    // has been observed at least once.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS search_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            keyword TEXT NOT NULL UNIQUE,

            current_rank_day INTEGER NOT NULL DEFAULT 0,
            previous_rank_day INTEGER NOT NULL DEFAULT 0,
            rank_change_day INTEGER NOT NULL DEFAULT 0,
            is_new_day INTEGER NOT NULL DEFAULT 0,
            report_date_day TEXT,
            trend_day TEXT NOT NULL DEFAULT '[]',

            current_rank_week INTEGER NOT NULL DEFAULT 0,
            previous_rank_week INTEGER NOT NULL DEFAULT 0,
            rank_change_week INTEGER NOT NULL DEFAULT 0,
            is_new_week INTEGER NOT NULL DEFAULT 0,
            report_date_week TEXT,

            top_brand TEXT NOT NULL DEFAULT '',
            top_category TEXT NOT NULL DEFAULT '',
            top_product_asin TEXT NOT NULL DEFAULT '',
            top_product_title TEXT NOT NULL DEFAULT '',
            top_product_click_share REAL NOT NULL DEFAULT 0,
            top_product_conversion_share REAL NOT NULL DEFAULT 0,

            brand_2nd TEXT NOT NULL DEFAULT '',
            category_2nd TEXT NOT NULL DEFAULT '',
            product_asin_2nd TEXT NOT NULL DEFAULT '',
            product_title_2nd TEXT NOT NULL DEFAULT '',
            product_click_share_2nd REAL NOT NULL DEFAULT 0,
            product_conversion_share_2nd REAL NOT NULL DEFAULT 0,

            brand_3rd TEXT NOT NULL DEFAULT '',
            category_3rd TEXT NOT NULL DEFAULT '',
            product_asin_3rd TEXT NOT NULL DEFAULT '',
            product_title_3rd TEXT NOT NULL DEFAULT '',
            product_click_share_3rd REAL NOT NULL DEFAULT 0,
            product_conversion_share_3rd REAL NOT NULL DEFAULT 0,

            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS import_batches (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            batch_name TEXT NOT NULL DEFAULT '',
            import_date TEXT NOT NULL,
            total_records INTEGER NOT NULL DEFAULT 0,
            processed_count INTEGER NOT NULL DEFAULT 0,
            elapsed_seconds INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL CHECK (status IN ('PROCESSING', 'COMPLETED', 'FAILED')),
            is_day_data INTEGER NOT NULL DEFAULT 0,
            is_week_data INTEGER NOT NULL DEFAULT 0,
            error_message TEXT NOT NULL DEFAULT '',
            created_at INTEGER NOT NULL,
            completed_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS upload_sessions (
            session_key TEXT PRIMARY KEY,
            filename TEXT NOT NULL,
            data_type TEXT NOT NULL,
            temp_dir TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            expires_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_search_records_report_dates ON search_records(report_date_day, report_date_week)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_import_batches_created_at ON import_batches(created_at DESC)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_import_batches_import_date ON import_batches(import_date)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_upload_sessions_expires_at ON upload_sessions(expires_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
