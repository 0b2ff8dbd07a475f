//! Ingest orchestration.
//!
//! [`process_file`] is the single entry point: validate the export, pull
//! the report date out of the original filename, open a batch, then pick a
//! strategy by file size:
//!
//! - below `multiprocess_threshold_mb`: stream the file in-process through
//!   the reader and the upsert engine
//! - at or above it: split into line-aligned shards and hand them to the
//!   worker pool, one OS process per shard
//!
//! Pre-flight rejections never touch the database. Once a batch exists it
//! is always finalized, and shard files never outlive the run.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::Serialize;
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::batch::{get_batch, BatchTracker};
use crate::config::Config;
use crate::db;
use crate::error::IngestError;
use crate::migrate;
use crate::models::{Dimension, ImportBatch};
use crate::progress::{
    IngestProgressEvent, MonitorTarget, NoProgress, ProgressCounter, ProgressMode,
    ProgressMonitor, ProgressReporter,
};
use crate::reader::estimate_records;
use crate::splitter::{remove_shard_dir, split_by_count, split_by_lines, ShardFile};
use crate::validate::{extract_report_date, read_banner_metadata, validate_structure};
use crate::worker::{process_shard, run_pool};

/// Result of one `process_file` call.
#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    pub success: bool,
    pub message: String,
    /// Final batch row; `None` when the file was rejected before a batch
    /// was created.
    pub batch: Option<ImportBatch>,
}

impl IngestOutcome {
    fn rejected(err: IngestError) -> Self {
        debug_assert!(err.is_preflight());
        Self {
            success: false,
            message: err.to_string(),
            batch: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    SingleProcess,
    Sharded,
}

/// Files at or above the threshold go to the worker pool.
pub fn choose_strategy(file_size: u64, config: &Config) -> Strategy {
    if file_size >= config.ingest.multiprocess_threshold_bytes() {
        Strategy::Sharded
    } else {
        Strategy::SingleProcess
    }
}

/// How a run ended, before the batch is finalized.
struct RunSummary {
    processed: u64,
    failure: Option<String>,
}

/// Ingest `path`, whose original upload name is `original_filename`.
pub async fn process_file(
    config: &Config,
    path: &Path,
    original_filename: &str,
    dimension: Dimension,
) -> Result<IngestOutcome> {
    process_file_with(config, path, original_filename, dimension, Arc::new(NoProgress)).await
}

/// [`process_file`] with a progress reporter for CLI output.
pub async fn process_file_with(
    config: &Config,
    path: &Path,
    original_filename: &str,
    dimension: Dimension,
    reporter: Arc<dyn ProgressReporter>,
) -> Result<IngestOutcome> {
    let validation = validate_structure(path, config.ingest.min_fields);
    if !validation.ok {
        warn!(file = original_filename, reason = %validation.message, "Rejected file");
        return Ok(IngestOutcome::rejected(IngestError::InvalidStructure(
            validation.message,
        )));
    }

    let Some(report_date) = extract_report_date(original_filename) else {
        warn!(file = original_filename, "No report date in filename");
        return Ok(IngestOutcome::rejected(IngestError::MissingReportDate(
            original_filename.to_string(),
        )));
    };

    if let Ok(banner) = read_banner_metadata(path) {
        info!(
            file = original_filename,
            range = banner.report_range.as_deref().unwrap_or("-"),
            selected = banner.selected_date.as_deref().unwrap_or("-"),
            "Export metadata"
        );
    }

    let file_size = std::fs::metadata(path)
        .with_context(|| format!("Failed to stat {}", path.display()))?
        .len();
    let estimate = estimate_records(path)?;
    let strategy = choose_strategy(file_size, config);

    let pool = db::connect(config).await?;
    migrate::apply(&pool).await?;

    let tracker =
        BatchTracker::create(&pool, original_filename, report_date, dimension, estimate).await?;
    info!(
        batch = tracker.id(),
        file = original_filename,
        %dimension,
        %report_date,
        bytes = file_size,
        estimate,
        ?strategy,
        "Starting ingest"
    );

    let counter = ProgressCounter::new();
    let monitor = ProgressMonitor::spawn(
        config,
        MonitorTarget {
            batch_id: tracker.id(),
            batch_name: original_filename.to_string(),
            total: estimate,
            started: Instant::now(),
            counter: counter.clone(),
        },
        reporter.clone(),
    );

    let run = match strategy {
        Strategy::SingleProcess => {
            run_single(&pool, config, path, dimension, report_date, &counter).await
        }
        Strategy::Sharded => {
            run_sharded(
                config,
                path,
                tracker.id(),
                dimension,
                report_date,
                &counter,
                reporter.as_ref(),
                original_filename,
            )
            .await
        }
    };

    monitor.stop().await;

    let (success, message) = match run {
        Ok(RunSummary {
            processed,
            failure: None,
        }) => {
            tracker.complete(&pool, processed, processed).await?;
            info!(batch = tracker.id(), processed, "Ingest completed");
            (
                true,
                format!("Imported {} records from {}", processed, original_filename),
            )
        }
        Ok(RunSummary {
            processed,
            failure: Some(message),
        }) => {
            tracker.fail(&pool, processed, &message).await?;
            error!(batch = tracker.id(), processed, error = %message, "Ingest failed");
            (false, message)
        }
        Err(e) => {
            let message = format!("{:#}", e);
            tracker.fail(&pool, counter.get(), &message).await?;
            error!(batch = tracker.id(), error = %message, "Ingest failed");
            (false, message)
        }
    };

    let batch = get_batch(&pool, tracker.id()).await?;
    pool.close().await;

    Ok(IngestOutcome {
        success,
        message,
        batch,
    })
}

async fn run_single(
    pool: &SqlitePool,
    config: &Config,
    path: &Path,
    dimension: Dimension,
    report_date: NaiveDate,
    counter: &ProgressCounter,
) -> Result<RunSummary> {
    let processed = process_shard(
        pool,
        path,
        dimension,
        report_date,
        config.ingest.batch_size,
        |n| counter.add(n),
    )
    .await?;

    Ok(RunSummary {
        processed,
        failure: None,
    })
}

#[allow(clippy::too_many_arguments)]
async fn run_sharded(
    config: &Config,
    path: &Path,
    batch_id: i64,
    dimension: Dimension,
    report_date: NaiveDate,
    counter: &ProgressCounter,
    reporter: &dyn ProgressReporter,
    batch_name: &str,
) -> Result<RunSummary> {
    let shard_dir = config
        .ingest
        .work_dir
        .join(format!("shards-{}-{}", batch_id, Uuid::new_v4()));

    let result = async {
        let shards = split(config, path, &shard_dir).await?;
        reporter.report(IngestProgressEvent::Splitting {
            batch: batch_name.to_string(),
            shards: shards.len(),
        });
        info!(batch = batch_id, shards = shards.len(), dir = %shard_dir.display(), "Split complete");

        let outcomes = run_pool(config, &shards, dimension, report_date, counter).await?;
        Ok::<_, anyhow::Error>(summarize(&outcomes))
    }
    .await;

    remove_shard_dir(&shard_dir);
    result
}

async fn split(config: &Config, path: &Path, dir: &Path) -> Result<Vec<ShardFile>> {
    let src = path.to_path_buf();
    let dir: PathBuf = dir.to_path_buf();
    let split_lines = config.ingest.split_lines;
    let shards = config.ingest.effective_workers();

    tokio::task::spawn_blocking(move || match split_lines {
        Some(lines) => split_by_lines(&src, lines, &dir),
        None => split_by_count(&src, shards, &dir),
    })
    .await
    .context("Splitter task failed")?
}

fn summarize(outcomes: &[crate::worker::ShardOutcome]) -> RunSummary {
    let processed = outcomes
        .iter()
        .filter(|o| o.is_success())
        .map(|o| o.processed_count)
        .sum();

    let failed: Vec<_> = outcomes.iter().filter(|o| !o.is_success()).collect();
    let failure = failed.first().map(|first| {
        format!(
            "{} of {} shards failed: {}",
            failed.len(),
            outcomes.len(),
            first.error.as_deref().unwrap_or("unknown error")
        )
    });

    RunSummary { processed, failure }
}

/// CLI entry point for `sri ingest`.
pub async fn run_ingest(
    config: &Config,
    path: &Path,
    name: Option<&str>,
    dimension: Dimension,
    keep_source: bool,
    progress: ProgressMode,
) -> Result<bool> {
    let original_filename = match name {
        Some(n) => n.to_string(),
        None => path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .with_context(|| format!("No file name in {}", path.display()))?,
    };

    let result =
        process_file_with(config, path, &original_filename, dimension, progress.reporter()).await;

    if !keep_source {
        match std::fs::remove_file(path) {
            Ok(()) => info!(path = %path.display(), "Removed source file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove source file"),
        }
    }

    let outcome = result?;
    println!("ingest {} ({})", original_filename, dimension);
    match &outcome.batch {
        Some(batch) => {
            println!("  batch:      {}", batch.id);
            println!("  status:     {}", batch.status);
            println!("  report:     {}", batch.import_date);
            println!("  processed:  {}", batch.processed_count);
            println!("  elapsed:    {}s", batch.elapsed_seconds);
        }
        None => println!("  status:     REJECTED"),
    }
    println!("  message:    {}", outcome.message);
    println!("{}", if outcome.success { "ok" } else { "failed" });

    Ok(outcome.success)
}
