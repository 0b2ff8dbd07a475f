//! Process-level shard workers.
//!
//! The coordinator re-invokes its own binary as `sri worker` once per shard,
//! at most [`IngestConfig::effective_workers`] at a time. Each child opens
//! its own database pool, streams its shard through the reader and the
//! upsert engine, and reports back on stdout with one JSON object per line:
//!
//! ```text
//! {"event":"progress","shard_id":0,"rows":5000}
//! {"event":"outcome","shard_id":0,"processed_count":12000,"status":"success","error":null}
//! ```
//!
//! Progress lines carry increments; the coordinator sums them into the
//! run's [`ProgressCounter`]. A child never touches the batch row.
//!
//! Children log with the run's `[logging]` level and format. Their stderr
//! is passed through to the coordinator's stderr line by line, so row
//! warnings from a shard reach the operator exactly as on the single-process
//! path. The last lines are also kept for failure reports.
//!
//! Every worker deletes its shard on exit, whatever the outcome. The
//! coordinator also removes the shard after the child is reaped, which
//! covers children that died before their guard ran.
//!
//! [`IngestConfig::effective_workers`]: crate::config::IngestConfig::effective_workers

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::VecDeque;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::db;
use crate::error::IngestError;
use crate::models::Dimension;
use crate::progress::ProgressCounter;
use crate::reader::{count_date_mismatches, spawn_reader};
use crate::splitter::ShardFile;
use crate::upsert::upsert_batch;

/// Lines of child stderr kept for failure reports.
const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShardStatus {
    Success,
    Failed,
}

/// Result of one shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardOutcome {
    pub shard_id: usize,
    pub processed_count: u64,
    pub status: ShardStatus,
    pub error: Option<String>,
}

impl ShardOutcome {
    pub fn success(shard_id: usize, processed_count: u64) -> Self {
        Self {
            shard_id,
            processed_count,
            status: ShardStatus::Success,
            error: None,
        }
    }

    pub fn failed(shard_id: usize, error: impl Into<String>) -> Self {
        Self {
            shard_id,
            processed_count: 0,
            status: ShardStatus::Failed,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ShardStatus::Success
    }
}

/// One line of worker stdout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkerEvent {
    Progress { shard_id: usize, rows: u64 },
    Outcome(ShardOutcome),
}

pub fn parse_event(line: &str) -> Result<WorkerEvent, IngestError> {
    serde_json::from_str(line).map_err(|e| IngestError::WorkerProtocol(format!("{}: {}", e, line)))
}

/// Stream a CSV file through the reader into the upsert engine.
///
/// `on_batch` is called with the size of each committed batch. Returns the
/// total number of rows applied. A failing batch is rolled back and ends
/// the run; earlier batches stay committed.
pub async fn process_shard<F>(
    pool: &SqlitePool,
    path: &Path,
    dimension: Dimension,
    report_date: NaiveDate,
    batch_size: usize,
    mut on_batch: F,
) -> Result<u64>
where
    F: FnMut(u64),
{
    let (mut rx, reader) = spawn_reader(path.to_path_buf(), batch_size);

    let mut mismatched = 0usize;
    let result = async {
        let mut applied = 0u64;
        while let Some(batch) = rx.recv().await {
            let rows = batch?;
            mismatched += count_date_mismatches(&rows, report_date);
            let n = upsert_batch(pool, dimension, &rows, report_date).await?;
            applied += n;
            on_batch(n);
        }
        Ok::<u64, anyhow::Error>(applied)
    }
    .await;

    // The file name date is authoritative; rows are stored under it regardless.
    if mismatched > 0 {
        warn!(
            path = %path.display(),
            rows = mismatched,
            %report_date,
            "Row report dates differ from the file name date"
        );
    }

    // Unblocks the reader thread if we stopped early.
    drop(rx);
    let joined = reader.await;
    let applied = result?;
    joined.context("CSV reader task failed")?;
    Ok(applied)
}

/// Arguments of the hidden `sri worker` command.
#[derive(Debug, Clone)]
pub struct WorkerArgs {
    pub db: PathBuf,
    pub busy_timeout_secs: u64,
    pub shard: PathBuf,
    pub shard_id: usize,
    pub report_date: NaiveDate,
    pub dimension: Dimension,
    pub batch_size: usize,
}

/// Removes the shard file when dropped.
struct ShardGuard<'a>(&'a Path);

impl Drop for ShardGuard<'_> {
    fn drop(&mut self) {
        match std::fs::remove_file(self.0) {
            Ok(()) => debug!(path = %self.0.display(), "Removed shard"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.0.display(), error = %e, "Failed to remove shard"),
        }
    }
}

fn emit<W: Write>(out: &mut W, event: &WorkerEvent) -> Result<()> {
    let line = serde_json::to_string(event)?;
    writeln!(out, "{}", line)?;
    out.flush()?;
    Ok(())
}

/// Body of `sri worker`: process one shard and report on `out`.
///
/// Processing failures are reported as a failed outcome rather than an
/// error; only a broken output channel is returned as `Err`.
pub async fn run_worker<W: Write>(args: &WorkerArgs, out: &mut W) -> Result<ShardOutcome> {
    let _guard = ShardGuard(&args.shard);

    let mut config = Config::with_db(&args.db);
    config.db.busy_timeout_secs = args.busy_timeout_secs;

    let mut progress_error = None;
    let result = async {
        let pool = db::connect(&config).await?;
        let applied = process_shard(
            &pool,
            &args.shard,
            args.dimension,
            args.report_date,
            args.batch_size,
            |rows| {
                let event = WorkerEvent::Progress {
                    shard_id: args.shard_id,
                    rows,
                };
                if let Err(e) = emit(out, &event) {
                    progress_error.get_or_insert(e);
                }
            },
        )
        .await;
        pool.close().await;
        applied
    }
    .await;

    if let Some(e) = progress_error {
        return Err(e.context("Failed to write worker progress"));
    }

    let outcome = match result {
        Ok(n) => {
            info!(shard = args.shard_id, rows = n, "Shard complete");
            ShardOutcome::success(args.shard_id, n)
        }
        Err(e) => {
            let message = format!("{:#}", e);
            warn!(shard = args.shard_id, error = %message, "Shard failed");
            ShardOutcome::failed(args.shard_id, message)
        }
    };

    emit(out, &WorkerEvent::Outcome(outcome.clone()))?;
    Ok(outcome)
}

fn remove_if_exists(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove shard");
        }
    }
}

/// Run one child process for `shard` and collect its outcome.
async fn run_child(
    exe: &Path,
    config: &Config,
    shard: &ShardFile,
    dimension: Dimension,
    report_date: NaiveDate,
    counter: &ProgressCounter,
) -> Result<ShardOutcome> {
    let mut child = Command::new(exe)
        .arg("worker")
        .arg("--db")
        .arg(&config.db.path)
        .arg("--busy-timeout-secs")
        .arg(config.db.busy_timeout_secs.to_string())
        .arg("--shard")
        .arg(&shard.path)
        .arg("--shard-id")
        .arg(shard.id.to_string())
        .arg("--report-date")
        .arg(report_date.format("%Y-%m-%d").to_string())
        .arg("--type")
        .arg(dimension.as_str())
        .arg("--batch-size")
        .arg(config.ingest.batch_size.to_string())
        .arg("--log-level")
        .arg(&config.logging.level)
        .arg("--log-format")
        .arg(&config.logging.format)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to spawn worker for shard {}", shard.id))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| IngestError::WorkerProtocol("worker stdout not captured".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| IngestError::WorkerProtocol("worker stderr not captured".into()))?;

    let shard_id = shard.id;
    let stderr_task = tokio::spawn(async move {
        let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            // Already filtered and formatted by the child's subscriber.
            eprintln!("{}", line);
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
        tail.into_iter().collect::<Vec<_>>().join("\n")
    });

    let mut outcome = None;
    let mut lines = BufReader::new(stdout).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match parse_event(&line) {
            Ok(WorkerEvent::Progress { rows, .. }) => counter.add(rows),
            Ok(WorkerEvent::Outcome(o)) => outcome = Some(o),
            Err(e) => warn!(shard = shard_id, error = %e, "Ignoring worker output"),
        }
    }

    let status = child.wait().await?;
    let stderr_tail = stderr_task.await.unwrap_or_default();

    Ok(match outcome {
        Some(o) => o,
        None => ShardOutcome::failed(
            shard_id,
            format!("worker exited ({}) without reporting: {}", status, stderr_tail),
        ),
    })
}

/// Run all shards through worker processes and gather their outcomes,
/// ordered by shard id. A failing shard never cancels its siblings.
pub async fn run_pool(
    config: &Config,
    shards: &[ShardFile],
    dimension: Dimension,
    report_date: NaiveDate,
    counter: &ProgressCounter,
) -> Result<Vec<ShardOutcome>> {
    let exe = std::env::current_exe().context("Cannot locate the sri executable")?;
    let workers = config.ingest.effective_workers();
    let slots = Arc::new(Semaphore::new(workers));
    info!(shards = shards.len(), workers, "Starting shard workers");

    let mut handles = Vec::with_capacity(shards.len());
    for shard in shards {
        let slots = slots.clone();
        let exe = exe.clone();
        let config = config.clone();
        let shard = shard.clone();
        let counter = counter.clone();

        handles.push(tokio::spawn(async move {
            let outcome = match slots.acquire_owned().await {
                Ok(_permit) => {
                    run_child(&exe, &config, &shard, dimension, report_date, &counter).await
                }
                Err(e) => Err(anyhow::Error::new(e)),
            };
            remove_if_exists(&shard.path);
            outcome.unwrap_or_else(|e| ShardOutcome::failed(shard.id, format!("{:#}", e)))
        }));
    }

    let mut outcomes = Vec::with_capacity(handles.len());
    for (shard, handle) in shards.iter().zip(handles) {
        let outcome = match handle.await {
            Ok(o) => o,
            Err(e) => ShardOutcome::failed(shard.id, format!("worker task failed: {}", e)),
        };
        if outcome.is_success() {
            debug!(shard = outcome.shard_id, rows = outcome.processed_count, "Shard succeeded");
        } else {
            warn!(shard = outcome.shard_id, error = ?outcome.error, "Shard failed");
        }
        outcomes.push(outcome);
    }

    outcomes.sort_by_key(|o| o.shard_id);
    Ok(outcomes)
}
