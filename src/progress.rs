//! Ingest progress: the batch-row heartbeat and CLI progress lines.
//!
//! [`ProgressMonitor`] is a background task that, every
//! `progress_interval_secs`, writes the run's elapsed time and processed
//! row count into its `import_batches` row. It opens a fresh connection per
//! tick and stops as soon as the row is no longer `PROCESSING`, or when the
//! run stops it explicitly.
//!
//! The processed count lives in a single [`ProgressCounter`] owned by the
//! coordinator. Shard workers report increments back to the coordinator
//! instead of writing the batch row themselves, so there is exactly one
//! writer for `processed_count` during a run.
//!
//! Human or JSON progress lines go to **stderr** so stdout stays parseable.

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use sqlx::Connection;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::Config;
use crate::db;
use crate::models::BatchStatus;

/// Shared processed-row counter for one run.
#[derive(Clone, Debug, Default)]
pub struct ProgressCounter(Arc<AtomicU64>);

impl ProgressCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// A single progress event for an ingest run.
#[derive(Clone, Debug)]
pub enum IngestProgressEvent {
    /// Source is being cut into shards.
    Splitting { batch: String, shards: usize },
    /// Rows applied so far against the estimated total.
    Ingesting { batch: String, n: u64, total: u64 },
}

/// Reports ingest progress. Implementations write to stderr.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: IngestProgressEvent);
}

/// Human-friendly progress: "ingest a.csv  ingesting  1,234 / 5,000 rows".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: IngestProgressEvent) {
        let line = match &event {
            IngestProgressEvent::Splitting { batch, shards } => {
                format!("ingest {}  splitting into {} shards\n", batch, shards)
            }
            IngestProgressEvent::Ingesting { batch, n, total } => format!(
                "ingest {}  ingesting  {} / {} rows\n",
                batch,
                format_number(*n),
                format_number(*total)
            ),
        };
        let mut err = std::io::stderr().lock();
        let _ = err.write_all(line.as_bytes());
        let _ = err.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: IngestProgressEvent) {
        let obj = match &event {
            IngestProgressEvent::Splitting { batch, shards } => serde_json::json!({
                "event": "progress",
                "batch": batch,
                "phase": "splitting",
                "shards": shards
            }),
            IngestProgressEvent::Ingesting { batch, n, total } => serde_json::json!({
                "event": "progress",
                "batch": batch,
                "phase": "ingesting",
                "n": n,
                "total": total
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut err = std::io::stderr().lock();
            let _ = writeln!(err, "{}", line);
            let _ = err.flush();
        }
    }
}

pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: IngestProgressEvent) {}
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Arc<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Arc::new(NoProgress),
            ProgressMode::Human => Arc::new(StderrProgress),
            ProgressMode::Json => Arc::new(JsonProgress),
        }
    }
}

impl std::str::FromStr for ProgressMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "off" => Ok(ProgressMode::Off),
            "human" => Ok(ProgressMode::Human),
            "json" => Ok(ProgressMode::Json),
            other => anyhow::bail!("Unknown progress mode: '{}'. Use off, human, or json.", other),
        }
    }
}

/// Write one heartbeat. Returns the number of rows touched (0 once the
/// batch is terminal).
async fn write_heartbeat(config: &Config, batch_id: i64, elapsed: i64, processed: u64) -> Result<u64> {
    let mut conn = db::connect_once(config).await?;
    let result = sqlx::query(
        "UPDATE import_batches SET elapsed_seconds = ?, processed_count = ? WHERE id = ? AND status = ?",
    )
    .bind(elapsed)
    .bind(processed as i64)
    .bind(batch_id)
    .bind(BatchStatus::Processing.as_str())
    .execute(&mut conn)
    .await?;
    conn.close().await?;
    Ok(result.rows_affected())
}

/// Periodic batch-row updater for one run.
pub struct ProgressMonitor {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// What the monitor reports on each tick.
pub struct MonitorTarget {
    pub batch_id: i64,
    pub batch_name: String,
    pub total: u64,
    pub started: Instant,
    pub counter: ProgressCounter,
}

impl ProgressMonitor {
    pub fn spawn(config: &Config, target: MonitorTarget, reporter: Arc<dyn ProgressReporter>) -> Self {
        let config = config.clone();
        let period = Duration::from_secs(config.ingest.progress_interval_secs.max(1));
        let (stop_tx, mut stop_rx) = oneshot::channel();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // the first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        let processed = target.counter.get();
                        let elapsed = target.started.elapsed().as_secs() as i64;
                        reporter.report(IngestProgressEvent::Ingesting {
                            batch: target.batch_name.clone(),
                            n: processed,
                            total: target.total,
                        });

                        match write_heartbeat(&config, target.batch_id, elapsed, processed).await {
                            Ok(0) => {
                                debug!(batch = target.batch_id, "Batch no longer processing; monitor exiting");
                                break;
                            }
                            Ok(_) => {}
                            Err(e) => warn!(batch = target.batch_id, error = %e, "Progress update failed"),
                        }
                    }
                }
            }
        });

        Self {
            stop: stop_tx,
            handle,
        }
    }

    /// Signal the monitor and wait for it to exit.
    pub async fn stop(self) {
        let _ = self.stop.send(());
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Progress monitor task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{get_batch, BatchTracker};
    use crate::models::Dimension;
    use crate::testutil::test_config;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn progress_mode_parsing() {
        assert_eq!("json".parse::<ProgressMode>().unwrap(), ProgressMode::Json);
        assert!("loud".parse::<ProgressMode>().is_err());
    }

    #[tokio::test]
    async fn monitor_writes_heartbeat_and_exits_on_terminal_batch() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(tmp.path());
        crate::migrate::run_migrations(&config).await.unwrap();
        let pool = db::connect(&config).await.unwrap();

        let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let tracker = BatchTracker::create(&pool, "a.csv", date, Dimension::Daily, 100)
            .await
            .unwrap();

        let counter = ProgressCounter::new();
        counter.add(42);
        let monitor = ProgressMonitor::spawn(
            &config,
            MonitorTarget {
                batch_id: tracker.id(),
                batch_name: "a.csv".into(),
                total: 100,
                started: Instant::now(),
                counter: counter.clone(),
            },
            Arc::new(NoProgress),
        );

        tokio::time::sleep(Duration::from_millis(1500)).await;
        let batch = get_batch(&pool, tracker.id()).await.unwrap().unwrap();
        assert_eq!(batch.processed_count, 42);

        tracker.fail(&pool, 42, "stopped").await.unwrap();
        // exits on its own at the next tick
        tokio::time::timeout(Duration::from_secs(5), monitor.handle)
            .await
            .unwrap()
            .unwrap();
    }
}
