//! # Search Rank Ingest CLI (`sri`)
//!
//! The `sri` binary drives the ingest pipeline and exposes the batch and
//! record queries.
//!
//! ## Usage
//!
//! ```bash
//! sri --config ./config/sri.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `sri init` | Create the SQLite database and run schema migrations |
//! | `sri ingest <path> --type daily\|weekly` | Ingest one ranking export |
//! | `sri status` | Show recent import batches and their progress |
//! | `sri stats` | Batch statistics and record counts |
//! | `sri get <keyword>` | Print the merged record for a keyword |
//! | `sri search` | Filter, sort and page through keyword records |
//! | `sri prune --days N` | Delete records not seen in N days |
//! | `sri sessions purge` | Evict expired upload sessions |
//!
//! ## Examples
//!
//! ```bash
//! # Initialize the database
//! sri init --config ./config/sri.toml
//!
//! # Ingest a daily export; the report date comes from the file name
//! sri ingest ./uploads/US_Top_Search_Terms_Day_2024_01_02.csv --type daily
//!
//! # Ingest an upload stored under a temp name, keeping the file afterwards
//! sri ingest /tmp/upload-1f3a --name weekly_2024-01-07.csv --type weekly --keep-source
//!
//! # Last five daily batches as JSON
//! sri status --type daily --json
//!
//! # Keywords that climbed at least ten places today, best first
//! sri search --report-date 2024-01-02 --daily-change-max -10 --order-by daily_rank
//! ```

use clap::{Parser, Subcommand};
use chrono::NaiveDate;
use std::path::PathBuf;

use search_rank_ingest::config::{self, LoggingConfig};
use search_rank_ingest::models::Dimension;
use search_rank_ingest::progress::ProgressMode;
use search_rank_ingest::search::{self, PageRequest, SearchFilter};
use search_rank_ingest::worker::{self, ShardStatus, WorkerArgs};
use search_rank_ingest::{batch, get, ingest, logging, migrate, retention, sessions, stats};

/// Search Rank Ingest: merge search-ranking CSV exports into per-keyword
/// daily and weekly rank histories.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/sri.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "sri",
    about = "Search Rank Ingest: merge search-ranking CSV exports into per-keyword rank histories",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/sri.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all tables. Idempotent.
    Init,

    /// Ingest one ranking export.
    ///
    /// Validates the file, reads the report date from its name, and merges
    /// every row into the keyword records. Files at or above
    /// `ingest.multiprocess_threshold_mb` are split and processed by
    /// parallel worker processes.
    Ingest {
        /// Path to the CSV export.
        path: PathBuf,

        /// Ranking series the file belongs to: `daily` or `weekly`.
        #[arg(long = "type")]
        dimension: Dimension,

        /// Original file name, when `path` is a temp name. The report date
        /// (YYYY-MM-DD or YYYY_MM_DD) is taken from this name.
        #[arg(long)]
        name: Option<String>,

        /// Keep the source file after ingest (it is removed by default).
        #[arg(long)]
        keep_source: bool,

        /// Progress output on stderr: `off`, `human`, or `json`.
        /// Defaults to `human` on a terminal, otherwise `off`.
        #[arg(long)]
        progress: Option<ProgressMode>,
    },

    /// Show recent import batches.
    Status {
        /// Only batches of this series.
        #[arg(long = "type")]
        dimension: Option<Dimension>,

        /// Number of batches to show.
        #[arg(long, default_value_t = 5)]
        limit: i64,

        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Batch statistics and record counts.
    Stats {
        /// Window of report dates to include.
        #[arg(long, default_value_t = 30)]
        days: i64,

        #[arg(long)]
        json: bool,
    },

    /// Print the merged record for a keyword.
    Get {
        keyword: String,

        #[arg(long)]
        json: bool,
    },

    /// Filter, sort and page through keyword records.
    Search {
        #[command(flatten)]
        filter: SearchFilter,

        #[command(flatten)]
        page: PageRequest,

        /// Print JSON instead of a list.
        #[arg(long)]
        json: bool,
    },

    /// Delete keyword records whose daily and weekly dates are both older
    /// than the retention window.
    Prune {
        /// Days of data to keep.
        #[arg(long)]
        days: i64,
    },

    /// Manage upload sessions.
    Sessions {
        #[command(subcommand)]
        action: SessionsAction,
    },

    /// Process one shard (spawned by `sri ingest`).
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        db: PathBuf,
        #[arg(long, default_value_t = 30)]
        busy_timeout_secs: u64,
        #[arg(long)]
        shard: PathBuf,
        #[arg(long)]
        shard_id: usize,
        #[arg(long)]
        report_date: NaiveDate,
        #[arg(long = "type")]
        dimension: Dimension,
        #[arg(long, default_value_t = 5000)]
        batch_size: usize,
        #[arg(long, default_value = "info")]
        log_level: String,
        #[arg(long, default_value = "text")]
        log_format: String,
    },
}

#[derive(Subcommand)]
enum SessionsAction {
    /// Remove expired sessions and their temp directories.
    Purge,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Workers run without a config file; the coordinator passes what they need.
    if let Commands::Worker {
        db,
        busy_timeout_secs,
        shard,
        shard_id,
        report_date,
        dimension,
        batch_size,
        log_level,
        log_format,
    } = cli.command
    {
        let _ = logging::init_logging(&LoggingConfig {
            level: log_level,
            format: log_format,
        });
        let args = WorkerArgs {
            db,
            busy_timeout_secs,
            shard,
            shard_id,
            report_date,
            dimension,
            batch_size,
        };
        let outcome = worker::run_worker(&args, &mut std::io::stdout()).await?;
        if outcome.status == ShardStatus::Failed {
            std::process::exit(1);
        }
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;
    logging::init_logging(&cfg.logging)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest {
            path,
            dimension,
            name,
            keep_source,
            progress,
        } => {
            let progress = progress.unwrap_or_else(ProgressMode::default_for_tty);
            let ok =
                ingest::run_ingest(&cfg, &path, name.as_deref(), dimension, keep_source, progress)
                    .await?;
            if !ok {
                std::process::exit(1);
            }
        }
        Commands::Status {
            dimension,
            limit,
            json,
        } => {
            batch::run_status(&cfg, dimension, limit, json).await?;
        }
        Commands::Stats { days, json } => {
            stats::run_stats(&cfg, days, json).await?;
        }
        Commands::Get { keyword, json } => {
            if let Err(e) = get::run_get(&cfg, &keyword, json).await {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        }
        Commands::Search { filter, page, json } => {
            search::run_search(&cfg, &filter, &page, json).await?;
        }
        Commands::Prune { days } => {
            retention::run_prune(&cfg, days).await?;
        }
        Commands::Sessions { action } => match action {
            SessionsAction::Purge => {
                sessions::run_purge(&cfg).await?;
            }
        },
        Commands::Worker { .. } => {
            // Handled above (before config loading)
            unreachable!()
        }
    }

    Ok(())
}
