use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    #[serde(default = "default_busy_timeout_secs")]
    pub busy_timeout_secs: u64,
}

fn default_busy_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Files at or above this size go through the sharded worker path.
    #[serde(default = "default_multiprocess_threshold_mb")]
    pub multiprocess_threshold_mb: f64,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Split by line count instead of one shard per worker slot.
    #[serde(default)]
    pub split_lines: Option<usize>,
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    #[serde(default = "default_progress_interval_secs")]
    pub progress_interval_secs: u64,
    #[serde(default = "default_min_fields")]
    pub min_fields: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            multiprocess_threshold_mb: default_multiprocess_threshold_mb(),
            max_workers: default_max_workers(),
            split_lines: None,
            work_dir: default_work_dir(),
            progress_interval_secs: default_progress_interval_secs(),
            min_fields: default_min_fields(),
        }
    }
}

fn default_batch_size() -> usize {
    5000
}
fn default_multiprocess_threshold_mb() -> f64 {
    100.0
}
fn default_max_workers() -> usize {
    2
}
fn default_work_dir() -> PathBuf {
    PathBuf::from("./data/shards")
}
fn default_progress_interval_secs() -> u64 {
    5
}
fn default_min_fields() -> usize {
    3
}

impl IngestConfig {
    pub fn multiprocess_threshold_bytes(&self) -> u64 {
        (self.multiprocess_threshold_mb * 1024.0 * 1024.0) as u64
    }

    /// Worker slots actually used: never more than the host has cores.
    pub fn effective_workers(&self) -> usize {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        self.max_workers.min(cpus).max(1)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionsConfig {
    #[serde(default = "default_session_ttl_secs")]
    pub ttl_secs: i64,
    /// Parent of the per-session upload directories.
    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_session_ttl_secs(),
            upload_dir: default_upload_dir(),
        }
    }
}

fn default_session_ttl_secs() -> i64 {
    3600
}
fn default_upload_dir() -> PathBuf {
    PathBuf::from("./data/uploads")
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}

impl Config {
    /// Config used when no file is available (e.g. `sri worker` spawned
    /// with only a database path).
    pub fn with_db(path: &Path) -> Self {
        Self {
            db: DbConfig {
                path: path.to_path_buf(),
                busy_timeout_secs: default_busy_timeout_secs(),
            },
            ingest: IngestConfig::default(),
            sessions: SessionsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.ingest.batch_size == 0 {
        anyhow::bail!("ingest.batch_size must be > 0");
    }

    if config.ingest.max_workers == 0 {
        anyhow::bail!("ingest.max_workers must be >= 1");
    }

    if config.ingest.progress_interval_secs == 0 {
        anyhow::bail!("ingest.progress_interval_secs must be >= 1");
    }

    if config.ingest.split_lines == Some(0) {
        anyhow::bail!("ingest.split_lines must be > 0 when set");
    }

    if config.ingest.multiprocess_threshold_mb < 0.0 {
        anyhow::bail!("ingest.multiprocess_threshold_mb must be >= 0");
    }

    if config.sessions.ttl_secs <= 0 {
        anyhow::bail!("sessions.ttl_secs must be > 0");
    }

    match config.logging.format.as_str() {
        "text" | "json" => {}
        other => anyhow::bail!(
            "Unknown logging format: '{}'. Must be text or json.",
            other
        ),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_src: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_src)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn defaults_fill_missing_sections() {
        let config = parse("[db]\npath = \"/tmp/x.sqlite\"\n").unwrap();
        assert_eq!(config.ingest.batch_size, 5000);
        assert_eq!(config.ingest.max_workers, 2);
        assert_eq!(config.ingest.progress_interval_secs, 5);
        assert_eq!(config.db.busy_timeout_secs, 30);
        assert_eq!(config.logging.format, "text");
        assert!(config.ingest.split_lines.is_none());
    }

    #[test]
    fn threshold_in_bytes() {
        let config = parse(
            "[db]\npath = \"x\"\n[ingest]\nmultiprocess_threshold_mb = 1.5\n",
        )
        .unwrap();
        assert_eq!(config.ingest.multiprocess_threshold_bytes(), 1_572_864);
    }

    #[test]
    fn rejects_zero_batch_size() {
        let err = parse("[db]\npath = \"x\"\n[ingest]\nbatch_size = 0\n").unwrap_err();
        assert!(err.to_string().contains("batch_size"));
    }

    #[test]
    fn rejects_unknown_log_format() {
        let err = parse("[db]\npath = \"x\"\n[logging]\nformat = \"xml\"\n").unwrap_err();
        assert!(err.to_string().contains("xml"));
    }

    #[test]
    fn effective_workers_bounded_by_config() {
        let mut ingest = IngestConfig::default();
        ingest.max_workers = 1;
        assert_eq!(ingest.effective_workers(), 1);
    }
}
