//! Tracing subscriber setup.
//!
//! All log output goes to **stderr**. Stdout is reserved for command output
//! and, in `sri worker`, for the JSON lines the coordinator parses.
//!
//! The `[logging]` config section sets the default level and format;
//! `RUST_LOG` overrides the level when present.

use anyhow::{Context, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// Build the filter: `RUST_LOG` wins, otherwise the configured level.
fn build_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.level)
            .with_context(|| format!("Invalid log level: {}", config.level)),
    }
}

/// Install the global subscriber. Safe to call once per process; a second
/// call returns an error which callers may ignore.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = build_filter(config)?;

    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_ansi(atty::is(atty::Stream::Stderr));

    match config.format.as_str() {
        "json" => tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer.json())
            .try_init()?,
        _ => tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .try_init()?,
    }

    Ok(())
}
