//! # Search Rank Ingest
//!
//! Bulk ingest of product-search ranking exports into a per-keyword record
//! that tracks a daily and a weekly ranking series.
//!
//! Each export is a CSV with a metadata banner, a header and one row per
//! search term. Rows are merged by keyword: current and previous rank, the
//! change between them, a "new" flag and, for the daily series, a rolling
//! seven-point trend.
//!
//! ## Architecture
//!
//! ```text
//!                       ┌───────────────────────────┐
//!   export.csv ──▶ validate ──▶ ingest (dispatcher)  │
//!                       └──────┬──────────────┬─────┘
//!                   small file │              │ large file
//!                              ▼              ▼
//!                         ┌────────┐     ┌──────────┐   shard_0000.csv
//!                         │ reader │     │ splitter │──▶ shard_0001.csv ...
//!                         └───┬────┘     └──────────┘         │
//!                             ▼                               ▼
//!                         ┌────────┐               ┌────────────────────┐
//!                         │ upsert │◀──────────────│ worker (sri worker) │ × N
//!                         └───┬────┘               └────────────────────┘
//!                             ▼
//!                     ┌───────────────┐     ┌──────────────────┐
//!                     │ SQLite (WAL)  │◀────│ batch + progress │
//!                     └───────────────┘     └──────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! sri init                                              # create database
//! sri ingest ./US_Top_Search_Terms_Day_2024_01_02.csv --type daily
//! sri status --type daily
//! sri get "wireless earbuds"
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`validate`] | Pre-flight structure check, report date extraction |
//! | [`reader`] | Streaming row-batch reader |
//! | [`splitter`] | Line-aligned shard splitting |
//! | [`upsert`] | Keyword-keyed merge statements |
//! | [`worker`] | Shard worker processes |
//! | [`ingest`] | Strategy dispatch and run orchestration |
//! | [`batch`] | Import batch lifecycle and status |
//! | [`progress`] | Batch heartbeat and CLI progress |
//! | [`stats`] | Batch statistics |
//! | [`get`] | Single-record lookup |
//! | [`search`] | Filtered, paginated record search |
//! | [`retention`] | Pruning of stale records |
//! | [`sessions`] | Upload session store with TTL |
//! | [`error`] | Typed pre-flight and worker errors |
//! | [`logging`] | Tracing subscriber setup |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod batch;
pub mod config;
pub mod db;
pub mod error;
pub mod get;
pub mod ingest;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod progress;
pub mod reader;
pub mod retention;
pub mod search;
pub mod sessions;
pub mod splitter;
pub mod stats;
pub mod upsert;
pub mod validate;
pub mod worker;

#[cfg(test)]
mod testutil;
