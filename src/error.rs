//! Error types for the ingest pipeline.
//!
//! Most code propagates `anyhow::Error`; these variants mark the failures
//! callers need to tell apart (pre-flight rejections that never touch the
//! database, and broken worker output).

use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Invalid file structure: {0}")]
    InvalidStructure(String),

    #[error("No report date (YYYY-MM-DD or YYYY_MM_DD) found in filename: {0}")]
    MissingReportDate(String),

    #[error("Unknown data type: '{0}'. Must be daily or weekly.")]
    UnknownDimension(String),

    #[error("Worker protocol error: {0}")]
    WorkerProtocol(String),
}

impl IngestError {
    /// Pre-flight errors are reported to the caller as a failed run
    /// without creating a batch.
    pub fn is_preflight(&self) -> bool {
        matches!(
            self,
            IngestError::InvalidStructure(_) | IngestError::MissingReportDate(_)
        )
    }
}
