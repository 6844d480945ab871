//! Error types for sensorfabric ingestion

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias used across the crate
pub type Result<T, E = IngestError> = std::result::Result<T, E>;

/// Errors that can occur while ingesting a date folder
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Malformed participant folder name '{0}': expected '{{participant_id}}-{{device_id}}'")]
    MalformedFolderName(String),

    #[error("Missing sub-path: {}", .0.display())]
    MissingSubPath(PathBuf),

    #[error("Failed to decode {}: {reason}", path.display())]
    Decode { path: PathBuf, reason: String },

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Schema mismatch for table '{table}': {reason}")]
    SchemaMismatch { table: String, reason: String },

    #[error("Failed to write table '{table}': {reason}")]
    StorageWrite { table: String, reason: String },

    #[error("Failed to update catalog entry for '{table}': {reason}")]
    CatalogUpdate { table: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),
}

impl IngestError {
    pub(crate) fn decode(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        IngestError::Decode {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether retrying the failed operation may succeed.
    ///
    /// Only I/O failures that the OS reports as temporary are retried; everything
    /// else (bad data, schema conflicts, missing permissions) fails fast.
    pub fn is_transient(&self) -> bool {
        match self {
            IngestError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ),
            IngestError::Parquet(parquet::errors::ParquetError::External(_)) => true,
            _ => false,
        }
    }
}
