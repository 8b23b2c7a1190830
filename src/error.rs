//! Error types for the pipeline and the read side.
//!
//! Malformed field values are never errors: they are coerced to defaults
//! during normalization (see [`crate::source::normalize`]).

use std::path::PathBuf;
use thiserror::Error;

/// Invalid or missing configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("DATABASE_URL missing in config")]
    MissingDatabaseUrl,

    #[error("source table '{0}' not found")]
    TableNotFound(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Errors that abort a refresh run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Configuration(#[from] ConfigError),

    #[error("source read failed: {0}")]
    SourceRead(String),

    #[error("snapshot I/O failed for {}: {source}", path.display())]
    SnapshotIo {
        path: PathBuf,
        #[source]
        source: SnapshotIoSource,
    },

    #[error("a refresh run is already in progress")]
    RunInProgress,

    #[error("background task failed: {0}")]
    Worker(String),
}

/// Underlying cause of a snapshot failure.
#[derive(Debug, Error)]
pub enum SnapshotIoSource {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error(transparent)]
    Arrow(#[from] arrow::error::ArrowError),
}

impl PipelineError {
    /// Wrap a snapshot failure with the file it concerns.
    pub fn snapshot(path: impl Into<PathBuf>, source: impl Into<SnapshotIoSource>) -> Self {
        Self::SnapshotIo {
            path: path.into(),
            source: source.into(),
        }
    }
}

impl From<tokio_postgres::Error> for PipelineError {
    fn from(e: tokio_postgres::Error) -> Self {
        Self::SourceRead(e.to_string())
    }
}

/// Errors returned by read-side queries.
#[derive(Debug, Error)]
pub enum QueryError {
    /// The requested entity does not exist in loaded data.
    #[error("{0}")]
    NotFound(String),

    /// No data has been loaded yet.
    #[error("{0}")]
    Unavailable(String),

    #[error("{0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Source(#[from] PipelineError),
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
