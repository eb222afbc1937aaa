//! Ingestion error types

use crate::repository::RepositoryError;
use thiserror::Error;

/// Errors that can occur while placing members into the index
#[derive(Error, Debug)]
pub enum IngestError {
    /// A repository call failed; aborts the current member only
    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    /// A timestamp outside the representable calendar range
    #[error("Unrepresentable timestamp: {0}")]
    InvalidTimestamp(i64),

    /// A stored fragment was missing data the engine relies on
    #[error("Corrupt index state: {0}")]
    CorruptIndex(String),

    /// A split could not re-materialize timestamps for all members
    #[error("Missing member timestamps while splitting fragment {0}")]
    MissingTimestamps(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias for ingestion operations
pub type IngestResult<T> = Result<T, IngestError>;
