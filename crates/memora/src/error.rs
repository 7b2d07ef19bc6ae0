//! Error types for Memora

use thiserror::Error;

/// Main error type for Memora operations
#[derive(Error, Debug)]
pub enum MemoraError {
    /// Bad retention, queue or cache setup. Fatal at startup.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Storage unreachable, locked or corrupt
    #[error("Database error: {0}")]
    Database(String),

    /// Malformed memory fields rejected at the store boundary
    #[error("Validation error: {0}")]
    Validation(String),

    /// Recall latency budget exceeded (logged, never returned to callers)
    #[error("Performance error: {0}")]
    Performance(String),

    /// Classifier unavailable or timed out
    #[error("Integration error: {0}")]
    Integration(String),

    /// A migration step failed; the store stays on its prior version
    #[error("Migration error: {0}")]
    Migration(String),

    /// Ingestion queue errors (spool directory, unit files)
    #[error("Queue error: {0}")]
    Queue(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<rusqlite::Error> for MemoraError {
    fn from(e: rusqlite::Error) -> Self {
        MemoraError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for MemoraError {
    fn from(e: serde_json::Error) -> Self {
        MemoraError::Serialization(e.to_string())
    }
}

/// Result type alias for Memora operations
pub type Result<T> = std::result::Result<T, MemoraError>;
