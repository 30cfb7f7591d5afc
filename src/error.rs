//! Run-fatal error types.
//!
//! Record- and column-level failures never appear here; the ingest layer
//! turns them into [`crate::ingest::Diagnostic`]s instead.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Taxonomy document is malformed or fails validation.
    #[error("Taxonomy configuration error: {0}")]
    Config(String),

    /// Two taxonomy tags sanitize to the same column name.
    #[error("Column name conflict: {first} and {second} both map to column '{column}'")]
    SchemaConflict {
        first: String,
        second: String,
        column: String,
    },

    /// Backing store unreachable or unusable.
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The raw metadata source failed as a whole.
    #[error("Metadata source error: {0}")]
    Source(String),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn source_failed(msg: impl Into<String>) -> Self {
        Self::Source(msg.into())
    }
}
