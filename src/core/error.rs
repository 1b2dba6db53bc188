//! Crate-wide error taxonomy

use thiserror::Error;

use crate::core::identity::IdParseError;

/// Convenience alias used throughout the library
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the store, ledger, baseline, branch and merge layers
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed input, duplicate identifier, or a cycle in recursive links
    #[error("validation failed: {0}")]
    Validation(String),

    /// Attempted mutation of a row frozen by a baseline
    #[error("record {hierarchy} belongs to baseline '{baseline}' and cannot be modified")]
    ImmutableRecord { hierarchy: String, baseline: String },

    /// Audit chain verification mismatch
    #[error(
        "audit chain broken in table '{table}' at entry {entry_id} (row {row_id}): \
         expected prev hash '{expected}', found '{actual}'"
    )]
    Integrity {
        table: String,
        entry_id: i64,
        row_id: i64,
        expected: String,
        actual: String,
    },

    /// Merge collision left without a resolution
    #[error("unresolved merge conflict: {0}")]
    Conflict(String),

    /// Storage-level failure; the enclosing transaction rolled back
    #[error("database error: {0}")]
    Transaction(#[from] rusqlite::Error),

    /// Missing label, identifier, branch, or row
    #[error("{what} '{key}' not found")]
    NotFound { what: &'static str, key: String },

    #[error(transparent)]
    Id(#[from] IdParseError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Shorthand for a [`Error::NotFound`]
    pub fn not_found(what: &'static str, key: impl Into<String>) -> Self {
        Error::NotFound {
            what,
            key: key.into(),
        }
    }
}
