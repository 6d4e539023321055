//! Error types for hybriddb.

use std::time::Duration;
use thiserror::Error;

/// Top-level error type for index and database operations.
///
/// Deleting a label or uid that does not exist is not an error: deletes
/// report how many entries were actually removed instead.
#[derive(Error, Debug)]
pub enum Error {
    /// Persisted index disagrees with the current configuration.
    #[error("configuration mismatch on {field}: expected {expected}, found {found}")]
    ConfigMismatch {
        field: &'static str,
        expected: String,
        found: String,
    },

    /// Operation is not available on this backend.
    #[error("{operation} is not supported by the {backend} backend")]
    UnsupportedOperation {
        operation: &'static str,
        backend: String,
    },

    /// A structured-query fragment failed to compile or execute.
    #[error("query syntax error: {message} (statement: {statement})")]
    QuerySyntax { statement: String, message: String },

    /// Persisted index failed to deserialize or validate.
    #[error("corrupt index: {0}")]
    CorruptIndex(String),

    /// Vector width does not match the index.
    #[error("invalid vector dimension: expected {expected}, got {found}")]
    DimensionMismatch { expected: usize, found: usize },

    /// Query ran past its deadline.
    #[error("query exceeded deadline of {0:?}")]
    Timeout(Duration),

    /// Input rejected before any state was changed.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Search, append or save on an index that was never built or loaded.
    #[error("index has not been built")]
    NotIndexed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn unsupported(operation: &'static str, backend: impl ToString) -> Self {
        Error::UnsupportedOperation {
            operation,
            backend: backend.to_string(),
        }
    }
}

/// Result type for hybriddb operations.
pub type Result<T> = std::result::Result<T, Error>;
