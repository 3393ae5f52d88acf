//! Error types for bulk operations.

use thiserror::Error;

/// Errors that can occur while building or executing a bulk operation.
#[derive(Error, Debug)]
pub enum BulkError {
    /// One or more invalid options, reported together. Raised before any I/O.
    #[error("Unable to perform bulk operation: {}", .0.join("; "))]
    Config(Vec<String>),

    /// The configured `document` function returned something other than a
    /// document. Aborts the flush it occurred in; earlier flushes stay applied.
    #[error("the \"document\" function must return a document, got {0}")]
    InvalidDocument(String),

    /// MongoDB connection or command error.
    #[error("MongoDB error: {0}")]
    MongoDB(#[from] mongodb::error::Error),

    /// Failure surfaced by the backing collection, passed through unmodified.
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl BulkError {
    pub(crate) fn config(rule: impl Into<String>) -> Self {
        BulkError::Config(vec![rule.into()])
    }
}
