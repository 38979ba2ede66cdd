//! Error taxonomy for the staging-and-merge pipeline.
//!
//! Fatal configuration problems are caught before any I/O. Per-row failures
//! (validation, dangling associations) are skipped and logged; batch-level
//! failures (malformed CSV, unresolved conflicts) abort their unit of work.

use thiserror::Error;

/// Errors surfaced by the loader pipeline.
#[derive(Debug, Error)]
pub enum LoaderError {
    /// Bad mapping or missing key definition. Fails before any I/O.
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// CSV reader-level failure (ragged row, bad quoting). Aborts the file.
    #[error("malformed input in {file} at line {line}: {message}")]
    MalformedInput {
        file: String,
        line: u64,
        message: String,
    },

    /// A single row failed validation. The row is skipped and logged,
    /// ingestion continues.
    #[error("row {line} rejected (key {natural_key:?}): {reason}")]
    RowValidation {
        line: u64,
        natural_key: Option<String>,
        reason: String,
    },

    /// A conflict under the `manual` policy. Aborts the whole merge batch.
    #[error("unresolved conflict in {table} for key '{natural_key}' on field '{field}'")]
    UnresolvedConflict {
        table: String,
        natural_key: String,
        field: String,
    },

    /// An association whose endpoints cannot be resolved. Skipped per row.
    #[error("dangling association in {table}: ({left_key}, {right_key})")]
    DanglingAssociation {
        table: String,
        left_key: String,
        right_key: String,
    },

    #[error(transparent)]
    Store(#[from] anyhow::Error),

    #[error("database error: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl LoaderError {
    pub fn config(message: impl Into<String>) -> Self {
        LoaderError::Configuration {
            message: message.into(),
        }
    }
}
