//! CLI error type.

use fieldsync_storage::StorageError;
use fieldsync_store::StoreError;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for CLI commands.
pub type CliResult<T> = Result<T, CliError>;

/// Errors reported by CLI commands.
#[derive(Debug, Error)]
pub enum CliError {
    /// No journal file at the given path.
    #[error("no journal found at {}", .0.display())]
    NotFound(PathBuf),

    /// The store could not be opened or updated.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The journal file could not be read.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// JSON output failed.
    #[error("json output failed: {0}")]
    Json(#[from] serde_json::Error),

    /// `verify` found broken invariants.
    #[error("verification failed: {0} violation(s)")]
    Violations(usize),
}
