//! Error types for the sync engine.

use fieldsync_store::StoreError;
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced to callers of the engine.
///
/// Remote failures are not errors at this level: they are classified and
/// recorded on the queue item. Only local storage problems and misuse
/// reach the caller.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The local store failed or rejected the operation.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The engine was shut down.
    #[error("sync engine is shut down")]
    ShutDown,
}

impl EngineError {
    /// Returns true if repeating the call later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            EngineError::Store(err) => err.is_transient(),
            EngineError::ShutDown => false,
        }
    }
}
