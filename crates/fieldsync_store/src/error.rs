//! Error types for the local store.

use crate::model::{QueueItemId, RecordId, SyncStatus};
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by [`crate::LocalStore`].
///
/// Every write either commits as a whole or fails with one of these and
/// leaves the store exactly as it was.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The storage backend failed; the transaction did not commit.
    #[error("storage error: {0}")]
    Storage(#[from] fieldsync_storage::StorageError),

    /// A journal entry or payload could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// The journal contains an entry that is well-framed but unreadable.
    #[error("journal corrupted at offset {offset}: {message}")]
    Corrupted {
        /// Offset of the offending entry.
        offset: u64,
        /// What was wrong with it.
        message: String,
    },

    /// No record with this id exists.
    #[error("record not found: {0}")]
    RecordNotFound(RecordId),

    /// No queue item with this id exists.
    #[error("queue item not found: {0}")]
    QueueItemNotFound(QueueItemId),

    /// The record has a queue item currently being submitted.
    #[error("record {0} is being synced")]
    RecordBusy(RecordId),

    /// The requested status change is not part of the sync state machine.
    #[error("invalid status transition for queue item {id}: {from} -> {to}")]
    InvalidTransition {
        /// Queue item id.
        id: QueueItemId,
        /// Current status.
        from: SyncStatus,
        /// Requested status.
        to: SyncStatus,
    },

    /// Priorities run from 1 (highest) to 5 (lowest).
    #[error("priority {0} out of range 1..=5")]
    InvalidPriority(u8),

    /// The operation only applies to drafts.
    #[error("record {0} is not a draft")]
    NotADraft(RecordId),

    /// Evidence records cannot be edited after capture.
    #[error("record {0} does not accept updates")]
    UpdateNotSupported(RecordId),
}

impl StoreError {
    /// Creates a codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec(message.into())
    }

    /// Creates a corruption error.
    pub fn corrupted(offset: u64, message: impl Into<String>) -> Self {
        Self::Corrupted {
            offset,
            message: message.into(),
        }
    }

    /// True if retrying the whole operation may succeed.
    ///
    /// Only backend failures are transient; everything else is a caller
    /// or data problem.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::RecordBusy(_))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec(err.to_string())
    }
}
