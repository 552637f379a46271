//! # FieldSync Store
//!
//! Local persistent store for offline field records and their sync queue.
//!
//! This crate provides:
//! - Source records (forms and evidence) with drafts and edits
//! - The sync queue, one item per pending remote write
//! - An append-only journal giving atomic multi-row commits
//! - Secondary indexes by tenant/status, status/priority and record
//! - A feed of committed queue status changes
//!
//! ## Key Invariants
//!
//! - A record's status equals the status of its most recent queue item
//! - A record has at most one pending, syncing or failed queue item
//! - A record and its queue item are always written in the same commit
//! - A failed commit leaves no trace, on disk or in memory
//!
//! ## Example
//!
//! ```rust
//! use fieldsync_store::{LocalStore, NewForm, SyncStatus};
//!
//! let store = LocalStore::open_in_memory().unwrap();
//! let id = store
//!     .create_form(NewForm::new("tenant-a", serde_json::json!({"site": "north"})))
//!     .unwrap();
//!
//! assert_eq!(store.record(&id).unwrap().status, SyncStatus::Pending);
//! assert_eq!(store.pending_queue_items(10).len(), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod clock;
mod config;
mod error;
mod feed;
pub mod journal;
mod model;
mod store;
mod tables;
mod transaction;
mod verify;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::StoreConfig;
pub use error::{StoreError, StoreResult};
pub use feed::{StatusChange, StatusFeed};
pub use model::{
    Attachment, FailureUpdate, NewEvidence, NewForm, Priority, PurgeCounts, QueueItem,
    QueueItemId, QueueItemType, QueuePayload, RecordId, RecordKind, SourceRecord, StatusPatch,
    SyncStatus,
};
pub use store::LocalStore;
pub use verify::Violation;
