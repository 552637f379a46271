//! Consistency checks over the loaded tables.

use crate::model::{QueueItemId, RecordId, SyncStatus};
use crate::tables::Tables;
use std::fmt;

/// A broken invariant found by [`LocalStore::verify`](crate::LocalStore::verify).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    /// A queue item points at a record that does not exist.
    OrphanedQueueItem {
        /// The item.
        item: QueueItemId,
        /// The missing record.
        record: RecordId,
    },
    /// A record's status differs from its most recent queue item's.
    StatusMismatch {
        /// The record.
        record: RecordId,
        /// Status on the record.
        record_status: SyncStatus,
        /// Status on its latest item.
        item_status: SyncStatus,
    },
    /// A record has more than one pending, syncing or failed item.
    MultipleActiveItems {
        /// The record.
        record: RecordId,
        /// Number of active items.
        count: usize,
    },
    /// A non-draft record has no queue item although it was never synced.
    MissingQueueItem {
        /// The record.
        record: RecordId,
        /// Its status.
        status: SyncStatus,
    },
    /// A draft record has queue items.
    DraftWithQueueItem {
        /// The record.
        record: RecordId,
    },
    /// A secondary index does not match the rows.
    Index(String),
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OrphanedQueueItem { item, record } => {
                write!(f, "queue item {item} references missing record {record}")
            }
            Self::StatusMismatch {
                record,
                record_status,
                item_status,
            } => write!(
                f,
                "record {record} is {record_status} but its latest queue item is {item_status}"
            ),
            Self::MultipleActiveItems { record, count } => {
                write!(f, "record {record} has {count} active queue items")
            }
            Self::MissingQueueItem { record, status } => {
                write!(f, "record {record} is {status} but has no queue item")
            }
            Self::DraftWithQueueItem { record } => {
                write!(f, "draft record {record} has queue items")
            }
            Self::Index(message) => f.write_str(message),
        }
    }
}

pub(crate) fn check(tables: &Tables) -> Vec<Violation> {
    let mut violations = Vec::new();

    for item in tables.queue_items() {
        if tables.record(&item.record_id).is_none() {
            violations.push(Violation::OrphanedQueueItem {
                item: item.id,
                record: item.record_id.clone(),
            });
        }
    }

    for record in tables.records() {
        let items = tables.items_for_record(&record.id);

        if record.status == SyncStatus::Draft {
            if !items.is_empty() {
                violations.push(Violation::DraftWithQueueItem {
                    record: record.id.clone(),
                });
            }
            continue;
        }

        let active = items.iter().filter(|i| i.status.is_active()).count();
        if active > 1 {
            violations.push(Violation::MultipleActiveItems {
                record: record.id.clone(),
                count: active,
            });
        }

        match items.last() {
            Some(latest) if latest.status != record.status => {
                violations.push(Violation::StatusMismatch {
                    record: record.id.clone(),
                    record_status: record.status,
                    item_status: latest.status,
                });
            }
            Some(_) => {}
            // synced items are purged after the retention window
            None if record.status == SyncStatus::Synced => {}
            None => violations.push(Violation::MissingQueueItem {
                record: record.id.clone(),
                status: record.status,
            }),
        }
    }

    violations.extend(tables.index_mismatches().into_iter().map(Violation::Index));
    violations
}
