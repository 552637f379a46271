//! Feed of committed queue status changes.
//!
//! Every commit that changes a queue item's status emits one
//! [`StatusChange`] per item, after the journal write succeeded. Dashboards
//! and the sync engine's observers consume it; a dropped receiver is
//! pruned on the next emit.

use crate::model::{QueueItemId, RecordId, SyncStatus};
use parking_lot::RwLock;
use std::sync::mpsc::{self, Receiver, Sender};

/// A queue item moved between statuses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    /// Commit sequence that made the change.
    pub sequence: u64,
    /// Queue item affected.
    pub queue_item_id: QueueItemId,
    /// Owning record.
    pub record_id: RecordId,
    /// Status before the commit; `None` for a new item.
    pub from: Option<SyncStatus>,
    /// Status after the commit; `None` for a deleted item.
    pub to: Option<SyncStatus>,
}

/// Distributes [`StatusChange`] events to subscribers.
#[derive(Debug, Default)]
pub struct StatusFeed {
    subscribers: RwLock<Vec<Sender<StatusChange>>>,
}

impl StatusFeed {
    /// Creates a feed with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a receiver for all future changes.
    pub fn subscribe(&self) -> Receiver<StatusChange> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.write().push(tx);
        rx
    }

    /// Sends the changes of one commit, in order.
    pub(crate) fn emit_batch(&self, changes: &[StatusChange]) {
        if changes.is_empty() {
            return;
        }
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|tx| changes.iter().all(|change| tx.send(change.clone()).is_ok()));
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}
