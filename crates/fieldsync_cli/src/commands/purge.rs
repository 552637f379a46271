//! Purge command implementation.

use crate::commands::open_store;
use crate::error::CliResult;
use serde::Serialize;
use std::path::Path;

/// Rows removed by a purge.
#[derive(Debug, Default, PartialEq, Eq, Serialize)]
pub struct PurgeResult {
    /// Synced records removed.
    pub records: usize,
    /// Queue items removed with those records.
    pub record_items: usize,
    /// Synced queue items removed past their retention.
    pub expired_items: usize,
}

/// Removes synced records older than `days` and expired queue items.
pub fn purge(path: &Path, days: u32) -> CliResult<PurgeResult> {
    let store = open_store(path)?;
    let cleared = store.clear_synced_data(days)?;
    let expired = store.purge_expired_queue_items()?;
    Ok(PurgeResult {
        records: cleared.records,
        record_items: cleared.queue_items,
        expired_items: expired,
    })
}

/// Runs the purge command.
pub fn run(path: &Path, days: u32) -> CliResult<()> {
    let result = purge(path, days)?;
    println!(
        "Removed {} synced record(s) older than {days} day(s) with {} queue item(s)",
        result.records, result.record_items
    );
    println!("Removed {} expired queue item(s)", result.expired_items);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testing::sample_journal;

    #[test]
    fn nothing_to_purge_in_a_fresh_queue() {
        let (_dir, path) = sample_journal();
        assert_eq!(purge(&path, 0).unwrap(), PurgeResult::default());
    }

    #[test]
    fn expired_synced_item_is_removed() {
        let (_dir, path) = sample_journal();
        {
            let store = fieldsync_store::LocalStore::open_file(
                &path,
                fieldsync_store::StoreConfig::default()
                    .with_synced_retention(chrono::Duration::zero()),
            )
            .unwrap();
            let id = fieldsync_store::QueueItemId::new(1);
            store
                .update_status(
                    id,
                    fieldsync_store::SyncStatus::Syncing,
                    fieldsync_store::StatusPatch::new(),
                )
                .unwrap();
            store.mark_sync_completed(id, "srv-1").unwrap();
        }

        let result = purge(&path, 30).unwrap();
        assert_eq!(result.expired_items, 1);
        assert_eq!(result.records, 0);
        assert_eq!(crate::commands::inspect::inspect(&path).unwrap().records, 3);
    }
}
