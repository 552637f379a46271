//! Reset command implementation.

use crate::commands::open_store;
use crate::error::CliResult;
use fieldsync_store::{QueueItem, QueueItemId};
use std::path::Path;

/// Items to reset.
#[derive(Debug, Clone, Copy)]
pub enum Target {
    /// A single queue item.
    One(u64),
    /// Every failed, abandoned or auth-failed item.
    All,
}

/// Puts the targeted items back to `pending`, returning them.
pub fn reset(path: &Path, target: Target) -> CliResult<Vec<QueueItem>> {
    let store = open_store(path)?;
    let ids: Vec<QueueItemId> = match target {
        Target::One(id) => vec![QueueItemId::new(id)],
        Target::All => store.failed_items().into_iter().map(|item| item.id).collect(),
    };

    let mut reset = Vec::with_capacity(ids.len());
    for id in ids {
        reset.push(store.reset_for_retry(id)?);
    }
    Ok(reset)
}

/// Runs the reset command.
pub fn run(path: &Path, target: Target) -> CliResult<()> {
    let items = reset(path, target)?;
    if items.is_empty() {
        println!("Nothing to reset.");
    }
    for item in &items {
        println!("Queue item {} ({}) is pending again", item.id, item.item_type);
    }
    Ok(())
}
