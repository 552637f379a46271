//! Configuration for the local store.

use crate::model::Priority;
use chrono::Duration;

/// Tunables for [`crate::LocalStore`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Priority given to queue items created without an explicit one.
    pub default_priority: Priority,
    /// How long a synced queue item is kept before garbage collection.
    pub synced_retention: Duration,
    /// Call `sync` (not just `flush`) on the backend after every commit.
    pub sync_on_commit: bool,
}

impl StoreConfig {
    /// Creates the default configuration: priority 3, 24h retention,
    /// flush-only commits.
    pub fn new() -> Self {
        Self {
            default_priority: Priority::DEFAULT,
            synced_retention: Duration::hours(24),
            sync_on_commit: false,
        }
    }

    /// Sets the default priority.
    pub fn with_default_priority(mut self, priority: Priority) -> Self {
        self.default_priority = priority;
        self
    }

    /// Sets the retention window for synced queue items.
    pub fn with_synced_retention(mut self, retention: Duration) -> Self {
        self.synced_retention = retention;
        self
    }

    /// Enables or disables `sync` after each commit.
    pub fn with_sync_on_commit(mut self, sync: bool) -> Self {
        self.sync_on_commit = sync;
        self
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::new()
    }
}
