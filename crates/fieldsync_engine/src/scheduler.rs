//! Deferred retries, one timer per queue item.

use crate::config::RetryConfig;
use fieldsync_store::QueueItemId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Backoff before the retry that follows `retry_count` counted failures:
/// `2^(retry_count + 1)` seconds.
pub fn backoff_delay(retry_count: u32) -> Duration {
    RetryConfig::default().delay_for_retry(retry_count)
}

#[derive(Debug)]
struct Armed {
    generation: u64,
    handle: JoinHandle<()>,
}

/// Arms one-shot tokio timers keyed by queue item.
///
/// Every arm gets a fresh generation number. When a timer fires it runs its
/// task only if its generation is still the one in the map, and removes the
/// entry under the same lock. Cancelling removes the entry, so a timer that
/// was cancelled (or replaced) can never run, even if it already woke up.
#[derive(Debug, Default)]
pub struct RetryScheduler {
    armed: Arc<Mutex<HashMap<QueueItemId, Armed>>>,
    generation: AtomicU64,
}

impl RetryScheduler {
    /// Creates an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `task` after `delay`, replacing any timer armed for `id`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule<F, Fut>(&self, id: QueueItemId, delay: Duration, task: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let armed = Arc::clone(&self.armed);

        let mut map = self.armed.lock();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let current = {
                let mut map = armed.lock();
                match map.get(&id) {
                    Some(entry) if entry.generation == generation => map.remove(&id).is_some(),
                    _ => false,
                }
            };
            if current {
                task().await;
            }
        });

        if let Some(previous) = map.insert(id, Armed { generation, handle }) {
            previous.handle.abort();
        }
        tracing::debug!(queue_item_id = %id, delay_ms = delay.as_millis() as u64, "retry armed");
    }

    /// Disarms the timer for `id`. Returns whether one was armed.
    pub fn cancel(&self, id: QueueItemId) -> bool {
        match self.armed.lock().remove(&id) {
            Some(entry) => {
                entry.handle.abort();
                tracing::debug!(queue_item_id = %id, "retry cancelled");
                true
            }
            None => false,
        }
    }

    /// Disarms every timer. Returns how many were armed.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<Armed> = self.armed.lock().drain().map(|(_, entry)| entry).collect();
        for entry in &drained {
            entry.handle.abort();
        }
        drained.len()
    }

    /// Whether a timer is armed for `id`.
    pub fn is_armed(&self, id: QueueItemId) -> bool {
        self.armed.lock().contains_key(&id)
    }

    /// Number of armed timers.
    pub fn armed_count(&self) -> usize {
        self.armed.lock().len()
    }
}

impl Drop for RetryScheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
