//! Connectivity-triggered sync.

use crate::engine::SyncEngine;
use std::sync::Weak;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Runs [`SyncEngine::sync_all`] on every offline to online edge of a
/// `watch` channel.
///
/// The watcher holds only a weak reference; it ends when the engine is
/// dropped, the sender is dropped, or [`ConnectivityWatcher::stop`] is called.
#[derive(Debug)]
pub struct ConnectivityWatcher {
    handle: JoinHandle<()>,
}

impl ConnectivityWatcher {
    /// Spawns the watcher task. Must be called within a tokio runtime.
    pub fn spawn(engine: Weak<SyncEngine>, mut online: watch::Receiver<bool>) -> Self {
        let handle = tokio::spawn(async move {
            let mut was_online = *online.borrow_and_update();
            while online.changed().await.is_ok() {
                let is_online = *online.borrow_and_update();
                if is_online && !was_online {
                    let Some(engine) = engine.upgrade() else {
                        break;
                    };
                    tracing::info!("connectivity restored, starting sync");
                    if let Err(err) = engine.sync_all().await {
                        tracing::error!(error = %err, "sync after reconnect failed");
                    }
                } else if !is_online && was_online {
                    tracing::info!("connectivity lost");
                }
                was_online = is_online;
            }
            tracing::debug!("connectivity watcher stopped");
        });
        Self { handle }
    }

    /// Stops watching.
    pub fn stop(&self) {
        self.handle.abort();
    }

    /// Whether the watcher task is still running.
    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}
