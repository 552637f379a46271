//! Sync engine state machine.
//!
//! ```text
//! pending -> syncing -> synced
//!                    -> failed -> syncing (scheduled retry)
//!                              -> abandoned (retry budget spent)
//!                    -> auth_failed
//! failed / abandoned / auth_failed -> pending (manual retry)
//! ```

use crate::classify::{classify, SyncError, SyncErrorKind};
use crate::config::SyncConfig;
use crate::connectivity::ConnectivityWatcher;
use crate::error::{EngineError, EngineResult};
use crate::remote::{RemoteApi, RemoteFailure, RemoteReceipt, RemoteRequest};
use crate::scheduler::RetryScheduler;
use fieldsync_store::{
    FailureUpdate, LocalStore, QueueItem, QueueItemId, QueueItemType, RecordId, StatusPatch,
    StoreError, SyncStatus,
};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;

/// Severity of a user-facing notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationLevel {
    /// Something completed.
    Info,
    /// Something failed and will be retried.
    Warning,
    /// Something needs a person.
    Error,
}

/// A message for the host application's UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    /// Severity.
    pub level: NotificationLevel,
    /// Text to show.
    pub message: String,
    /// Queue item concerned, if any.
    pub queue_item_id: Option<QueueItemId>,
    /// Type of that queue item, for routing in the host.
    pub item_type: Option<QueueItemType>,
    /// Time until the scheduled retry, for countdowns.
    pub retry_in: Option<Duration>,
}

/// Events published by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A user-facing notification.
    Notification(Notification),
    /// A queue item changed status.
    StateChange {
        /// The item.
        queue_item_id: QueueItemId,
        /// Its record.
        record_id: RecordId,
        /// Previous status.
        from: SyncStatus,
        /// New status.
        to: SyncStatus,
    },
    /// A bulk pass finished.
    SyncComplete(SyncStats),
}

/// Callbacks for hosts that prefer a trait over the event channel.
///
/// Callbacks run on a spawned task; the engine never waits for them.
pub trait SyncObserver: Send + Sync {
    /// A notification was raised.
    fn on_notification(&self, _notification: &Notification) {}

    /// A queue item changed status.
    fn on_state_change(&self, _queue_item_id: QueueItemId, _from: SyncStatus, _to: SyncStatus) {}

    /// A bulk pass finished.
    fn on_sync_complete(&self, _stats: &SyncStats) {}
}

/// Outcome of a bulk pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    /// Items accepted by the server.
    pub synced: usize,
    /// Items that failed and will be retried.
    pub failed: usize,
    /// Items that ran out of retries.
    pub abandoned: usize,
    /// Items rejected for credentials.
    pub auth_failed: usize,
    /// Items still pending, syncing or failed after the pass.
    pub pending: usize,
    /// Wall time of the pass.
    pub duration: Duration,
    /// The pass was stopped by [`SyncEngine::abort`].
    pub aborted: bool,
    /// The pass stopped at an authentication failure.
    pub stopped_on_auth: bool,
}

/// What happened to a single item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    /// Accepted by the server.
    Synced {
        /// Server id.
        server_id: String,
    },
    /// Failed; a retry is due after `retry_in`.
    Failed {
        /// Classified failure.
        error: SyncError,
        /// Counted failures so far.
        retry_count: u32,
        /// Backoff before the next attempt.
        retry_in: Duration,
    },
    /// Retry budget spent.
    Abandoned {
        /// Classified failure.
        error: SyncError,
    },
    /// Credentials rejected.
    AuthFailed {
        /// Classified failure.
        error: SyncError,
    },
    /// The item was not eligible (already synced, in flight or terminal).
    Skipped,
}

/// Why an item is being submitted. Checked once the submit lock is held.
#[derive(Debug, Clone, Copy)]
enum Trigger {
    /// An explicit call for this item.
    Direct,
    /// A bulk pass; the item must still be due.
    Pass,
    /// A retry timer; the item must be as it was when the timer was armed.
    Scheduled(RetryTicket),
}

#[derive(Debug, Clone, Copy)]
struct RetryTicket {
    epoch: u64,
    retry_count: u32,
    next_retry_at: Option<DateTime<Utc>>,
}

impl RetryTicket {
    fn matches(&self, item: &QueueItem) -> bool {
        item.status == SyncStatus::Failed
            && item.retry_count == self.retry_count
            && item.next_retry_at == self.next_retry_at
    }
}

/// Drives queue items through submission, retry and terminal outcomes.
///
/// At most one bulk pass runs at a time, and at most one remote write is in
/// flight per engine, including writes started by scheduled retries.
pub struct SyncEngine {
    store: Arc<LocalStore>,
    remote: Arc<dyn RemoteApi>,
    config: SyncConfig,
    scheduler: RetryScheduler,
    is_syncing: AtomicBool,
    aborted: AtomicBool,
    abort_epoch: AtomicU64,
    shut_down: AtomicBool,
    submit_lock: tokio::sync::Mutex<()>,
    events: broadcast::Sender<EngineEvent>,
    observer: RwLock<Option<Arc<dyn SyncObserver>>>,
    watcher: Mutex<Option<ConnectivityWatcher>>,
    this: Weak<SyncEngine>,
}

/// Clears the bulk-pass flag when the pass ends, however it ends.
struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl SyncEngine {
    /// Creates an engine over `store` submitting to `remote`.
    pub fn new(store: Arc<LocalStore>, remote: Arc<dyn RemoteApi>, config: SyncConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Arc::new_cyclic(|this| Self {
            store,
            remote,
            config,
            scheduler: RetryScheduler::new(),
            is_syncing: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            abort_epoch: AtomicU64::new(0),
            shut_down: AtomicBool::new(false),
            submit_lock: tokio::sync::Mutex::new(()),
            events,
            observer: RwLock::new(None),
            watcher: Mutex::new(None),
            this: this.clone(),
        })
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    /// The engine configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// The retry timers.
    pub fn scheduler(&self) -> &RetryScheduler {
        &self.scheduler
    }

    /// Subscribes to engine events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Installs (or replaces) the observer.
    pub fn set_observer(&self, observer: Arc<dyn SyncObserver>) {
        *self.observer.write() = Some(observer);
    }

    /// Whether a bulk pass is running.
    pub fn is_syncing(&self) -> bool {
        self.is_syncing.load(Ordering::SeqCst)
    }

    /// Items still to be synced.
    pub fn pending_count(&self) -> usize {
        self.store.pending_sync_count()
    }

    /// Submits one queue item now.
    ///
    /// Any retry armed for the item is cancelled first. Items that are not
    /// `pending` or `failed` are skipped, as is a call still waiting for the
    /// in-flight item when [`SyncEngine::abort`] runs.
    ///
    /// # Errors
    ///
    /// Only local store failures; remote failures are recorded on the item.
    /// If the outcome cannot be recorded the item is put back to `pending`
    /// before the error is returned.
    pub async fn sync_item(&self, id: QueueItemId) -> EngineResult<ItemOutcome> {
        self.submit_item(id, Trigger::Direct).await
    }

    async fn submit_item(&self, id: QueueItemId, trigger: Trigger) -> EngineResult<ItemOutcome> {
        self.ensure_running()?;
        let epoch = match trigger {
            Trigger::Scheduled(ticket) => ticket.epoch,
            Trigger::Direct | Trigger::Pass => self.epoch(),
        };

        let _submitting = self.submit_lock.lock().await;

        if self.epoch() != epoch {
            tracing::debug!(queue_item_id = %id, "aborted while waiting to submit, skipping");
            return Ok(ItemOutcome::Skipped);
        }
        let item = self
            .store
            .queue_item(id)
            .ok_or(StoreError::QueueItemNotFound(id))?;
        if let Some(reason) = self.ineligible(&item, trigger) {
            tracing::debug!(queue_item_id = %id, status = %item.status, reason, "skipping");
            return Ok(ItemOutcome::Skipped);
        }
        self.scheduler.cancel(id);

        let previous = item.status;
        let item = self
            .store
            .update_status(id, SyncStatus::Syncing, StatusPatch::new())?;
        self.state_changed(&item, previous);

        let result = match RemoteRequest::from_item(&item) {
            Ok(request) => self.submit(&request).await,
            Err(failure) => Err(failure),
        };

        let settled = match result {
            Ok(receipt) => self.on_success(&item, receipt),
            Err(failure) => self.on_failure(&item, classify(&failure), epoch),
        };
        if let Err(err) = &settled {
            self.release(id, err);
        }
        settled
    }

    fn ineligible(&self, item: &QueueItem, trigger: Trigger) -> Option<&'static str> {
        if !matches!(item.status, SyncStatus::Pending | SyncStatus::Failed) {
            return Some("not pending or failed");
        }
        match trigger {
            Trigger::Direct => None,
            Trigger::Pass => (!item.is_due(self.store.clock().now())).then_some("retry not due"),
            Trigger::Scheduled(ticket) => (!ticket.matches(item)).then_some("retry superseded"),
        }
    }

    /// Puts an item whose outcome could not be recorded back to `pending`.
    fn release(&self, id: QueueItemId, err: &EngineError) {
        let stuck = self
            .store
            .queue_item(id)
            .is_some_and(|item| item.status == SyncStatus::Syncing);
        if !stuck {
            return;
        }
        match self
            .store
            .update_status(id, SyncStatus::Pending, StatusPatch::new())
        {
            Ok(item) => {
                tracing::warn!(queue_item_id = %id, error = %err, "could not record sync outcome, item requeued");
                self.state_changed(&item, SyncStatus::Syncing);
            }
            Err(requeue) => tracing::error!(
                queue_item_id = %id,
                error = %err,
                requeue_error = %requeue,
                "could not record sync outcome, item stays syncing until reopened"
            ),
        }
    }

    async fn submit(&self, request: &RemoteRequest) -> Result<RemoteReceipt, RemoteFailure> {
        tracing::debug!(
            queue_item_id = %request.queue_item_id,
            item_type = %request.item_type,
            "submitting"
        );
        match tokio::time::timeout(self.config.request_timeout, self.remote.submit(request)).await {
            Ok(result) => result,
            Err(_) => Err(RemoteFailure::Timeout),
        }
    }

    fn on_success(&self, item: &QueueItem, receipt: RemoteReceipt) -> EngineResult<ItemOutcome> {
        let updated = self
            .store
            .mark_sync_completed(item.id, &receipt.server_id)?;
        self.state_changed(&updated, SyncStatus::Syncing);
        self.notify(
            NotificationLevel::Info,
            format!("{} synced", label(item.item_type)),
            item,
            None,
        );
        Ok(ItemOutcome::Synced {
            server_id: receipt.server_id,
        })
    }

    fn on_failure(&self, item: &QueueItem, error: SyncError, epoch: u64) -> EngineResult<ItemOutcome> {
        tracing::warn!(
            queue_item_id = %item.id,
            kind = %error.kind,
            status_code = error.status_code,
            retry_count = item.retry_count,
            "remote write failed: {}",
            error.message
        );

        if error.kind == SyncErrorKind::Auth {
            let updated = self.store.mark_sync_failed(
                item.id,
                FailureUpdate {
                    status: SyncStatus::AuthFailed,
                    retry_count: item.retry_count,
                    error: error.message.clone(),
                    next_retry_at: None,
                },
            )?;
            self.state_changed(&updated, SyncStatus::Syncing);
            self.notify(
                NotificationLevel::Error,
                format!("Sign in again to sync {}", label(item.item_type).to_lowercase()),
                item,
                None,
            );
            return Ok(ItemOutcome::AuthFailed { error });
        }

        let retry_count = item.retry_count + u32::from(error.counts_against_retry);
        if retry_count >= self.config.retry.max_retries {
            let updated = self.store.mark_sync_failed(
                item.id,
                FailureUpdate {
                    status: SyncStatus::Abandoned,
                    retry_count,
                    error: error.message.clone(),
                    next_retry_at: None,
                },
            )?;
            self.state_changed(&updated, SyncStatus::Syncing);
            self.notify(
                NotificationLevel::Error,
                format!(
                    "{} could not be synced after {retry_count} attempts: {}",
                    label(item.item_type),
                    error.message
                ),
                item,
                None,
            );
            return Ok(ItemOutcome::Abandoned { error });
        }

        let retry_in = self.config.retry.delay_for_retry(retry_count);
        let next_retry_at = retry_deadline(
            self.store.clock().now(),
            retry_in.min(self.config.retry.max_delay),
        );
        let updated = self.store.mark_sync_failed(
            item.id,
            FailureUpdate {
                status: SyncStatus::Failed,
                retry_count,
                error: error.message.clone(),
                next_retry_at: Some(next_retry_at),
            },
        )?;
        self.state_changed(&updated, SyncStatus::Syncing);

        if error.retryable {
            // an abort during the request disarms this retry too
            if self.epoch() == epoch {
                self.arm_retry(&updated, retry_in, epoch);
            }
            self.notify(
                NotificationLevel::Warning,
                format!(
                    "{} failed ({}), retrying in {}s",
                    label(item.item_type),
                    error.kind,
                    retry_in.as_secs()
                ),
                item,
                Some(retry_in),
            );
        } else {
            self.notify(
                NotificationLevel::Error,
                format!("{} failed: {}", label(item.item_type), error.message),
                item,
                None,
            );
        }

        Ok(ItemOutcome::Failed {
            error,
            retry_count,
            retry_in,
        })
    }

    fn arm_retry(&self, item: &QueueItem, delay: Duration, epoch: u64) {
        let id = item.id;
        let ticket = RetryTicket {
            epoch,
            retry_count: item.retry_count,
            next_retry_at: item.next_retry_at,
        };
        let engine = self.this.clone();
        self.scheduler.schedule(id, delay, move || async move {
            let Some(engine) = engine.upgrade() else {
                return;
            };
            if let Err(err) = engine.submit_item(id, Trigger::Scheduled(ticket)).await {
                tracing::error!(queue_item_id = %id, error = %err, "scheduled retry failed");
            }
        });
    }

    /// Submits every due item, in priority order, up to the batch size.
    ///
    /// A second call while a pass is running returns empty stats without
    /// touching the remote. The pass stops early on an authentication
    /// failure (further items would be rejected too) or on
    /// [`SyncEngine::abort`], letting the in-flight item settle.
    ///
    /// # Errors
    ///
    /// Only local store failures.
    pub async fn sync_all(&self) -> EngineResult<SyncStats> {
        self.ensure_running()?;
        let Some(_pass) = self.begin_pass() else {
            tracing::debug!("sync already in progress");
            return Ok(SyncStats::default());
        };

        let ids = self
            .store
            .pending_queue_items(self.config.batch_size)
            .into_iter()
            .map(|item| item.id)
            .collect();
        self.run_pass(ids).await
    }

    /// Resets one failed, abandoned or auth-failed item and submits it now.
    ///
    /// # Errors
    ///
    /// [`StoreError::InvalidTransition`] if the item is not in one of those
    /// statuses.
    pub async fn retry_failed(&self, id: QueueItemId) -> EngineResult<ItemOutcome> {
        self.ensure_running()?;
        self.scheduler.cancel(id);
        self.store.reset_for_retry(id)?;
        tracing::info!(queue_item_id = %id, "manual retry");
        self.sync_item(id).await
    }

    /// Resets every failed, abandoned and auth-failed item and submits them.
    ///
    /// # Errors
    ///
    /// Only local store failures.
    pub async fn retry_all_failed(&self) -> EngineResult<SyncStats> {
        self.ensure_running()?;
        let Some(_pass) = self.begin_pass() else {
            tracing::debug!("sync already in progress");
            return Ok(SyncStats::default());
        };

        let mut ids = Vec::new();
        for item in self.store.failed_items() {
            self.scheduler.cancel(item.id);
            ids.push(self.store.reset_for_retry(item.id)?.id);
        }
        tracing::info!(count = ids.len(), "manual retry of all failed items");
        self.run_pass(ids).await
    }

    fn begin_pass(&self) -> Option<PassGuard<'_>> {
        self.is_syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| PassGuard(&self.is_syncing))
    }

    async fn run_pass(&self, ids: Vec<QueueItemId>) -> EngineResult<SyncStats> {
        self.aborted.store(false, Ordering::SeqCst);
        let started = Instant::now();
        let mut stats = SyncStats::default();
        tracing::info!(items = ids.len(), "sync pass started");

        let result = self.submit_all(ids, &mut stats).await;

        stats.pending = self.store.pending_sync_count();
        stats.duration = started.elapsed();
        match &result {
            Ok(()) => tracing::info!(
                synced = stats.synced,
                failed = stats.failed,
                abandoned = stats.abandoned,
                auth_failed = stats.auth_failed,
                pending = stats.pending,
                aborted = stats.aborted,
                duration_ms = stats.duration.as_millis() as u64,
                "sync pass finished"
            ),
            Err(err) => tracing::error!(
                synced = stats.synced,
                failed = stats.failed,
                pending = stats.pending,
                error = %err,
                "sync pass stopped by a local store failure"
            ),
        }
        self.emit(EngineEvent::SyncComplete(stats.clone()));
        result.map(|()| stats)
    }

    async fn submit_all(&self, ids: Vec<QueueItemId>, stats: &mut SyncStats) -> EngineResult<()> {
        for id in ids {
            if self.aborted.load(Ordering::SeqCst) {
                stats.aborted = true;
                break;
            }
            match self.submit_item(id, Trigger::Pass).await? {
                ItemOutcome::Synced { .. } => stats.synced += 1,
                ItemOutcome::Failed { .. } => stats.failed += 1,
                ItemOutcome::Abandoned { .. } => stats.abandoned += 1,
                ItemOutcome::AuthFailed { .. } => {
                    stats.auth_failed += 1;
                    stats.stopped_on_auth = true;
                    break;
                }
                ItemOutcome::Skipped => {}
            }
        }
        Ok(())
    }

    /// Deletes synced queue items whose retention window has passed.
    ///
    /// # Errors
    ///
    /// Only local store failures.
    pub fn cleanup_synced_items(&self) -> EngineResult<usize> {
        let purged = self.store.purge_expired_queue_items()?;
        if purged > 0 {
            tracing::info!(count = purged, "purged synced queue items");
        }
        Ok(purged)
    }

    /// Re-arms retry timers for `failed` items, e.g. after a restart.
    ///
    /// Timers are not persisted but `next_retry_at` is; overdue items are
    /// armed with no delay. Returns the number of timers armed.
    pub fn resume_scheduled(&self) -> usize {
        if self.shut_down.load(Ordering::SeqCst) {
            return 0;
        }
        let now = self.store.clock().now();
        let epoch = self.epoch();
        let failed = self.store.items_by_status(SyncStatus::Failed);
        for item in &failed {
            let delay = item
                .next_retry_at
                .and_then(|at| (at - now).to_std().ok())
                .unwrap_or(Duration::ZERO);
            self.arm_retry(item, delay, epoch);
        }
        if !failed.is_empty() {
            tracing::info!(count = failed.len(), "resumed scheduled retries");
        }
        failed.len()
    }

    /// Starts syncing whenever `online` flips from false to true.
    ///
    /// Replaces any previous watcher.
    pub fn watch_connectivity(&self, online: watch::Receiver<bool>) {
        let watcher = ConnectivityWatcher::spawn(self.this.clone(), online);
        if let Some(previous) = self.watcher.lock().replace(watcher) {
            previous.stop();
        }
    }

    /// Stops the running pass after its in-flight item and disarms every
    /// scheduled retry, including ones already waiting for the in-flight
    /// item to settle.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        self.abort_epoch.fetch_add(1, Ordering::SeqCst);
        let disarmed = self.scheduler.cancel_all();
        tracing::info!(disarmed, "sync aborted");
    }

    /// Aborts and refuses further work. Stops the connectivity watcher.
    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        self.abort();
        if let Some(watcher) = self.watcher.lock().take() {
            watcher.stop();
        }
    }

    fn epoch(&self) -> u64 {
        self.abort_epoch.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> EngineResult<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            Err(EngineError::ShutDown)
        } else {
            Ok(())
        }
    }

    fn state_changed(&self, item: &QueueItem, from: SyncStatus) {
        self.emit(EngineEvent::StateChange {
            queue_item_id: item.id,
            record_id: item.record_id.clone(),
            from,
            to: item.status,
        });
    }

    fn notify(
        &self,
        level: NotificationLevel,
        message: String,
        item: &QueueItem,
        retry_in: Option<Duration>,
    ) {
        self.emit(EngineEvent::Notification(Notification {
            level,
            message,
            queue_item_id: Some(item.id),
            item_type: Some(item.item_type),
            retry_in,
        }));
    }

    fn emit(&self, event: EngineEvent) {
        let observer = self.observer.read().clone();
        if let Some(observer) = observer {
            let event = event.clone();
            let dispatch = move || match &event {
                EngineEvent::Notification(n) => observer.on_notification(n),
                EngineEvent::StateChange { queue_item_id, from, to, .. } => {
                    observer.on_state_change(*queue_item_id, *from, *to)
                }
                EngineEvent::SyncComplete(stats) => observer.on_sync_complete(stats),
            };
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move { dispatch() });
                }
                Err(_) => dispatch(),
            }
        }
        // no receivers is fine
        let _ = self.events.send(event);
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.get_mut().take() {
            watcher.stop();
        }
    }
}

/// `now + delay`, saturating at the latest representable time.
fn retry_deadline(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn label(item_type: QueueItemType) -> &'static str {
    match item_type {
        QueueItemType::FormSubmission => "Form",
        QueueItemType::FormUpdate => "Form update",
        QueueItemType::PhotoUpload => "Photo",
        QueueItemType::Evidence => "Evidence",
    }
}
