//! The local store: records, the sync queue and their transactions.

use crate::clock::{Clock, SystemClock};
use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::feed::{StatusChange, StatusFeed};
use crate::journal::{Journal, JournalEntry, Mutation};
use crate::model::{
    Attachment, FailureUpdate, NewEvidence, NewForm, Priority, PurgeCounts, QueueItem,
    QueueItemId, QueueItemType, QueuePayload, RecordId, RecordKind, SourceRecord, StatusPatch,
    SyncStatus,
};
use crate::tables::Tables;
use crate::transaction::{submission_type, Transaction};
use crate::verify::{self, Violation};
use chrono::{DateTime, Duration, Utc};
use fieldsync_storage::{FileBackend, InMemoryBackend, StorageBackend};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::mpsc::Receiver;
use std::sync::Arc;

/// Durable, transactional storage for source records and their queue items.
///
/// All writes go through a single-writer transaction: the tables' write lock
/// is held while the change is staged, journaled and applied, so readers see
/// either the whole commit or none of it. A [`QueueItem`] and its
/// [`SourceRecord`] are always written in the same commit.
///
/// The store does no network I/O.
pub struct LocalStore {
    config: StoreConfig,
    clock: Arc<dyn Clock>,
    journal: Journal,
    tables: RwLock<Tables>,
    feed: StatusFeed,
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("config", &self.config)
            .field("sequence", &self.tables.read().sequence())
            .finish_non_exhaustive()
    }
}

impl LocalStore {
    /// Opens a store on `backend`, replaying its journal.
    ///
    /// Items left `syncing` by an interrupted process are put back to
    /// `pending`; the remote write is at-least-once, so sending them again
    /// is safe.
    ///
    /// # Errors
    ///
    /// Fails if the journal is corrupted or the backend cannot be read.
    pub fn open(
        backend: Box<dyn StorageBackend>,
        config: StoreConfig,
        clock: Arc<dyn Clock>,
    ) -> StoreResult<Self> {
        let journal = Journal::new(backend, config.sync_on_commit);
        let mut tables = Tables::default();
        let entries = journal.recover()?;
        let replayed = entries.len();
        for entry in entries {
            tables.set_sequence(entry.sequence);
            for mutation in entry.mutations {
                tables.apply(mutation);
            }
        }
        tracing::debug!(entries = replayed, sequence = tables.sequence(), "journal replayed");

        let store = Self {
            config,
            clock,
            journal,
            tables: RwLock::new(tables),
            feed: StatusFeed::new(),
        };

        let recovered = store.recover_interrupted()?;
        if recovered > 0 {
            tracing::warn!(count = recovered, "requeued items interrupted mid-sync");
        }
        Ok(store)
    }

    /// Opens an empty, non-persistent store with default settings.
    ///
    /// # Errors
    ///
    /// Infallible in practice; kept fallible for symmetry with [`LocalStore::open`].
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::open(
            Box::new(InMemoryBackend::new()),
            StoreConfig::default(),
            Arc::new(SystemClock),
        )
    }

    /// Opens (or creates) a journal file at `path`.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be opened or its journal is corrupted.
    pub fn open_file(path: &Path, config: StoreConfig) -> StoreResult<Self> {
        let backend = FileBackend::open_with_create_dirs(path)?;
        Self::open(Box::new(backend), config, Arc::new(SystemClock))
    }

    /// The store's configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// The clock used for every timestamp.
    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    /// Subscribes to committed status changes.
    pub fn subscribe(&self) -> Receiver<StatusChange> {
        self.feed.subscribe()
    }

    /// Sequence number of the last commit.
    pub fn sequence(&self) -> u64 {
        self.tables.read().sequence()
    }

    /// Size of the journal in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot report its size.
    pub fn journal_size(&self) -> StoreResult<u64> {
        self.journal.size()
    }

    fn write<T>(&self, f: impl FnOnce(&mut Transaction<'_>) -> StoreResult<T>) -> StoreResult<T> {
        let mut tables = self.tables.write();
        let now = self.clock.now();

        let mut tx = Transaction::new(&tables, now);
        let out = f(&mut tx)?;
        let mutations = tx.into_mutations();
        if mutations.is_empty() {
            return Ok(out);
        }

        let sequence = tables.sequence() + 1;
        let changes = status_changes(&tables, &mutations, sequence);
        let entry = JournalEntry {
            sequence,
            mutations,
        };
        self.journal.append(&entry)?;

        for mutation in entry.mutations {
            tables.apply(mutation);
        }
        tables.set_sequence(sequence);
        drop(tables);

        for change in &changes {
            tracing::info!(
                queue_item_id = %change.queue_item_id,
                record_id = %change.record_id,
                from = status_name(change.from),
                to = status_name(change.to),
                "queue item status changed"
            );
        }
        self.feed.emit_batch(&changes);
        Ok(out)
    }

    // ---- record creation and editing -------------------------------------------------

    /// Creates a form and its `form_submission` queue item in one commit.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Storage`] if the commit could not be written;
    /// nothing is stored in that case and the caller may retry.
    pub fn create_form(&self, form: NewForm) -> StoreResult<RecordId> {
        let priority = form.priority.unwrap_or(self.config.default_priority);
        self.write(|tx| {
            let record = new_record(
                RecordKind::Form,
                form.tenant_id,
                form.worker_id,
                form.payload,
                None,
                SyncStatus::Pending,
                tx.now(),
            );
            let item = tx.new_queue_item(&record, QueueItemType::FormSubmission, priority)?;
            let id = record.id.clone();
            tx.put_record(record);
            tx.put_queue_item(item);
            Ok(id)
        })
    }

    /// Creates an evidence record and its queue item in one commit.
    ///
    /// Evidence with an attachment is queued as `photo_upload`, otherwise
    /// as `evidence`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Storage`] if the commit could not be written.
    pub fn create_evidence(&self, evidence: NewEvidence) -> StoreResult<RecordId> {
        let priority = evidence.priority.unwrap_or(self.config.default_priority);
        self.write(|tx| {
            let record = new_record(
                RecordKind::Evidence,
                evidence.tenant_id,
                evidence.worker_id,
                evidence.payload,
                evidence.attachment,
                SyncStatus::Pending,
                tx.now(),
            );
            let item = tx.new_queue_item(&record, submission_type(&record), priority)?;
            let id = record.id.clone();
            tx.put_record(record);
            tx.put_queue_item(item);
            Ok(id)
        })
    }

    /// Saves a form as a draft. Drafts have no queue item.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Storage`] if the commit could not be written.
    pub fn save_form_draft(&self, form: NewForm) -> StoreResult<RecordId> {
        self.write(|tx| {
            let record = new_record(
                RecordKind::Form,
                form.tenant_id,
                form.worker_id,
                form.payload,
                None,
                SyncStatus::Draft,
                tx.now(),
            );
            let id = record.id.clone();
            tx.put_record(record);
            Ok(id)
        })
    }

    /// Finalizes a draft, attaching a pending queue item to it.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotADraft`] if the record was already finalized.
    pub fn finalize_draft(
        &self,
        record_id: &RecordId,
        priority: Option<Priority>,
    ) -> StoreResult<QueueItemId> {
        let priority = priority.unwrap_or(self.config.default_priority);
        self.write(|tx| {
            let mut record = tx.record(record_id)?;
            if record.status != SyncStatus::Draft {
                return Err(StoreError::NotADraft(record_id.clone()));
            }
            record.status = SyncStatus::Pending;
            record.updated_at = tx.now();

            let item = tx.new_queue_item(&record, submission_type(&record), priority)?;
            let id = item.id;
            tx.put_record(record);
            tx.put_queue_item(item);
            Ok(id)
        })
    }

    /// Records an edit to a form.
    ///
    /// - draft: the draft content is replaced, no queue item is involved
    /// - pending or failed item: its payload is replaced in place
    /// - abandoned or auth-failed item: payload replaced and the item is
    ///   reset to `pending`, the edit counting as the manual intervention
    /// - synced (or no item left): a new item is queued, `form_update` when
    ///   the server already holds the form
    ///
    /// Returns the queue item carrying the edit, if any.
    ///
    /// # Errors
    ///
    /// [`StoreError::RecordBusy`] while the form is being submitted;
    /// [`StoreError::UpdateNotSupported`] for evidence.
    pub fn update_form(
        &self,
        record_id: &RecordId,
        payload: serde_json::Value,
    ) -> StoreResult<Option<QueueItemId>> {
        let default_priority = self.config.default_priority;
        self.write(|tx| {
            let mut record = tx.record(record_id)?;
            if record.kind != RecordKind::Form {
                return Err(StoreError::UpdateNotSupported(record_id.clone()));
            }
            record.payload = payload;
            record.updated_at = tx.now();

            if record.status == SyncStatus::Draft {
                tx.put_record(record);
                return Ok(None);
            }

            let latest = tx.tables().latest_item(record_id).cloned();
            let item = match latest {
                Some(item) if item.status == SyncStatus::Syncing => {
                    return Err(StoreError::RecordBusy(record_id.clone()));
                }
                Some(mut item) if item.status != SyncStatus::Synced => {
                    item.payload = serde_json::to_string(&QueuePayload::for_record(&record))?;
                    if item.status.is_terminal() {
                        item.status = SyncStatus::Pending;
                        item.retry_count = 0;
                        item.last_error = None;
                        item.next_retry_at = None;
                        record.last_error = None;
                    }
                    item.updated_at = tx.now();
                    item
                }
                previous => {
                    let item_type = if record.server_id.is_some() {
                        QueueItemType::FormUpdate
                    } else {
                        QueueItemType::FormSubmission
                    };
                    let priority = previous.map_or(default_priority, |p| p.priority);
                    record.last_error = None;
                    tx.new_queue_item(&record, item_type, priority)?
                }
            };

            record.status = item.status;
            let id = item.id;
            tx.put_record(record);
            tx.put_queue_item(item);
            Ok(Some(id))
        })
    }

    /// Deletes a record and all of its queue items at the user's request.
    ///
    /// Returns the number of queue items removed.
    ///
    /// # Errors
    ///
    /// [`StoreError::RecordBusy`] while an item of the record is syncing.
    pub fn discard(&self, record_id: &RecordId) -> StoreResult<usize> {
        self.write(|tx| {
            tx.record(record_id)?;
            let items: Vec<QueueItem> = tx
                .tables()
                .items_for_record(record_id)
                .into_iter()
                .cloned()
                .collect();
            if items.iter().any(|i| i.status == SyncStatus::Syncing) {
                return Err(StoreError::RecordBusy(record_id.clone()));
            }
            for item in &items {
                tx.delete_queue_item(item.id);
            }
            tx.delete_record(record_id.clone());
            tracing::info!(record_id = %record_id, queue_items = items.len(), "record discarded");
            Ok(items.len())
        })
    }

    // ---- queue transitions -------------------------------------------------------------

    /// Moves a queue item to `new_status`, applying `patch`, and mirrors the
    /// status onto its record.
    ///
    /// Entering `syncing` stamps `last_retry_at` and counts an attempt on
    /// the record.
    ///
    /// # Errors
    ///
    /// [`StoreError::InvalidTransition`] if the move is not an edge of the
    /// sync state machine.
    pub fn update_status(
        &self,
        id: QueueItemId,
        new_status: SyncStatus,
        patch: StatusPatch,
    ) -> StoreResult<QueueItem> {
        self.write(|tx| {
            let mut item = tx.queue_item(id)?;
            check_transition(&item, new_status)?;
            let mut record = tx.record(&item.record_id)?;
            let now = tx.now();

            item.status = new_status;
            item.updated_at = now;
            if let Some(count) = patch.retry_count {
                item.retry_count = count;
            }
            if let Some(error) = patch.last_error {
                item.last_error = error.clone();
                record.last_error = error;
            }
            if let Some(at) = patch.next_retry_at {
                item.next_retry_at = at;
            }
            if new_status == SyncStatus::Syncing {
                item.last_retry_at = Some(now);
                record.attempts += 1;
            }

            record.status = new_status;
            record.updated_at = now;
            tx.put_record(record);
            tx.put_queue_item(item.clone());
            Ok(item)
        })
    }

    /// Records a successful submission on the item and its record.
    ///
    /// The item becomes eligible for garbage collection after the configured
    /// retention window.
    ///
    /// # Errors
    ///
    /// [`StoreError::InvalidTransition`] unless the item is `syncing`.
    pub fn mark_sync_completed(&self, id: QueueItemId, server_id: &str) -> StoreResult<QueueItem> {
        let retention = self.config.synced_retention;
        self.write(|tx| {
            let mut item = tx.queue_item(id)?;
            check_transition(&item, SyncStatus::Synced)?;
            let mut record = tx.record(&item.record_id)?;
            let now = tx.now();

            item.status = SyncStatus::Synced;
            item.server_id = Some(server_id.to_string());
            item.last_error = None;
            item.next_retry_at = None;
            item.delete_after = Some(now + retention);
            item.updated_at = now;

            record.status = SyncStatus::Synced;
            record.server_id = Some(server_id.to_string());
            record.last_error = None;
            record.updated_at = now;

            tx.put_record(record);
            tx.put_queue_item(item.clone());
            Ok(item)
        })
    }

    /// Records a failed submission on the item and its record.
    ///
    /// # Errors
    ///
    /// [`StoreError::InvalidTransition`] if `failure.status` is not a
    /// failure status or not reachable from the item's current status.
    pub fn mark_sync_failed(&self, id: QueueItemId, failure: FailureUpdate) -> StoreResult<QueueItem> {
        self.write(|tx| {
            let mut item = tx.queue_item(id)?;
            if !matches!(
                failure.status,
                SyncStatus::Failed | SyncStatus::Abandoned | SyncStatus::AuthFailed
            ) {
                return Err(StoreError::InvalidTransition {
                    id,
                    from: item.status,
                    to: failure.status,
                });
            }
            check_transition(&item, failure.status)?;
            let mut record = tx.record(&item.record_id)?;
            let now = tx.now();

            item.status = failure.status;
            item.retry_count = failure.retry_count;
            item.last_error = Some(failure.error.clone());
            item.next_retry_at = failure.next_retry_at;
            item.updated_at = now;

            record.status = failure.status;
            record.last_error = Some(failure.error);
            record.updated_at = now;

            tx.put_record(record);
            tx.put_queue_item(item.clone());
            Ok(item)
        })
    }

    /// Resets a failed, abandoned or auth-failed item for a manual retry:
    /// retry count zero, error and schedule cleared, status `pending`.
    ///
    /// # Errors
    ///
    /// [`StoreError::InvalidTransition`] for any other status.
    pub fn reset_for_retry(&self, id: QueueItemId) -> StoreResult<QueueItem> {
        self.write(|tx| {
            let mut item = tx.queue_item(id)?;
            if !item.status.is_retryable_manually() {
                return Err(StoreError::InvalidTransition {
                    id,
                    from: item.status,
                    to: SyncStatus::Pending,
                });
            }
            let mut record = tx.record(&item.record_id)?;
            let now = tx.now();

            item.status = SyncStatus::Pending;
            item.retry_count = 0;
            item.last_error = None;
            item.next_retry_at = None;
            item.updated_at = now;

            record.status = SyncStatus::Pending;
            record.last_error = None;
            record.updated_at = now;

            tx.put_record(record);
            tx.put_queue_item(item.clone());
            Ok(item)
        })
    }

    /// Returns items stuck in `syncing` to `pending`. Run on open.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Storage`] if the commit could not be written.
    pub fn recover_interrupted(&self) -> StoreResult<usize> {
        self.write(|tx| {
            let stuck: Vec<QueueItem> = tx
                .tables()
                .items_with_status(SyncStatus::Syncing)
                .cloned()
                .collect();
            for mut item in stuck.iter().cloned() {
                let mut record = tx.record(&item.record_id)?;
                item.status = SyncStatus::Pending;
                item.updated_at = tx.now();
                record.status = SyncStatus::Pending;
                record.updated_at = tx.now();
                tx.put_record(record);
                tx.put_queue_item(item);
            }
            Ok(stuck.len())
        })
    }

    // ---- garbage collection ------------------------------------------------------------

    /// Deletes synced records, with their queue items, last updated more
    /// than `days_old` days ago.
    ///
    /// Records in any other status are never touched, including abandoned
    /// and auth-failed ones, which wait for a person.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Storage`] if the commit could not be written.
    pub fn clear_synced_data(&self, days_old: u32) -> StoreResult<PurgeCounts> {
        self.write(|tx| {
            let cutoff = tx.now() - Duration::days(i64::from(days_old));
            let mut counts = PurgeCounts::default();

            let stale: Vec<RecordId> = tx
                .tables()
                .records()
                .filter(|r| r.status == SyncStatus::Synced && r.updated_at < cutoff)
                .map(|r| r.id.clone())
                .collect();

            for record_id in stale {
                let items = tx.tables().items_for_record(&record_id);
                if items.iter().any(|i| !i.status.is_terminal()) {
                    continue;
                }
                let ids: Vec<QueueItemId> = items.iter().map(|i| i.id).collect();
                for id in ids {
                    tx.delete_queue_item(id);
                    counts.queue_items += 1;
                }
                tx.delete_record(record_id);
                counts.records += 1;
            }

            tracing::info!(
                days_old,
                records = counts.records,
                queue_items = counts.queue_items,
                "cleared synced data"
            );
            Ok(counts)
        })
    }

    /// Deletes synced queue items whose `delete_after` has passed.
    /// Their records stay.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Storage`] if the commit could not be written.
    pub fn purge_expired_queue_items(&self) -> StoreResult<usize> {
        self.write(|tx| {
            let now = tx.now();
            let expired: Vec<QueueItemId> = tx
                .tables()
                .items_with_status(SyncStatus::Synced)
                .filter(|i| i.delete_after.is_some_and(|at| at <= now))
                .map(|i| i.id)
                .collect();
            for id in &expired {
                tx.delete_queue_item(*id);
            }
            Ok(expired.len())
        })
    }

    // ---- reads -------------------------------------------------------------------------

    /// Looks up a record.
    pub fn record(&self, id: &RecordId) -> Option<SourceRecord> {
        self.tables.read().record(id).cloned()
    }

    /// Looks up a queue item.
    pub fn queue_item(&self, id: QueueItemId) -> Option<QueueItem> {
        self.tables.read().queue_item(id).cloned()
    }

    /// All queue items of a record, oldest first.
    pub fn queue_items_for_record(&self, record_id: &RecordId) -> Vec<QueueItem> {
        self.tables
            .read()
            .items_for_record(record_id)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Records of a tenant, optionally filtered by status.
    pub fn records_by_tenant(&self, tenant_id: &str, status: Option<SyncStatus>) -> Vec<SourceRecord> {
        self.tables
            .read()
            .records_for_tenant(tenant_id, status)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Items due for submission: `pending`, or `failed` with an elapsed
    /// `next_retry_at`; ordered by priority then insertion, at most `limit`.
    pub fn pending_queue_items(&self, limit: usize) -> Vec<QueueItem> {
        self.pending_queue_items_at(self.clock.now(), limit)
    }

    fn pending_queue_items_at(&self, now: DateTime<Utc>, limit: usize) -> Vec<QueueItem> {
        let tables = self.tables.read();
        let mut due: Vec<&QueueItem> = tables
            .items_with_status(SyncStatus::Pending)
            .chain(tables.items_with_status(SyncStatus::Failed))
            .filter(|item| item.is_due(now))
            .collect();
        due.sort_by_key(|item| (item.priority, item.created_at, item.id));
        due.into_iter().take(limit).cloned().collect()
    }

    /// Number of items still to be synced (`pending`, `syncing`, `failed`).
    pub fn pending_sync_count(&self) -> usize {
        let tables = self.tables.read();
        [SyncStatus::Pending, SyncStatus::Syncing, SyncStatus::Failed]
            .into_iter()
            .map(|status| tables.count_with_status(status))
            .sum()
    }

    /// Items that need attention: `failed`, `abandoned` or `auth_failed`,
    /// in insertion order.
    pub fn failed_items(&self) -> Vec<QueueItem> {
        let tables = self.tables.read();
        let mut items: Vec<QueueItem> = tables
            .queue_items()
            .filter(|item| item.status.is_retryable_manually())
            .cloned()
            .collect();
        items.sort_by_key(|item| item.id);
        items
    }

    /// Items with the given status, by priority then insertion.
    pub fn items_by_status(&self, status: SyncStatus) -> Vec<QueueItem> {
        self.tables.read().items_with_status(status).cloned().collect()
    }

    /// Number of queue items per status. Statuses without items are omitted.
    pub fn status_counts(&self) -> BTreeMap<SyncStatus, usize> {
        let mut counts = BTreeMap::new();
        for item in self.tables.read().queue_items() {
            *counts.entry(item.status).or_insert(0) += 1;
        }
        counts
    }

    /// Number of source records.
    pub fn record_count(&self) -> usize {
        self.tables.read().records().count()
    }

    /// Checks the record/queue invariants and index consistency.
    pub fn verify(&self) -> Vec<Violation> {
        verify::check(&self.tables.read())
    }
}

fn new_record(
    kind: RecordKind,
    tenant_id: String,
    worker_id: Option<String>,
    payload: serde_json::Value,
    attachment: Option<Attachment>,
    status: SyncStatus,
    now: DateTime<Utc>,
) -> SourceRecord {
    SourceRecord {
        id: RecordId::generate(),
        kind,
        tenant_id,
        worker_id,
        payload,
        attachment,
        status,
        server_id: None,
        created_at: now,
        updated_at: now,
        attempts: 0,
        last_error: None,
    }
}

fn check_transition(item: &QueueItem, to: SyncStatus) -> StoreResult<()> {
    if item.status.can_transition_to(to) {
        Ok(())
    } else {
        Err(StoreError::InvalidTransition {
            id: item.id,
            from: item.status,
            to,
        })
    }
}

fn status_changes(tables: &Tables, mutations: &[Mutation], sequence: u64) -> Vec<StatusChange> {
    let mut changes = Vec::new();
    for mutation in mutations {
        let (id, record_id, to) = match mutation {
            Mutation::PutQueueItem(item) => (item.id, item.record_id.clone(), Some(item.status)),
            Mutation::DeleteQueueItem(id) => match tables.queue_item(*id) {
                Some(old) => (*id, old.record_id.clone(), None),
                None => continue,
            },
            Mutation::PutRecord(_) | Mutation::DeleteRecord(_) => continue,
        };
        let from = tables.queue_item(id).map(|old| old.status);
        if from != to {
            changes.push(StatusChange {
                sequence,
                queue_item_id: id,
                record_id,
                from,
                to,
            });
        }
    }
    changes
}

fn status_name(status: Option<SyncStatus>) -> &'static str {
    status.map_or("none", SyncStatus::as_str)
}
