//! In-memory tables and secondary indexes rebuilt from the journal.

use crate::journal::Mutation;
use crate::model::{Priority, QueueItem, QueueItemId, RecordId, SourceRecord, SyncStatus};
use std::collections::{BTreeMap, BTreeSet};

/// `records` and `sync_queue` plus their indexes.
///
/// Indexes:
/// - `(tenant, status, record)` over records
/// - `(status, priority, queue item)` over the queue; the id breaks ties in
///   insertion order
/// - `record -> queue items`
#[derive(Debug, Default)]
pub(crate) struct Tables {
    records: BTreeMap<RecordId, SourceRecord>,
    queue: BTreeMap<QueueItemId, QueueItem>,
    by_tenant_status: BTreeSet<(String, SyncStatus, RecordId)>,
    by_status_priority: BTreeSet<(SyncStatus, Priority, QueueItemId)>,
    by_record: BTreeMap<RecordId, BTreeSet<QueueItemId>>,
    next_queue_id: u64,
    sequence: u64,
}

impl Tables {
    pub(crate) fn record(&self, id: &RecordId) -> Option<&SourceRecord> {
        self.records.get(id)
    }

    pub(crate) fn queue_item(&self, id: QueueItemId) -> Option<&QueueItem> {
        self.queue.get(&id)
    }

    pub(crate) fn records(&self) -> impl Iterator<Item = &SourceRecord> {
        self.records.values()
    }

    pub(crate) fn queue_items(&self) -> impl Iterator<Item = &QueueItem> {
        self.queue.values()
    }

    /// Queue items of a record, oldest first.
    pub(crate) fn items_for_record(&self, record_id: &RecordId) -> Vec<&QueueItem> {
        self.by_record
            .get(record_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.queue.get(id))
            .collect()
    }

    /// The most recent queue item of a record.
    pub(crate) fn latest_item(&self, record_id: &RecordId) -> Option<&QueueItem> {
        self.by_record
            .get(record_id)
            .and_then(|ids| ids.iter().next_back())
            .and_then(|id| self.queue.get(id))
    }

    /// Queue items with `status`, ordered by priority then insertion.
    pub(crate) fn items_with_status(&self, status: SyncStatus) -> impl Iterator<Item = &QueueItem> {
        let start = (status, Priority::HIGHEST, QueueItemId::new(0));
        let end = (status, Priority::LOWEST, QueueItemId::new(u64::MAX));
        self.by_status_priority
            .range(start..=end)
            .filter_map(|(_, _, id)| self.queue.get(id))
    }

    pub(crate) fn records_for_tenant<'a>(
        &'a self,
        tenant_id: &str,
        status: Option<SyncStatus>,
    ) -> Vec<&'a SourceRecord> {
        let from = (
            tenant_id.to_string(),
            status.unwrap_or(SyncStatus::Draft),
            RecordId::from(""),
        );
        self.by_tenant_status
            .range(from..)
            .take_while(|(tenant, s, _)| tenant == tenant_id && status.map_or(true, |want| *s == want))
            .filter_map(|(_, _, id)| self.records.get(id))
            .collect()
    }

    pub(crate) fn count_with_status(&self, status: SyncStatus) -> usize {
        self.items_with_status(status).count()
    }

    pub(crate) fn peek_next_queue_id(&self) -> u64 {
        self.next_queue_id.max(1)
    }

    pub(crate) fn sequence(&self) -> u64 {
        self.sequence
    }

    pub(crate) fn set_sequence(&mut self, sequence: u64) {
        self.sequence = sequence;
    }

    /// Applies one committed mutation, keeping every index in step.
    pub(crate) fn apply(&mut self, mutation: Mutation) {
        match mutation {
            Mutation::PutRecord(record) => {
                if let Some(old) = self.records.get(&record.id) {
                    self.by_tenant_status
                        .remove(&(old.tenant_id.clone(), old.status, old.id.clone()));
                }
                self.by_tenant_status
                    .insert((record.tenant_id.clone(), record.status, record.id.clone()));
                self.records.insert(record.id.clone(), record);
            }
            Mutation::DeleteRecord(id) => {
                if let Some(old) = self.records.remove(&id) {
                    self.by_tenant_status
                        .remove(&(old.tenant_id, old.status, old.id));
                }
            }
            Mutation::PutQueueItem(item) => {
                if let Some(old) = self.queue.get(&item.id) {
                    self.by_status_priority
                        .remove(&(old.status, old.priority, old.id));
                }
                self.by_status_priority
                    .insert((item.status, item.priority, item.id));
                self.by_record
                    .entry(item.record_id.clone())
                    .or_default()
                    .insert(item.id);
                self.next_queue_id = self.next_queue_id.max(item.id.as_u64() + 1);
                self.queue.insert(item.id, item);
            }
            Mutation::DeleteQueueItem(id) => {
                if let Some(old) = self.queue.remove(&id) {
                    self.by_status_priority
                        .remove(&(old.status, old.priority, old.id));
                    if let Some(ids) = self.by_record.get_mut(&old.record_id) {
                        ids.remove(&id);
                        if ids.is_empty() {
                            self.by_record.remove(&old.record_id);
                        }
                    }
                }
            }
        }
    }

    /// Compares the indexes with what the rows say they should contain.
    pub(crate) fn index_mismatches(&self) -> Vec<String> {
        let mut problems = Vec::new();

        let tenant_expected: BTreeSet<_> = self
            .records
            .values()
            .map(|r| (r.tenant_id.clone(), r.status, r.id.clone()))
            .collect();
        if tenant_expected != self.by_tenant_status {
            problems.push("(tenant, status) index out of step with records".to_string());
        }

        let status_expected: BTreeSet<_> = self
            .queue
            .values()
            .map(|q| (q.status, q.priority, q.id))
            .collect();
        if status_expected != self.by_status_priority {
            problems.push("(status, priority) index out of step with queue".to_string());
        }

        let mut record_expected: BTreeMap<RecordId, BTreeSet<QueueItemId>> = BTreeMap::new();
        for item in self.queue.values() {
            record_expected
                .entry(item.record_id.clone())
                .or_default()
                .insert(item.id);
        }
        if record_expected != self.by_record {
            problems.push("record index out of step with queue".to_string());
        }

        problems
    }
}
