//! Staged writes applied as one journal entry.

use crate::error::{StoreError, StoreResult};
use crate::journal::Mutation;
use crate::model::{
    Priority, QueueItem, QueueItemId, QueueItemType, QueuePayload, RecordId, RecordKind,
    SourceRecord, SyncStatus,
};
use crate::tables::Tables;
use chrono::{DateTime, Utc};

/// A write transaction.
///
/// Reads go to the committed tables; writes are staged as [`Mutation`]s and
/// only reach the tables after the journal append succeeds. A closure that
/// returns an error therefore leaves nothing behind.
pub(crate) struct Transaction<'a> {
    tables: &'a Tables,
    mutations: Vec<Mutation>,
    next_queue_id: u64,
    now: DateTime<Utc>,
}

impl<'a> Transaction<'a> {
    pub(crate) fn new(tables: &'a Tables, now: DateTime<Utc>) -> Self {
        Self {
            next_queue_id: tables.peek_next_queue_id(),
            tables,
            mutations: Vec::new(),
            now,
        }
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub(crate) fn tables(&self) -> &'a Tables {
        self.tables
    }

    pub(crate) fn record(&self, id: &RecordId) -> StoreResult<SourceRecord> {
        self.tables
            .record(id)
            .cloned()
            .ok_or_else(|| StoreError::RecordNotFound(id.clone()))
    }

    pub(crate) fn queue_item(&self, id: QueueItemId) -> StoreResult<QueueItem> {
        self.tables
            .queue_item(id)
            .cloned()
            .ok_or(StoreError::QueueItemNotFound(id))
    }

    /// Builds a pending queue item for `record`. Not staged until
    /// [`Transaction::put_queue_item`] is called.
    pub(crate) fn new_queue_item(
        &mut self,
        record: &SourceRecord,
        item_type: QueueItemType,
        priority: Priority,
    ) -> StoreResult<QueueItem> {
        let id = QueueItemId::new(self.next_queue_id);
        self.next_queue_id += 1;

        Ok(QueueItem {
            id,
            item_type,
            payload: serde_json::to_string(&QueuePayload::for_record(record))?,
            priority,
            status: SyncStatus::Pending,
            retry_count: 0,
            last_error: None,
            next_retry_at: None,
            last_retry_at: None,
            record_kind: record.kind,
            record_id: record.id.clone(),
            tenant_id: record.tenant_id.clone(),
            server_id: None,
            delete_after: None,
            created_at: self.now,
            updated_at: self.now,
        })
    }

    pub(crate) fn put_record(&mut self, record: SourceRecord) {
        self.mutations.push(Mutation::PutRecord(record));
    }

    pub(crate) fn put_queue_item(&mut self, item: QueueItem) {
        self.mutations.push(Mutation::PutQueueItem(item));
    }

    pub(crate) fn delete_record(&mut self, id: RecordId) {
        self.mutations.push(Mutation::DeleteRecord(id));
    }

    pub(crate) fn delete_queue_item(&mut self, id: QueueItemId) {
        self.mutations.push(Mutation::DeleteQueueItem(id));
    }

    pub(crate) fn into_mutations(self) -> Vec<Mutation> {
        self.mutations
    }
}

/// Queue item type used when a record is first submitted.
pub(crate) fn submission_type(record: &SourceRecord) -> QueueItemType {
    match (record.kind, &record.attachment) {
        (RecordKind::Form, _) => QueueItemType::FormSubmission,
        (RecordKind::Evidence, Some(_)) => QueueItemType::PhotoUpload,
        (RecordKind::Evidence, None) => QueueItemType::Evidence,
    }
}
