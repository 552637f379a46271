//! Crash and restart behavior of the local store.

use fieldsync_store::{Clock, LocalStore, StatusPatch, StoreConfig, StoreError, SyncStatus};
use fieldsync_testkit::prelude::*;
use std::sync::Arc;

fn open(backend: impl fieldsync_storage::StorageBackend + 'static) -> Result<LocalStore, StoreError> {
    let clock: Arc<dyn Clock> = Arc::new(fieldsync_store::ManualClock::new(fixed_start()));
    LocalStore::open(Box::new(backend), StoreConfig::default(), clock)
}

#[test]
fn torn_commit_is_dropped_on_restart() {
    let shared = SharedMemoryBackend::new();
    let (flaky, faults) = FlakyBackend::new(shared.clone());
    let store = open(flaky).unwrap();

    let kept = store.create_form(sample_form("tenant-a")).unwrap();
    let size_before = shared.len();

    faults.tear_next_append(7);
    assert!(store.create_form(sample_form("tenant-a")).is_err());
    assert!(faults.is_crashed());
    assert_eq!(shared.len(), size_before + 7);
    assert_eq!(store.record_count(), 1);
    drop(store);

    let store = open(shared.clone()).unwrap();
    assert_eq!(shared.len(), size_before);
    assert_eq!(store.record_count(), 1);
    assert!(store.record(&kept).is_some());
    assert!(store.verify().is_empty());

    store.create_form(sample_form("tenant-a")).unwrap();
    drop(store);
    let store = open(shared).unwrap();
    assert_eq!(store.record_count(), 2);
    assert_eq!(store.pending_sync_count(), 2);
}

#[test]
fn failed_flush_rolls_the_commit_back() {
    let shared = SharedMemoryBackend::new();
    let (flaky, faults) = FlakyBackend::new(shared.clone());
    let store = open(flaky).unwrap();

    faults.fail_next_syncs(1);
    let err = store.create_evidence(sample_photo("tenant-a")).unwrap_err();
    assert!(matches!(err, StoreError::Storage(_)));
    assert!(err.is_transient());
    assert!(shared.is_empty());
    assert_eq!(store.record_count(), 0);

    store.create_evidence(sample_photo("tenant-a")).unwrap();
    drop(store);
    assert_eq!(open(shared).unwrap().record_count(), 1);
}

#[test]
fn rejected_append_leaves_store_usable() {
    let shared = SharedMemoryBackend::new();
    let (flaky, faults) = FlakyBackend::new(shared.clone());
    let store = open(flaky).unwrap();
    let id = store.create_form(sample_form("tenant-a")).unwrap();
    let item = store.queue_items_for_record(&id)[0].id;

    faults.fail_next_appends(1);
    assert!(store
        .update_status(item, SyncStatus::Syncing, StatusPatch::new())
        .is_err());
    assert_eq!(store.queue_item(item).unwrap().status, SyncStatus::Pending);
    assert_eq!(store.record(&id).unwrap().attempts, 0);

    store
        .update_status(item, SyncStatus::Syncing, StatusPatch::new())
        .unwrap();
    assert_eq!(faults.appends(), 3);
}

#[test]
fn item_interrupted_mid_sync_is_requeued() {
    let fixture = TestStore::memory();
    let id = fixture.create_form(sample_form("tenant-a")).unwrap();
    let item = fixture.queue_items_for_record(&id)[0].id;
    fixture
        .update_status(item, SyncStatus::Syncing, StatusPatch::new())
        .unwrap();

    let fixture = fixture.reopen();
    let item = fixture.queue_item(item).unwrap();
    assert_eq!(item.status, SyncStatus::Pending);
    assert_eq!(fixture.record(&id).unwrap().status, SyncStatus::Pending);
    assert!(fixture.verify().is_empty());
}

#[test]
fn damage_before_the_last_entry_is_corruption() {
    let fixture = TestStore::memory();
    fixture.create_form(sample_form("tenant-a")).unwrap();
    fixture.create_form(sample_form("tenant-b")).unwrap();
    let backend = fixture.backend().unwrap().clone();
    drop(fixture);

    backend.flip_byte(20);
    let err = open(backend).unwrap_err();
    assert!(matches!(err, StoreError::Corrupted { .. }));
}

#[test]
fn file_journal_survives_restart() {
    let fixture = TestStore::file();
    let form = fixture.create_form(sample_form("tenant-a")).unwrap();
    let draft = fixture.save_form_draft(sample_form("tenant-a")).unwrap();
    let sequence = fixture.sequence();

    let fixture = fixture.reopen();
    assert_eq!(fixture.sequence(), sequence);
    assert_eq!(fixture.record(&form).unwrap().status, SyncStatus::Pending);
    assert_eq!(fixture.record(&draft).unwrap().status, SyncStatus::Draft);
    assert!(fixture.queue_items_for_record(&draft).is_empty());
}
