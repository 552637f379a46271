//! Sync engine behavior when the journal rejects the write recording an
//! item's outcome.

use fieldsync_engine::{
    EngineError, EngineEvent, ItemOutcome, MockRemote, RemoteApi, RemoteFailure, RemoteReceipt,
    SyncConfig, SyncEngine,
};
use fieldsync_store::{
    Clock, LocalStore, ManualClock, QueueItemId, RecordId, StoreConfig, StoreError, SyncStatus,
};
use fieldsync_testkit::prelude::*;
use std::sync::Arc;
use std::time::Duration;

struct Rig {
    engine: Arc<SyncEngine>,
    store: Arc<LocalStore>,
    remote: Arc<MockRemote>,
    faults: FaultHandle,
}

impl Rig {
    fn new() -> Self {
        let (flaky, faults) = FlakyBackend::new(SharedMemoryBackend::new());
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(fixed_start()));
        let store =
            Arc::new(LocalStore::open(Box::new(flaky), StoreConfig::default(), clock).unwrap());
        let remote = Arc::new(MockRemote::new());
        remote.set_delay(Duration::from_secs(1));
        let engine = SyncEngine::new(
            Arc::clone(&store),
            Arc::clone(&remote) as Arc<dyn RemoteApi>,
            SyncConfig::default(),
        );
        Self {
            engine,
            store,
            remote,
            faults,
        }
    }

    fn form(&self) -> (RecordId, QueueItemId) {
        let record = self.store.create_form(sample_form("tenant-a")).unwrap();
        let item = self.store.queue_items_for_record(&record)[0].id;
        (record, item)
    }

    /// Rejects the next append once the remote has the request in hand.
    async fn reject_outcome_write(&self) {
        while self.remote.call_count() == 0 {
            tokio::task::yield_now().await;
        }
        self.faults.fail_next_appends(1);
    }

    fn assert_status(&self, record: &RecordId, item: QueueItemId, status: SyncStatus) {
        assert_eq!(self.store.queue_item(item).unwrap().status, status);
        assert_eq!(self.store.record(record).unwrap().status, status);
    }
}

#[tokio::test(start_paused = true)]
async fn unrecorded_success_requeues_the_item() {
    let rig = Rig::new();
    let (record, item) = rig.form();
    rig.remote.push_response(Ok(RemoteReceipt::new("srv-1")));

    let engine = Arc::clone(&rig.engine);
    let attempt = tokio::spawn(async move { engine.sync_item(item).await });
    rig.reject_outcome_write().await;

    let err = attempt.await.unwrap().unwrap_err();
    assert!(matches!(err, EngineError::Store(StoreError::Storage(_))));
    rig.assert_status(&record, item, SyncStatus::Pending);
    assert!(rig.store.verify().is_empty());

    let outcome = rig.engine.sync_item(item).await.unwrap();
    assert!(matches!(outcome, ItemOutcome::Synced { .. }));
    rig.assert_status(&record, item, SyncStatus::Synced);
}

#[tokio::test(start_paused = true)]
async fn unrecorded_failure_can_be_retried_in_process() {
    let rig = Rig::new();
    let (record, item) = rig.form();
    rig.remote.push_response(Err(RemoteFailure::http(500, "internal")));

    let engine = Arc::clone(&rig.engine);
    let attempt = tokio::spawn(async move { engine.sync_item(item).await });
    rig.reject_outcome_write().await;

    assert!(attempt.await.unwrap().is_err());
    rig.assert_status(&record, item, SyncStatus::Pending);
    assert_eq!(rig.store.queue_item(item).unwrap().retry_count, 0);
    assert_eq!(rig.engine.scheduler().armed_count(), 0);

    let stats = rig.engine.sync_all().await.unwrap();
    assert_eq!(stats.synced, 1);
    rig.assert_status(&record, item, SyncStatus::Synced);
}

#[tokio::test(start_paused = true)]
async fn pass_reports_completion_when_a_write_fails() {
    let rig = Rig::new();
    let (first, first_item) = rig.form();
    let (second, second_item) = rig.form();
    let mut events = rig.engine.subscribe();

    let engine = Arc::clone(&rig.engine);
    let pass = tokio::spawn(async move { engine.sync_all().await });
    rig.reject_outcome_write().await;

    assert!(pass.await.unwrap().is_err());
    assert!(!rig.engine.is_syncing());

    let mut completed = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let EngineEvent::SyncComplete(stats) = event {
            completed.push(stats);
        }
    }
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].synced, 0);
    assert_eq!(completed[0].pending, 2);
    rig.assert_status(&first, first_item, SyncStatus::Pending);
    rig.assert_status(&second, second_item, SyncStatus::Pending);

    let stats = rig.engine.sync_all().await.unwrap();
    assert_eq!(stats.synced, 2);
    assert!(rig.store.verify().is_empty());
}
