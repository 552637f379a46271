//! Integration tests for the sync engine over a real local store.

use chrono::Duration as ChronoDuration;
use fieldsync_engine::{
    EngineError, EngineEvent, ItemOutcome, MockRemote, Notification, NotificationLevel,
    RemoteApi, RemoteFailure, RemoteReceipt, SyncConfig, SyncEngine, SyncErrorKind, SyncObserver,
    SyncStats,
};
use fieldsync_storage::InMemoryBackend;
use fieldsync_store::{
    Attachment, Clock, LocalStore, ManualClock, NewEvidence, NewForm, Priority, QueueItem,
    QueueItemType, RecordId, StoreConfig, SyncStatus,
};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

struct Harness {
    engine: Arc<SyncEngine>,
    store: Arc<LocalStore>,
    remote: Arc<MockRemote>,
    clock: Arc<ManualClock>,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(SyncConfig::default())
    }

    fn with_config(config: SyncConfig) -> Self {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(
            LocalStore::open(
                Box::new(InMemoryBackend::new()),
                StoreConfig::default(),
                Arc::clone(&clock) as Arc<dyn Clock>,
            )
            .unwrap(),
        );
        let remote = Arc::new(MockRemote::new());
        let engine = SyncEngine::new(
            Arc::clone(&store),
            Arc::clone(&remote) as Arc<dyn RemoteApi>,
            config,
        );
        Self {
            engine,
            store,
            remote,
            clock,
        }
    }

    fn form(&self) -> RecordId {
        self.store
            .create_form(NewForm::new("tenant-a", json!({"hazard": "none"})))
            .unwrap()
    }

    fn form_with(&self, priority: Priority) -> RecordId {
        self.store
            .create_form(NewForm::new("tenant-a", json!({})).with_priority(priority))
            .unwrap()
    }

    fn calls_for(&self, record: &RecordId) -> usize {
        self.remote
            .calls()
            .iter()
            .filter(|call| call.local_id == *record)
            .count()
    }

    fn item(&self, record: &RecordId) -> QueueItem {
        self.store.queue_items_for_record(record).pop().unwrap()
    }

    fn assert_statuses_match(&self, record: &RecordId, status: SyncStatus) {
        assert_eq!(self.item(record).status, status);
        assert_eq!(self.store.record(record).unwrap().status, status);
    }
}

#[tokio::test]
async fn success_marks_item_and_record_synced() {
    let h = Harness::new();
    let record = h.form();
    h.remote.push_response(Ok(RemoteReceipt::new("srv-42")));

    let stats = h.engine.sync_all().await.unwrap();

    assert_eq!(stats.synced, 1);
    assert_eq!(stats.pending, 0);
    h.assert_statuses_match(&record, SyncStatus::Synced);
    let item = h.item(&record);
    assert_eq!(item.server_id.as_deref(), Some("srv-42"));
    assert_eq!(item.last_error, None);
    assert_eq!(item.delete_after, Some(h.clock.now() + ChronoDuration::hours(24)));
    assert_eq!(h.store.record(&record).unwrap().server_id.as_deref(), Some("srv-42"));
}

#[tokio::test(start_paused = true)]
async fn network_failure_schedules_retry_without_counting() {
    let h = Harness::new();
    let record = h.form();
    h.remote.push_response(Err(RemoteFailure::network("offline")));

    let stats = h.engine.sync_all().await.unwrap();

    assert_eq!(stats.failed, 1);
    h.assert_statuses_match(&record, SyncStatus::Failed);
    let item = h.item(&record);
    assert_eq!(item.retry_count, 0);
    assert_eq!(item.next_retry_at, Some(h.clock.now() + ChronoDuration::seconds(2)));
    assert!(item.last_error.unwrap().contains("offline"));
    assert!(h.engine.scheduler().is_armed(item.id));
}

#[tokio::test]
async fn auth_failure_stops_the_pass_and_never_schedules() {
    let h = Harness::new();
    let first = h.form();
    let second = h.form();
    h.remote.push_response(Err(RemoteFailure::http(401, "token expired")));

    let stats = h.engine.sync_all().await.unwrap();

    assert_eq!(stats.auth_failed, 1);
    assert!(stats.stopped_on_auth);
    assert_eq!(h.remote.call_count(), 1);
    h.assert_statuses_match(&first, SyncStatus::AuthFailed);
    h.assert_statuses_match(&second, SyncStatus::Pending);

    let item = h.item(&first);
    assert_eq!(item.retry_count, 0);
    assert_eq!(item.next_retry_at, None);
    assert_eq!(h.engine.scheduler().armed_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn five_server_failures_abandon() {
    let h = Harness::new();
    let record = h.form();
    h.remote.set_fallback(Err(RemoteFailure::http(500, "")));
    let id = h.item(&record).id;

    for attempt in 1..=4 {
        let outcome = h.engine.sync_item(id).await.unwrap();
        assert!(
            matches!(outcome, ItemOutcome::Failed { retry_count, .. } if retry_count == attempt)
        );
        h.assert_statuses_match(&record, SyncStatus::Failed);
    }
    let outcome = h.engine.sync_item(id).await.unwrap();

    assert!(matches!(outcome, ItemOutcome::Abandoned { .. }));
    h.assert_statuses_match(&record, SyncStatus::Abandoned);
    assert_eq!(h.item(&record).retry_count, 5);
    assert_eq!(h.item(&record).next_retry_at, None);
    assert!(!h.engine.scheduler().is_armed(id));
}

#[tokio::test(start_paused = true)]
async fn connectivity_failures_never_abandon() {
    let h = Harness::new();
    let record = h.form();
    let id = h.item(&record).id;

    for n in 0..10 {
        let failure = if n % 2 == 0 {
            RemoteFailure::network("connection reset")
        } else {
            RemoteFailure::Timeout
        };
        h.remote.push_response(Err(failure));
        h.engine.sync_item(id).await.unwrap();
    }

    let item = h.item(&record);
    assert_eq!(item.status, SyncStatus::Failed);
    assert_eq!(item.retry_count, 0);
    assert_eq!(h.remote.call_count(), 10);
}

#[tokio::test(start_paused = true)]
async fn slow_remote_is_classified_as_timeout() {
    let h = Harness::with_config(SyncConfig::default().with_request_timeout(Duration::from_secs(30)));
    let record = h.form();
    h.remote.set_delay(Duration::from_secs(60));

    let outcome = h.engine.sync_item(h.item(&record).id).await.unwrap();

    match outcome {
        ItemOutcome::Failed { error, retry_count, .. } => {
            assert_eq!(error.kind, SyncErrorKind::Timeout);
            assert_eq!(retry_count, 0);
        }
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn concurrent_sync_all_returns_empty_stats() {
    let h = Harness::new();
    h.form();
    h.remote.set_delay(Duration::from_secs(10));

    let engine = Arc::clone(&h.engine);
    let first = tokio::spawn(async move { engine.sync_all().await });
    while h.remote.call_count() == 0 {
        tokio::task::yield_now().await;
    }
    assert!(h.engine.is_syncing());

    let second = h.engine.sync_all().await.unwrap();
    assert_eq!(second, SyncStats::default());
    assert_eq!(h.remote.call_count(), 1);

    let first = first.await.unwrap().unwrap();
    assert_eq!(first.synced, 1);
    assert!(!h.engine.is_syncing());
}

#[tokio::test(start_paused = true)]
async fn cancelled_retry_changes_nothing() {
    let h = Harness::new();
    let record = h.form();
    h.remote.push_response(Err(RemoteFailure::http(503, "busy")));
    h.engine.sync_all().await.unwrap();
    let id = h.item(&record).id;

    assert!(h.engine.scheduler().cancel(id));
    tokio::time::sleep(Duration::from_secs(120)).await;

    assert_eq!(h.remote.call_count(), 1);
    let item = h.item(&record);
    assert_eq!(item.status, SyncStatus::Failed);
    assert_eq!(item.retry_count, 1);
}

#[tokio::test(start_paused = true)]
async fn scheduled_retries_recover_after_server_errors() {
    let h = Harness::new();
    let record = h.form();
    h.remote.push_failures(RemoteFailure::http(500, "internal"), 3);
    h.remote.push_response(Ok(RemoteReceipt::new("srv-1")));

    let stats = h.engine.sync_all().await.unwrap();
    assert_eq!(stats.failed, 1);

    // retries fire after 4s, 8s and 16s
    tokio::time::sleep(Duration::from_secs(60)).await;

    h.assert_statuses_match(&record, SyncStatus::Synced);
    let item = h.item(&record);
    assert_eq!(item.retry_count, 3);
    assert_eq!(item.server_id.as_deref(), Some("srv-1"));
    assert_eq!(item.delete_after, Some(h.clock.now() + ChronoDuration::hours(24)));
    assert_eq!(h.remote.call_count(), 4);
    assert_eq!(h.engine.scheduler().armed_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn evidence_rejected_for_credentials_stays_blocked() {
    let h = Harness::new();
    let record = h
        .store
        .create_evidence(
            NewEvidence::new("tenant-a", json!({"note": "exposed wiring"})).with_attachment(
                Attachment {
                    file_name: "wiring.jpg".into(),
                    media_type: "image/jpeg".into(),
                    size_bytes: 120_000,
                },
            ),
        )
        .unwrap();
    h.remote.set_fallback(Err(RemoteFailure::http(401, "")));

    h.engine.sync_all().await.unwrap();
    tokio::time::sleep(Duration::from_secs(300)).await;

    h.assert_statuses_match(&record, SyncStatus::AuthFailed);
    assert_eq!(h.item(&record).retry_count, 0);
    assert_eq!(h.engine.scheduler().armed_count(), 0);
    assert_eq!(h.remote.call_count(), 1);
}

#[tokio::test]
async fn sync_all_follows_priority_order() {
    let h = Harness::new();
    let low = h
        .store
        .create_form(NewForm::new("t", json!({})).with_priority(Priority::LOWEST))
        .unwrap();
    let high = h
        .store
        .create_form(NewForm::new("t", json!({})).with_priority(Priority::HIGHEST))
        .unwrap();

    h.engine.sync_all().await.unwrap();

    let order: Vec<RecordId> = h.remote.calls().into_iter().map(|c| c.local_id).collect();
    assert_eq!(order, vec![high, low]);
}

#[tokio::test]
async fn batch_size_caps_a_pass() {
    let h = Harness::with_config(SyncConfig::default().with_batch_size(2));
    for _ in 0..3 {
        h.form();
    }

    let stats = h.engine.sync_all().await.unwrap();

    assert_eq!(stats.synced, 2);
    assert_eq!(stats.pending, 1);
}

#[tokio::test]
async fn manual_retry_resets_and_resubmits() {
    let h = Harness::new();
    let record = h.form();
    h.remote.push_response(Err(RemoteFailure::http(403, "")));
    h.engine.sync_all().await.unwrap();
    h.assert_statuses_match(&record, SyncStatus::AuthFailed);

    let outcome = h.engine.retry_failed(h.item(&record).id).await.unwrap();

    assert!(matches!(outcome, ItemOutcome::Synced { .. }));
    h.assert_statuses_match(&record, SyncStatus::Synced);
    assert_eq!(h.item(&record).retry_count, 0);
}

#[tokio::test(start_paused = true)]
async fn retry_all_failed_covers_every_terminal_failure() {
    let h = Harness::new();
    let blocked = h.form();
    let abandoned = h.form();
    h.remote.push_response(Err(RemoteFailure::http(401, "")));
    h.engine.sync_all().await.unwrap();

    h.remote.push_failures(RemoteFailure::http(413, "too big"), 5);
    let id = h.item(&abandoned).id;
    for _ in 0..5 {
        h.engine.sync_item(id).await.unwrap();
    }
    h.assert_statuses_match(&abandoned, SyncStatus::Abandoned);

    let stats = h.engine.retry_all_failed().await.unwrap();

    assert_eq!(stats.synced, 2);
    h.assert_statuses_match(&blocked, SyncStatus::Synced);
    h.assert_statuses_match(&abandoned, SyncStatus::Synced);
    assert!(h.store.failed_items().is_empty());
}

#[tokio::test(start_paused = true)]
async fn abort_stops_between_items() {
    let h = Harness::new();
    for _ in 0..3 {
        h.form();
    }
    h.remote.set_delay(Duration::from_secs(1));

    let engine = Arc::clone(&h.engine);
    let pass = tokio::spawn(async move { engine.sync_all().await });
    while h.remote.call_count() == 0 {
        tokio::task::yield_now().await;
    }
    h.engine.abort();

    let stats = pass.await.unwrap().unwrap();
    assert!(stats.aborted);
    assert_eq!(stats.synced, 1);
    assert_eq!(stats.pending, 2);
}

/// A low-priority item with a 4s retry armed, a high-priority item ahead of
/// it in the next pass, and a remote slow enough for the timer to fire while
/// the first item is in flight.
async fn retry_due_during_slow_pass(h: &Harness) -> (RecordId, RecordId) {
    let late = h.form_with(Priority::LOWEST);
    h.remote.push_response(Err(RemoteFailure::http(500, "")));
    h.engine.sync_item(h.item(&late).id).await.unwrap();
    assert!(h.engine.scheduler().is_armed(h.item(&late).id));

    let early = h.form_with(Priority::HIGHEST);
    h.clock.advance(ChronoDuration::seconds(4));
    h.remote.push_response(Ok(RemoteReceipt::new("srv-early")));
    h.remote.set_fallback(Err(RemoteFailure::http(500, "")));
    h.remote.set_delay(Duration::from_secs(10));
    (early, late)
}

#[tokio::test(start_paused = true)]
async fn pass_skips_item_whose_retry_fired_while_waiting() {
    let h = Harness::new();
    let (early, late) = retry_due_during_slow_pass(&h).await;

    let stats = h.engine.sync_all().await.unwrap();

    assert_eq!(stats.synced, 1);
    assert_eq!(stats.failed, 0);
    assert_eq!(h.calls_for(&early), 1);
    // the initial failure plus the timer's attempt, never the pass's
    assert_eq!(h.calls_for(&late), 2);
    let item = h.item(&late);
    assert_eq!(item.status, SyncStatus::Failed);
    assert_eq!(item.retry_count, 2);
    assert_eq!(item.next_retry_at, Some(h.clock.now() + ChronoDuration::seconds(8)));
    assert!(h.engine.scheduler().is_armed(item.id));
    h.assert_statuses_match(&late, SyncStatus::Failed);
}

#[tokio::test(start_paused = true)]
async fn abort_disarms_retry_waiting_for_the_in_flight_item() {
    let h = Harness::new();
    let (early, late) = retry_due_during_slow_pass(&h).await;
    let late_id = h.item(&late).id;

    let engine = Arc::clone(&h.engine);
    let pass = tokio::spawn(async move { engine.sync_all().await });
    tokio::time::sleep(Duration::from_secs(6)).await;
    // fired at 4s, now queued behind the in-flight item
    assert!(!h.engine.scheduler().is_armed(late_id));
    assert_eq!(h.calls_for(&late), 1);
    h.engine.abort();

    let stats = pass.await.unwrap().unwrap();
    assert!(stats.aborted);
    assert_eq!(stats.synced, 1);
    h.assert_statuses_match(&early, SyncStatus::Synced);

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(h.calls_for(&late), 1);
    let item = h.item(&late);
    assert_eq!(item.status, SyncStatus::Failed);
    assert_eq!(item.retry_count, 1);
    assert_eq!(h.engine.scheduler().armed_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn failure_settling_after_abort_arms_no_retry() {
    let h = Harness::new();
    let record = h.form();
    h.remote.push_response(Err(RemoteFailure::http(503, "busy")));
    h.remote.set_delay(Duration::from_secs(5));

    let engine = Arc::clone(&h.engine);
    let pass = tokio::spawn(async move { engine.sync_all().await });
    while h.remote.call_count() == 0 {
        tokio::task::yield_now().await;
    }
    h.engine.abort();

    let stats = pass.await.unwrap().unwrap();
    assert_eq!(stats.failed, 1);
    h.assert_statuses_match(&record, SyncStatus::Failed);
    assert!(h.item(&record).next_retry_at.is_some());
    assert_eq!(h.engine.scheduler().armed_count(), 0);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.remote.call_count(), 1);
}

#[tokio::test]
async fn shutdown_refuses_further_work() {
    let h = Harness::new();
    h.form();
    h.engine.shutdown();

    assert!(matches!(h.engine.sync_all().await, Err(EngineError::ShutDown)));
    assert_eq!(h.remote.call_count(), 0);
}

#[tokio::test]
async fn cleanup_purges_after_retention() {
    let h = Harness::new();
    let record = h.form();
    h.engine.sync_all().await.unwrap();

    assert_eq!(h.engine.cleanup_synced_items().unwrap(), 0);
    h.clock.advance(ChronoDuration::hours(25));
    assert_eq!(h.engine.cleanup_synced_items().unwrap(), 1);
    assert!(h.store.queue_items_for_record(&record).is_empty());
}

#[tokio::test(start_paused = true)]
async fn resume_rearms_failed_items() {
    let h = Harness::new();
    let record = h.form();
    h.remote.push_response(Err(RemoteFailure::http(502, "")));
    h.engine.sync_all().await.unwrap();
    h.engine.shutdown();
    assert_eq!(h.engine.scheduler().armed_count(), 0);

    let restarted = SyncEngine::new(
        Arc::clone(&h.store),
        Arc::clone(&h.remote) as Arc<dyn RemoteApi>,
        SyncConfig::default(),
    );
    assert_eq!(restarted.resume_scheduled(), 1);
    assert!(restarted.scheduler().is_armed(h.item(&record).id));

    tokio::time::sleep(Duration::from_secs(5)).await;
    h.assert_statuses_match(&record, SyncStatus::Synced);
}

#[tokio::test]
async fn events_report_transitions_and_notifications() {
    let h = Harness::new();
    let record = h.form();
    let id = h.item(&record).id;
    let mut events = h.engine.subscribe();

    h.engine.sync_item(id).await.unwrap();

    let mut received = Vec::new();
    while let Ok(event) = events.try_recv() {
        received.push(event);
    }
    assert_eq!(
        received[0],
        EngineEvent::StateChange {
            queue_item_id: id,
            record_id: record.clone(),
            from: SyncStatus::Pending,
            to: SyncStatus::Syncing,
        }
    );
    assert_eq!(
        received[1],
        EngineEvent::StateChange {
            queue_item_id: id,
            record_id: record,
            from: SyncStatus::Syncing,
            to: SyncStatus::Synced,
        }
    );
    match &received[2] {
        EngineEvent::Notification(notification) => {
            assert_eq!(notification.level, NotificationLevel::Info);
            assert_eq!(notification.queue_item_id, Some(id));
            assert_eq!(notification.item_type, Some(QueueItemType::FormSubmission));
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[derive(Default)]
struct Recorder {
    levels: Mutex<Vec<NotificationLevel>>,
    completed: Mutex<Vec<SyncStats>>,
}

impl SyncObserver for Recorder {
    fn on_notification(&self, notification: &Notification) {
        self.levels.lock().push(notification.level);
    }

    fn on_sync_complete(&self, stats: &SyncStats) {
        self.completed.lock().push(stats.clone());
    }
}

#[tokio::test(start_paused = true)]
async fn observer_receives_callbacks() {
    let h = Harness::new();
    h.form();
    h.form();
    h.remote.push_response(Err(RemoteFailure::http(500, "")));
    let recorder = Arc::new(Recorder::default());
    h.engine.set_observer(Arc::clone(&recorder) as Arc<dyn SyncObserver>);

    h.engine.sync_all().await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(
        *recorder.levels.lock(),
        vec![NotificationLevel::Warning, NotificationLevel::Info]
    );
    assert_eq!(recorder.completed.lock().len(), 1);
}

async fn next_sync_complete(events: &mut tokio::sync::broadcast::Receiver<EngineEvent>) -> SyncStats {
    loop {
        if let EngineEvent::SyncComplete(stats) = events.recv().await.unwrap() {
            return stats;
        }
    }
}

#[tokio::test(start_paused = true)]
async fn reconnect_triggers_sync() {
    let h = Harness::new();
    let (online, rx) = watch::channel(false);
    h.engine.watch_connectivity(rx);
    let mut events = h.engine.subscribe();

    let first = h.form();
    online.send(true).unwrap();
    let stats = tokio::time::timeout(Duration::from_secs(5), next_sync_complete(&mut events))
        .await
        .unwrap();
    assert_eq!(stats.synced, 1);
    h.assert_statuses_match(&first, SyncStatus::Synced);

    // already online: no edge
    let second = h.form();
    online.send(true).unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.remote.call_count(), 1);

    online.send(false).unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    online.send(true).unwrap();
    let stats = tokio::time::timeout(Duration::from_secs(5), next_sync_complete(&mut events))
        .await
        .unwrap();
    assert_eq!(stats.synced, 1);
    h.assert_statuses_match(&second, SyncStatus::Synced);
}
