//! Property tests: arbitrary operation sequences keep the queue consistent.

use chrono::Duration;
use fieldsync_engine::{
    MockRemote, RemoteApi, RemoteReceipt, SyncConfig, SyncEngine, MAX_RETRIES,
};
use fieldsync_store::{
    Clock, FailureUpdate, QueueItem, RecordKind, SourceRecord, StatusPatch, StoreError,
    StoreResult, SyncStatus,
};
use fieldsync_testkit::prelude::*;
use proptest::prelude::*;
use std::sync::Arc;

fn all_records(fx: &TestStore) -> Vec<SourceRecord> {
    TENANTS
        .iter()
        .flat_map(|tenant| fx.records_by_tenant(tenant, None))
        .collect()
}

fn pick<T: Clone>(items: &[T], index: usize) -> Option<T> {
    if items.is_empty() {
        None
    } else {
        Some(items[index % items.len()].clone())
    }
}

fn apply(fx: &TestStore, op: &StoreOp) -> StoreResult<()> {
    match op {
        StoreOp::CreateForm(form) => {
            fx.create_form(form.clone())?;
        }
        StoreOp::CreateEvidence(evidence) => {
            fx.create_evidence(evidence.clone())?;
        }
        StoreOp::SaveDraft(form) => {
            fx.save_form_draft(form.clone())?;
        }
        StoreOp::Finalize(i) => {
            let drafts: Vec<_> = all_records(fx)
                .into_iter()
                .filter(|r| r.status == SyncStatus::Draft)
                .collect();
            if let Some(record) = pick(&drafts, *i) {
                fx.finalize_draft(&record.id, None)?;
            }
        }
        StoreOp::UpdateForm(i, payload) => {
            let forms: Vec<_> = all_records(fx)
                .into_iter()
                .filter(|r| r.kind == RecordKind::Form)
                .collect();
            if let Some(record) = pick(&forms, *i) {
                fx.update_form(&record.id, payload.clone())?;
            }
        }
        StoreOp::Discard(i) => {
            if let Some(record) = pick(&all_records(fx), *i) {
                fx.discard(&record.id)?;
            }
        }
        StoreOp::StartSync(i) => {
            if let Some(item) = pick(&fx.pending_queue_items(usize::MAX), *i) {
                fx.update_status(item.id, SyncStatus::Syncing, StatusPatch::new())?;
            }
        }
        StoreOp::Complete(i) => {
            if let Some(item) = pick(&fx.items_by_status(SyncStatus::Syncing), *i) {
                fx.mark_sync_completed(item.id, &format!("srv-{}", item.id))?;
            }
        }
        StoreOp::Fail(i, status) => {
            if let Some(item) = pick(&fx.items_by_status(SyncStatus::Syncing), *i) {
                let next_retry_at =
                    (*status == SyncStatus::Failed).then(|| fx.clock.now() + Duration::minutes(2));
                fx.mark_sync_failed(
                    item.id,
                    FailureUpdate {
                        status: *status,
                        retry_count: item.retry_count + 1,
                        error: "injected".into(),
                        next_retry_at,
                    },
                )?;
            }
        }
        StoreOp::Retry(i) => {
            if let Some(item) = pick(&fx.failed_items(), *i) {
                fx.reset_for_retry(item.id)?;
            }
        }
        StoreOp::Advance(hours) => fx.clock.advance(Duration::hours(i64::from(*hours))),
        StoreOp::ClearSynced(days) => {
            fx.clear_synced_data(*days)?;
        }
        StoreOp::PurgeExpired => {
            fx.purge_expired_queue_items()?;
        }
    }
    Ok(())
}

fn is_fatal(err: &StoreError) -> bool {
    matches!(
        err,
        StoreError::Storage(_) | StoreError::Codec(_) | StoreError::Corrupted { .. }
    )
}

fn item_count(fx: &TestStore) -> usize {
    fx.status_counts().values().sum()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn operations_keep_queue_consistent(ops in store_ops_strategy(40)) {
        let fx = TestStore::memory();
        for op in &ops {
            if let Err(err) = apply(&fx, op) {
                prop_assert!(!is_fatal(&err), "{op:?} failed: {err}");
            }
            let violations = fx.verify();
            prop_assert!(violations.is_empty(), "after {op:?}: {violations:?}");
        }

        let records = fx.record_count();
        let items = item_count(&fx);
        let interrupted = fx.items_by_status(SyncStatus::Syncing).len();
        let counts = fx.status_counts();
        let sequence = fx.sequence();

        let fx = fx.reopen();
        prop_assert!(fx.verify().is_empty());
        prop_assert_eq!(fx.record_count(), records);
        prop_assert_eq!(item_count(&fx), items);
        prop_assert!(fx.items_by_status(SyncStatus::Syncing).is_empty());
        if interrupted == 0 {
            prop_assert_eq!(fx.status_counts(), counts);
            prop_assert_eq!(fx.sequence(), sequence);
        }
    }

    #[test]
    fn pending_items_come_out_in_priority_order(forms in prop::collection::vec(new_form_strategy(), 1..20)) {
        let fx = TestStore::memory();
        for form in forms {
            fx.create_form(form).unwrap();
        }
        let items: Vec<QueueItem> = fx.pending_queue_items(usize::MAX);
        for pair in items.windows(2) {
            prop_assert!((pair[0].priority, pair[0].created_at, pair[0].id)
                <= (pair[1].priority, pair[1].created_at, pair[1].id));
        }
    }

    #[test]
    fn engine_never_leaves_items_syncing(
        failures in prop::collection::vec(prop::option::of(remote_failure_strategy()), 1..30),
        form_count in 1usize..6,
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let fx = TestStore::memory();
            for _ in 0..form_count {
                fx.create_form(sample_form("tenant-a")).unwrap();
            }
            let remote = Arc::new(MockRemote::new());
            for failure in &failures {
                match failure {
                    Some(failure) => remote.push_response(Err(failure.clone())),
                    None => remote.push_response(Ok(RemoteReceipt::new("srv"))),
                }
            }
            let engine = SyncEngine::new(
                Arc::clone(&fx.store),
                Arc::clone(&remote) as Arc<dyn RemoteApi>,
                SyncConfig::default(),
            );

            for _ in 0..8 {
                engine.sync_all().await.unwrap();
                prop_assert!(fx.items_by_status(SyncStatus::Syncing).is_empty());
                prop_assert!(fx.verify().is_empty());
                fx.clock.advance(Duration::hours(2));
            }

            for item in fx.items_by_status(SyncStatus::Abandoned) {
                prop_assert!(item.retry_count >= MAX_RETRIES);
            }
            for item in fx.items_by_status(SyncStatus::Failed) {
                prop_assert!(item.retry_count < MAX_RETRIES);
                prop_assert!(item.next_retry_at.is_some());
            }
            engine.shutdown();
            Ok::<(), TestCaseError>(())
        })?;
    }
}
