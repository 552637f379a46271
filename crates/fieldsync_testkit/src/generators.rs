//! Property-based test generators using proptest.
//!
//! Provides strategies for generating random queue inputs, remote failures
//! and operation sequences against a local store.

use fieldsync_engine::RemoteFailure;
use fieldsync_store::{Attachment, NewEvidence, NewForm, Priority, SyncStatus};
use proptest::prelude::*;
use serde_json::{json, Value};

/// Tenants used by generated records.
pub const TENANTS: [&str; 3] = ["tenant-a", "tenant-b", "tenant-c"];

/// Strategy for valid priorities (1 to 5).
pub fn priority_strategy() -> impl Strategy<Value = Priority> {
    (1u8..=5).prop_map(|p| Priority::new(p).expect("priority in range"))
}

/// Strategy for any sync status.
pub fn status_strategy() -> impl Strategy<Value = SyncStatus> {
    prop::sample::select(SyncStatus::ALL.to_vec())
}

/// Strategy for a tenant id.
pub fn tenant_strategy() -> impl Strategy<Value = String> {
    prop::sample::select(TENANTS.to_vec()).prop_map(str::to_string)
}

/// Strategy for small JSON form content.
pub fn payload_strategy() -> impl Strategy<Value = Value> {
    prop::collection::btree_map("[a-z]{1,8}", any::<i32>(), 0..5).prop_map(|fields| {
        let map = fields
            .into_iter()
            .map(|(k, v)| (k, json!(v)))
            .collect::<serde_json::Map<_, _>>();
        Value::Object(map)
    })
}

/// Strategy for a new form with an optional priority.
pub fn new_form_strategy() -> impl Strategy<Value = NewForm> {
    (
        tenant_strategy(),
        payload_strategy(),
        prop::option::of(priority_strategy()),
    )
        .prop_map(|(tenant, payload, priority)| {
            let form = NewForm::new(tenant, payload);
            match priority {
                Some(p) => form.with_priority(p),
                None => form,
            }
        })
}

/// Strategy for a new evidence item, with a photo about half the time.
pub fn new_evidence_strategy() -> impl Strategy<Value = NewEvidence> {
    (tenant_strategy(), payload_strategy(), any::<bool>(), 1u64..5_000_000).prop_map(
        |(tenant, payload, photo, size)| {
            let evidence = NewEvidence::new(tenant, payload);
            if photo {
                evidence.with_attachment(Attachment {
                    file_name: "photo.jpg".into(),
                    media_type: "image/jpeg".into(),
                    size_bytes: size,
                })
            } else {
                evidence
            }
        },
    )
}

/// Strategy for HTTP status codes a server may answer with.
pub fn http_status_strategy() -> impl Strategy<Value = u16> {
    prop_oneof![
        Just(400u16),
        Just(401),
        Just(403),
        Just(404),
        Just(409),
        Just(422),
        Just(429),
        500u16..600,
    ]
}

/// Strategy for any remote failure.
pub fn remote_failure_strategy() -> impl Strategy<Value = RemoteFailure> {
    prop_oneof![
        "[a-z ]{0,20}".prop_map(RemoteFailure::Network),
        Just(RemoteFailure::Timeout),
        (http_status_strategy(), "[a-z ]{0,20}")
            .prop_map(|(status, message)| RemoteFailure::http(status, message)),
        "[a-z ]{0,20}".prop_map(RemoteFailure::MalformedResponse),
        "[a-z ]{0,20}".prop_map(RemoteFailure::InvalidRequest),
    ]
}

/// One operation against a store, addressed by index into the records or
/// queue items that exist when it runs.
#[derive(Debug, Clone)]
pub enum StoreOp {
    /// Create and queue a form.
    CreateForm(NewForm),
    /// Create and queue evidence.
    CreateEvidence(NewEvidence),
    /// Save a form as a draft.
    SaveDraft(NewForm),
    /// Finalize the n-th draft.
    Finalize(usize),
    /// Edit the n-th form.
    UpdateForm(usize, Value),
    /// Discard the n-th record.
    Discard(usize),
    /// Start syncing the n-th pending item.
    StartSync(usize),
    /// Complete the n-th syncing item.
    Complete(usize),
    /// Fail the n-th syncing item with the given terminal-or-not status.
    Fail(usize, SyncStatus),
    /// Manually retry the n-th retryable item.
    Retry(usize),
    /// Advance the clock by this many hours.
    Advance(u32),
    /// Purge synced records older than this many days.
    ClearSynced(u32),
    /// Drop expired synced queue items.
    PurgeExpired,
}

/// Strategy for a single store operation.
pub fn store_op_strategy() -> impl Strategy<Value = StoreOp> {
    let index = 0usize..8;
    let failure = prop::sample::select(vec![
        SyncStatus::Failed,
        SyncStatus::Abandoned,
        SyncStatus::AuthFailed,
    ]);
    prop_oneof![
        3 => new_form_strategy().prop_map(StoreOp::CreateForm),
        2 => new_evidence_strategy().prop_map(StoreOp::CreateEvidence),
        1 => new_form_strategy().prop_map(StoreOp::SaveDraft),
        1 => index.clone().prop_map(StoreOp::Finalize),
        2 => (index.clone(), payload_strategy()).prop_map(|(i, p)| StoreOp::UpdateForm(i, p)),
        1 => index.clone().prop_map(StoreOp::Discard),
        3 => index.clone().prop_map(StoreOp::StartSync),
        2 => index.clone().prop_map(StoreOp::Complete),
        2 => (index.clone(), failure).prop_map(|(i, s)| StoreOp::Fail(i, s)),
        1 => index.prop_map(StoreOp::Retry),
        1 => (1u32..400).prop_map(StoreOp::Advance),
        1 => (0u32..10).prop_map(StoreOp::ClearSynced),
        1 => Just(StoreOp::PurgeExpired),
    ]
}

/// Strategy for a sequence of store operations.
pub fn store_ops_strategy(max_len: usize) -> impl Strategy<Value = Vec<StoreOp>> {
    prop::collection::vec(store_op_strategy(), 1..max_len)
}
