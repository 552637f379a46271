//! Records, queue items and the sync status they share.

use crate::error::{StoreError, StoreResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Client-assigned identifier of a [`SourceRecord`].
///
/// Generated on the device when the record is created and kept unchanged
/// after the server assigns its own id, so it doubles as an idempotency key
/// for at-least-once submission.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    /// Generates a fresh random id.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RecordId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Auto-assigned identifier of a [`QueueItem`].
///
/// Ids are allocated in commit order, so they also encode insertion order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct QueueItemId(u64);

impl QueueItemId {
    /// Wraps a raw id.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw id.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for QueueItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Queue priority, 1 (highest) to 5 (lowest).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "u8", into = "u8")]
pub struct Priority(u8);

impl Priority {
    /// Processed first.
    pub const HIGHEST: Self = Self(1);
    /// Used when the caller does not pick one.
    pub const DEFAULT: Self = Self(3);
    /// Processed last.
    pub const LOWEST: Self = Self(5);

    /// Validates and wraps a priority.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidPriority`] outside `1..=5`.
    pub fn new(value: u8) -> StoreResult<Self> {
        if (1..=5).contains(&value) {
            Ok(Self(value))
        } else {
            Err(StoreError::InvalidPriority(value))
        }
    }

    /// Returns the numeric priority.
    #[must_use]
    pub const fn get(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for Priority {
    type Error = StoreError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Priority> for u8 {
    fn from(p: Priority) -> Self {
        p.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Sync status shared by a queue item and its record.
///
/// ```text
/// pending -> syncing -> synced
///               |  \-> auth_failed
///               |  \-> abandoned
///               v
///            failed -> syncing (scheduled retry)
///               \----> abandoned
/// failed / abandoned / auth_failed -> pending (manual retry)
/// ```
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Saved locally, not yet finalized. Records only.
    Draft,
    /// Waiting for its first (or a manually requested) attempt.
    Pending,
    /// Remote write in flight.
    Syncing,
    /// Accepted by the server.
    Synced,
    /// Last attempt failed; a retry is due at `next_retry_at`.
    Failed,
    /// Retry budget exhausted; needs a person.
    Abandoned,
    /// Rejected credentials; needs re-authentication.
    AuthFailed,
}

impl SyncStatus {
    /// Every status, in declaration order.
    pub const ALL: [SyncStatus; 7] = [
        Self::Draft,
        Self::Pending,
        Self::Syncing,
        Self::Synced,
        Self::Failed,
        Self::Abandoned,
        Self::AuthFailed,
    ];

    /// Wire and log name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Pending => "pending",
            Self::Syncing => "syncing",
            Self::Synced => "synced",
            Self::Failed => "failed",
            Self::Abandoned => "abandoned",
            Self::AuthFailed => "auth_failed",
        }
    }

    /// No further automatic processing happens from this status.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Synced | Self::Abandoned | Self::AuthFailed)
    }

    /// A queue item in this status still has work ahead of it.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Syncing | Self::Failed)
    }

    /// Eligible for a manual retry.
    #[must_use]
    pub const fn is_retryable_manually(self) -> bool {
        matches!(self, Self::Failed | Self::Abandoned | Self::AuthFailed)
    }

    /// Whether a queue item may move from `self` to `next`.
    #[must_use]
    pub fn can_transition_to(self, next: SyncStatus) -> bool {
        use SyncStatus::*;
        match (self, next) {
            (Pending, Syncing) => true,
            (Syncing, Synced | Failed | Abandoned | AuthFailed | Pending) => true,
            (Failed, Syncing | Pending | Abandoned) => true,
            (Abandoned | AuthFailed, Pending) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown sync status: {s}"))
    }
}

/// What kind of remote write a queue item performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueItemType {
    /// First submission of a compliance form.
    FormSubmission,
    /// Edit to a form the server already holds.
    FormUpdate,
    /// Evidence item carrying a photo attachment.
    PhotoUpload,
    /// Evidence item without binary content.
    Evidence,
}

impl QueueItemType {
    /// Wire and log name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::FormSubmission => "form_submission",
            Self::FormUpdate => "form_update",
            Self::PhotoUpload => "photo_upload",
            Self::Evidence => "evidence",
        }
    }
}

impl fmt::Display for QueueItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The two kinds of business record created offline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// A safety-compliance form.
    Form,
    /// A piece of evidence (observation, photo).
    Evidence,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Form => "form",
            Self::Evidence => "evidence",
        })
    }
}

/// Metadata for a photo attached to an evidence record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// File name on the device.
    pub file_name: String,
    /// MIME type, e.g. `image/jpeg`.
    pub media_type: String,
    /// Size of the file in bytes.
    pub size_bytes: u64,
}

/// A form or evidence item created on the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    /// Client-assigned id.
    pub id: RecordId,
    /// Form or evidence.
    pub kind: RecordKind,
    /// Owning tenant.
    pub tenant_id: String,
    /// Worker who captured it, if known.
    pub worker_id: Option<String>,
    /// Opaque structured content.
    pub payload: serde_json::Value,
    /// Photo metadata for evidence.
    pub attachment: Option<Attachment>,
    /// Mirrors the status of the latest queue item.
    pub status: SyncStatus,
    /// Server-assigned id once synced.
    pub server_id: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
    /// Number of submission attempts made.
    pub attempts: u32,
    /// Human-readable reason of the last failure.
    pub last_error: Option<String>,
}

/// A durable unit of pending sync work, paired with one [`SourceRecord`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Auto-assigned id.
    pub id: QueueItemId,
    /// Remote write to perform.
    pub item_type: QueueItemType,
    /// JSON-encoded [`QueuePayload`].
    pub payload: String,
    /// 1 (highest) to 5 (lowest).
    pub priority: Priority,
    /// Current status.
    pub status: SyncStatus,
    /// Failures counted against the retry budget.
    pub retry_count: u32,
    /// Reason of the last failure.
    pub last_error: Option<String>,
    /// Earliest time of the next automatic attempt.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Time of the most recent attempt.
    pub last_retry_at: Option<DateTime<Utc>>,
    /// Kind of the owning record.
    pub record_kind: RecordKind,
    /// Owning record.
    pub record_id: RecordId,
    /// Owning tenant, copied from the record for indexed lookups.
    pub tenant_id: String,
    /// Server-assigned id once synced.
    pub server_id: Option<String>,
    /// Garbage-collection deadline, set once synced.
    pub delete_after: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

impl QueueItem {
    /// Whether the item may be picked up by a bulk pass at `now`.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        matches!(self.status, SyncStatus::Pending | SyncStatus::Failed)
            && self.next_retry_at.map_or(true, |at| at <= now)
    }

    /// Decodes the submission payload.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Codec`] if the stored JSON is malformed.
    pub fn decode_payload(&self) -> StoreResult<QueuePayload> {
        Ok(serde_json::from_str(&self.payload)?)
    }
}

/// What a queue item sends to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuePayload {
    /// Client id of the record, used by the server for de-duplication.
    pub local_id: RecordId,
    /// Owning tenant.
    pub tenant_id: String,
    /// Worker who captured the record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    /// Server id targeted by a `form_update`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    /// Record content.
    pub data: serde_json::Value,
    /// Photo metadata for `photo_upload`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
}

impl QueuePayload {
    pub(crate) fn for_record(record: &SourceRecord) -> Self {
        Self {
            local_id: record.id.clone(),
            tenant_id: record.tenant_id.clone(),
            worker_id: record.worker_id.clone(),
            server_id: record.server_id.clone(),
            data: record.payload.clone(),
            attachment: record.attachment.clone(),
        }
    }
}

/// Input for a new form.
#[derive(Debug, Clone)]
pub struct NewForm {
    /// Owning tenant.
    pub tenant_id: String,
    /// Capturing worker.
    pub worker_id: Option<String>,
    /// Form content.
    pub payload: serde_json::Value,
    /// Queue priority; the store default when `None`.
    pub priority: Option<Priority>,
}

impl NewForm {
    /// Creates a form for `tenant_id` with the given content.
    pub fn new(tenant_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            worker_id: None,
            payload,
            priority: None,
        }
    }

    /// Sets the capturing worker.
    pub fn with_worker(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    /// Sets the queue priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// Input for a new evidence item.
#[derive(Debug, Clone)]
pub struct NewEvidence {
    /// Owning tenant.
    pub tenant_id: String,
    /// Capturing worker.
    pub worker_id: Option<String>,
    /// Evidence content.
    pub payload: serde_json::Value,
    /// Photo, if any. Evidence with a photo is queued as `photo_upload`.
    pub attachment: Option<Attachment>,
    /// Queue priority; the store default when `None`.
    pub priority: Option<Priority>,
}

impl NewEvidence {
    /// Creates an evidence item for `tenant_id` with the given content.
    pub fn new(tenant_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            worker_id: None,
            payload,
            attachment: None,
            priority: None,
        }
    }

    /// Sets the capturing worker.
    pub fn with_worker(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    /// Attaches a photo.
    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachment = Some(attachment);
        self
    }

    /// Sets the queue priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// Field changes applied together with a status change.
///
/// Unset fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusPatch {
    pub(crate) retry_count: Option<u32>,
    pub(crate) last_error: Option<Option<String>>,
    pub(crate) next_retry_at: Option<Option<DateTime<Utc>>>,
}

impl StatusPatch {
    /// An empty patch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the retry count.
    #[must_use]
    pub fn retry_count(mut self, count: u32) -> Self {
        self.retry_count = Some(count);
        self
    }

    /// Sets or clears the last error.
    #[must_use]
    pub fn last_error(mut self, error: Option<String>) -> Self {
        self.last_error = Some(error);
        self
    }

    /// Sets or clears the next retry time.
    #[must_use]
    pub fn next_retry_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.next_retry_at = Some(at);
        self
    }
}

/// Outcome of a failed attempt, written by [`crate::LocalStore::mark_sync_failed`].
#[derive(Debug, Clone, PartialEq)]
pub struct FailureUpdate {
    /// `failed`, `abandoned` or `auth_failed`.
    pub status: SyncStatus,
    /// Retry count after this failure.
    pub retry_count: u32,
    /// Human-readable reason.
    pub error: String,
    /// When the next automatic attempt is due; `None` for terminal outcomes.
    pub next_retry_at: Option<DateTime<Utc>>,
}

/// Number of rows removed by a purge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PurgeCounts {
    /// Source records removed.
    pub records: usize,
    /// Queue items removed.
    pub queue_items: usize,
}
