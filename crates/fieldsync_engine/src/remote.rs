//! Remote write API abstraction.

use async_trait::async_trait;
use fieldsync_store::{QueueItem, QueueItemId, QueueItemType, QueuePayload, RecordId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

/// One remote write, built from a queue item.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRequest {
    /// Queue item being submitted.
    pub queue_item_id: QueueItemId,
    /// What kind of write this is.
    pub item_type: QueueItemType,
    /// Owning tenant.
    pub tenant_id: String,
    /// Client id of the source record; the server de-duplicates on it.
    pub local_id: RecordId,
    /// Server id of the form, required for `form_update`.
    pub server_id: Option<String>,
    /// Body to send.
    pub body: QueuePayload,
}

impl RemoteRequest {
    /// Builds the request for `item`.
    ///
    /// # Errors
    ///
    /// [`RemoteFailure::InvalidRequest`] if the stored payload does not
    /// decode, or an update has no server id to target.
    pub fn from_item(item: &QueueItem) -> Result<Self, RemoteFailure> {
        let body = item
            .decode_payload()
            .map_err(|e| RemoteFailure::InvalidRequest(e.to_string()))?;

        let server_id = match item.item_type {
            QueueItemType::FormUpdate => {
                let id = body.server_id.clone().or_else(|| item.server_id.clone());
                if id.is_none() {
                    return Err(RemoteFailure::InvalidRequest(
                        "form update without a server id".into(),
                    ));
                }
                id
            }
            QueueItemType::FormSubmission | QueueItemType::PhotoUpload | QueueItemType::Evidence => {
                None
            }
        };

        Ok(Self {
            queue_item_id: item.id,
            item_type: item.item_type,
            tenant_id: item.tenant_id.clone(),
            local_id: item.record_id.clone(),
            server_id,
            body,
        })
    }
}

/// The server accepted a write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteReceipt {
    /// Id the server assigned (or already had) for the record.
    pub server_id: String,
}

impl RemoteReceipt {
    /// Creates a receipt.
    pub fn new(server_id: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
        }
    }
}

/// Why a remote write did not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteFailure {
    /// The request never got a response: DNS, refused, reset, offline.
    Network(String),
    /// No response within the request timeout.
    Timeout,
    /// The server answered with a non-success status.
    Http {
        /// HTTP status code.
        status: u16,
        /// Response body, possibly empty.
        message: String,
    },
    /// A success status with a body that could not be understood.
    MalformedResponse(String),
    /// The request could not be built from the queue item.
    InvalidRequest(String),
}

impl RemoteFailure {
    /// Creates an HTTP failure.
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::Http {
            status,
            message: message.into(),
        }
    }

    /// Creates a network failure.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network(message.into())
    }
}

impl fmt::Display for RemoteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network(message) => write!(f, "network error: {message}"),
            Self::Timeout => f.write_str("request timed out"),
            Self::Http { status, message } if message.is_empty() => write!(f, "HTTP {status}"),
            Self::Http { status, message } => write!(f, "HTTP {status}: {message}"),
            Self::MalformedResponse(message) => write!(f, "malformed response: {message}"),
            Self::InvalidRequest(message) => write!(f, "invalid request: {message}"),
        }
    }
}

/// Persists queued writes on the server.
///
/// Implementations must be safe to call again for the same record: the
/// engine delivers at least once and relies on the server de-duplicating
/// by `local_id`.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Submits one write.
    async fn submit(&self, request: &RemoteRequest) -> Result<RemoteReceipt, RemoteFailure>;
}

/// A scripted remote for testing.
///
/// Responses queued with [`MockRemote::push_response`] are returned in
/// order; once the script is exhausted every call gets the fallback, which
/// defaults to success with a generated server id.
#[derive(Debug, Default)]
pub struct MockRemote {
    script: Mutex<VecDeque<Result<RemoteReceipt, RemoteFailure>>>,
    fallback: Mutex<Option<Result<RemoteReceipt, RemoteFailure>>>,
    calls: Mutex<Vec<RemoteRequest>>,
    delay: Mutex<Option<Duration>>,
}

impl MockRemote {
    /// Creates a remote that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the response for the next unscripted call.
    pub fn push_response(&self, response: Result<RemoteReceipt, RemoteFailure>) {
        self.script.lock().push_back(response);
    }

    /// Queues `count` copies of a failure.
    pub fn push_failures(&self, failure: RemoteFailure, count: usize) {
        let mut script = self.script.lock();
        for _ in 0..count {
            script.push_back(Err(failure.clone()));
        }
    }

    /// Sets the response used once the script runs out.
    pub fn set_fallback(&self, response: Result<RemoteReceipt, RemoteFailure>) {
        *self.fallback.lock() = Some(response);
    }

    /// Makes every call take `delay` before answering.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// Requests received so far.
    pub fn calls(&self) -> Vec<RemoteRequest> {
        self.calls.lock().clone()
    }

    /// Number of requests received so far.
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl RemoteApi for MockRemote {
    async fn submit(&self, request: &RemoteRequest) -> Result<RemoteReceipt, RemoteFailure> {
        let call = {
            let mut calls = self.calls.lock();
            calls.push(request.clone());
            calls.len()
        };

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self.script.lock().pop_front();
        scripted
            .or_else(|| self.fallback.lock().clone())
            .unwrap_or_else(|| Ok(RemoteReceipt::new(format!("srv-{call}"))))
    }
}
