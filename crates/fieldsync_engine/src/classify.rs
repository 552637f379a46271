//! Classification of remote failures.

use crate::remote::RemoteFailure;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Category of a failed remote write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncErrorKind {
    /// Transport or connection failure.
    Network,
    /// Client-side timeout.
    Timeout,
    /// Credentials rejected (401/403).
    Auth,
    /// Server reported a conflict (409).
    Conflict,
    /// Request body too large (413).
    PayloadTooLarge,
    /// Server-side failure (5xx).
    Server,
    /// Anything else.
    Unknown,
}

impl SyncErrorKind {
    /// Log and wire name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::Auth => "auth",
            Self::Conflict => "conflict",
            Self::PayloadTooLarge => "payload_too_large",
            Self::Server => "server",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for SyncErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure: what went wrong and how the engine reacts to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncError {
    /// Category.
    pub kind: SyncErrorKind,
    /// Human-readable description, stored as the item's `last_error`.
    pub message: String,
    /// HTTP status, when there was one.
    pub status_code: Option<u16>,
    /// Whether a retry is scheduled.
    pub retryable: bool,
    /// Whether the failure uses up one of the item's retries.
    pub counts_against_retry: bool,
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Classifies a remote failure.
///
/// Connectivity problems (network, timeout) are retried without limit
/// since they say nothing about the item itself. Rejected credentials are
/// never retried automatically.
pub fn classify(failure: &RemoteFailure) -> SyncError {
    let (kind, status_code) = match failure {
        RemoteFailure::Network(_) => (SyncErrorKind::Network, None),
        RemoteFailure::Timeout => (SyncErrorKind::Timeout, None),
        RemoteFailure::Http { status, .. } => (kind_for_status(*status), Some(*status)),
        RemoteFailure::MalformedResponse(_) | RemoteFailure::InvalidRequest(_) => {
            (SyncErrorKind::Unknown, None)
        }
    };

    let (retryable, counts_against_retry) = match kind {
        SyncErrorKind::Network | SyncErrorKind::Timeout => (true, false),
        SyncErrorKind::Auth => (false, false),
        SyncErrorKind::Conflict
        | SyncErrorKind::PayloadTooLarge
        | SyncErrorKind::Server
        | SyncErrorKind::Unknown => (true, true),
    };

    SyncError {
        kind,
        message: failure.to_string(),
        status_code,
        retryable,
        counts_against_retry,
    }
}

fn kind_for_status(status: u16) -> SyncErrorKind {
    match status {
        401 | 403 => SyncErrorKind::Auth,
        409 => SyncErrorKind::Conflict,
        413 => SyncErrorKind::PayloadTooLarge,
        500.. => SyncErrorKind::Server,
        _ => SyncErrorKind::Unknown,
    }
}
