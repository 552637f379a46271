//! # FieldSync Engine
//!
//! Offline synchronization engine for field records.
//!
//! This crate provides:
//! - Sync state machine (pending → syncing → synced / failed / abandoned / auth_failed)
//! - Error classification of remote failures
//! - Retry scheduling with exponential backoff
//! - Remote write API abstraction with an HTTP adapter
//! - Connectivity-triggered sync
//!
//! ## Key Invariants
//!
//! - Delivery is at least once; the server de-duplicates by record id
//! - Connectivity failures never use up an item's retries
//! - Rejected credentials are never retried automatically
//! - One bulk pass and one remote write at a time per engine
//! - Remote failures are recorded on the item, never returned as errors

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod classify;
mod config;
mod connectivity;
mod engine;
mod error;
mod http;
mod remote;
mod scheduler;

pub use classify::{classify, SyncError, SyncErrorKind};
pub use config::{RetryConfig, SyncConfig, DEFAULT_BATCH_SIZE, MAX_RETRIES};
pub use connectivity::ConnectivityWatcher;
pub use engine::{
    EngineEvent, ItemOutcome, Notification, NotificationLevel, SyncEngine, SyncObserver, SyncStats,
};
pub use error::{EngineError, EngineResult};
pub use http::{HttpClient, HttpMethod, HttpRemote, HttpResponse};
pub use remote::{MockRemote, RemoteApi, RemoteFailure, RemoteReceipt, RemoteRequest};
pub use scheduler::{backoff_delay, RetryScheduler};
