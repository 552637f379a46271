//! Fault injection for store tests.
//!
//! [`SharedMemoryBackend`] lets a test keep a handle on the journal bytes
//! after the store that owns the backend is dropped, so the same bytes can
//! be reopened to simulate a process restart.
//!
//! [`FlakyBackend`] wraps any backend and fails or tears writes on request.
//! A torn write leaves a prefix of the frame behind and then behaves like a
//! dead process: every later write and truncate fails until healed.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let shared = SharedMemoryBackend::new();
//! let (flaky, faults) = FlakyBackend::new(shared.clone());
//! let store = LocalStore::open(Box::new(flaky), StoreConfig::default(), clock)?;
//!
//! faults.tear_next_append(7);
//! assert!(store.create_form(sample_form("t")).is_err());
//! drop(store);
//!
//! let reopened = LocalStore::open(Box::new(shared), StoreConfig::default(), clock)?;
//! ```

use fieldsync_storage::{StorageBackend, StorageError, StorageResult};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// An in-memory backend whose clones share the same bytes.
#[derive(Debug, Clone, Default)]
pub struct SharedMemoryBackend {
    bytes: Arc<RwLock<Vec<u8>>>,
}

impl SharedMemoryBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the stored bytes.
    pub fn data(&self) -> Vec<u8> {
        self.bytes.read().clone()
    }

    /// Number of stored bytes.
    pub fn len(&self) -> usize {
        self.bytes.read().len()
    }

    /// Whether nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.bytes.read().is_empty()
    }

    /// Overwrites one byte, for corruption tests.
    pub fn flip_byte(&self, offset: usize) {
        let mut bytes = self.bytes.write();
        if let Some(b) = bytes.get_mut(offset) {
            *b ^= 0xFF;
        }
    }
}

impl StorageBackend for SharedMemoryBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let bytes = self.bytes.read();
        let size = bytes.len() as u64;
        let end = offset.saturating_add(len as u64);
        if end > size {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }
        Ok(bytes[offset as usize..end as usize].to_vec())
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let mut bytes = self.bytes.write();
        let offset = bytes.len() as u64;
        bytes.extend_from_slice(data);
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn sync(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.bytes.read().len() as u64)
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let mut bytes = self.bytes.write();
        let size = bytes.len() as u64;
        if new_size > size {
            return Err(StorageError::TruncatePastEnd {
                requested: new_size,
                size,
            });
        }
        bytes.truncate(new_size as usize);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct FaultState {
    fail_appends: AtomicUsize,
    fail_syncs: AtomicUsize,
    tear_at: Mutex<Option<usize>>,
    crashed: AtomicBool,
    appends: AtomicUsize,
}

/// Controls the faults of a [`FlakyBackend`] from outside the store.
#[derive(Debug, Clone)]
pub struct FaultHandle {
    state: Arc<FaultState>,
}

impl FaultHandle {
    /// Rejects the next `n` appends without writing anything.
    pub fn fail_next_appends(&self, n: usize) {
        self.state.fail_appends.store(n, Ordering::SeqCst);
    }

    /// Fails the next `n` flush or sync calls after a successful append.
    pub fn fail_next_syncs(&self, n: usize) {
        self.state.fail_syncs.store(n, Ordering::SeqCst);
    }

    /// Writes only the first `keep` bytes of the next append, then crashes.
    pub fn tear_next_append(&self, keep: usize) {
        *self.state.tear_at.lock() = Some(keep);
    }

    /// Whether a torn write has crashed the backend.
    pub fn is_crashed(&self) -> bool {
        self.state.crashed.load(Ordering::SeqCst)
    }

    /// Number of appends attempted so far.
    pub fn appends(&self) -> usize {
        self.state.appends.load(Ordering::SeqCst)
    }

    /// Clears every pending fault and the crashed state.
    pub fn heal(&self) {
        self.state.fail_appends.store(0, Ordering::SeqCst);
        self.state.fail_syncs.store(0, Ordering::SeqCst);
        *self.state.tear_at.lock() = None;
        self.state.crashed.store(false, Ordering::SeqCst);
    }
}

/// A backend wrapper that injects write failures.
#[derive(Debug)]
pub struct FlakyBackend<B: StorageBackend> {
    inner: B,
    state: Arc<FaultState>,
}

impl<B: StorageBackend> FlakyBackend<B> {
    /// Wraps `inner`, returning the backend and its fault handle.
    pub fn new(inner: B) -> (Self, FaultHandle) {
        let state = Arc::new(FaultState::default());
        let handle = FaultHandle {
            state: Arc::clone(&state),
        };
        (Self { inner, state }, handle)
    }

    fn check_alive(&self) -> StorageResult<()> {
        if self.state.crashed.load(Ordering::SeqCst) {
            return Err(StorageError::WriteRejected("backend crashed".into()));
        }
        Ok(())
    }
}

/// Decrements `counter` if it is positive; true when a fault fires.
fn take(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl<B: StorageBackend> StorageBackend for FlakyBackend<B> {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        self.inner.read_at(offset, len)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        self.check_alive()?;
        self.state.appends.fetch_add(1, Ordering::SeqCst);

        if take(&self.state.fail_appends) {
            return Err(StorageError::WriteRejected("injected append failure".into()));
        }

        if let Some(keep) = self.state.tear_at.lock().take() {
            let keep = keep.min(data.len());
            self.inner.append(&data[..keep])?;
            self.state.crashed.store(true, Ordering::SeqCst);
            return Err(StorageError::WriteRejected("torn write".into()));
        }

        self.inner.append(data)
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.check_alive()?;
        if take(&self.state.fail_syncs) {
            return Err(StorageError::WriteRejected("injected flush failure".into()));
        }
        self.inner.flush()
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.check_alive()?;
        if take(&self.state.fail_syncs) {
            return Err(StorageError::WriteRejected("injected sync failure".into()));
        }
        self.inner.sync()
    }

    fn size(&self) -> StorageResult<u64> {
        self.inner.size()
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        self.check_alive()?;
        self.inner.truncate(new_size)
    }
}
