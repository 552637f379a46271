//! Test fixtures for stores and engines.
//!
//! Every fixture runs on a [`ManualClock`] starting at [`fixed_start`], so
//! retention windows and retry delays are driven by the test, not by the
//! wall clock.

use crate::faults::SharedMemoryBackend;
use chrono::{DateTime, TimeZone, Utc};
use fieldsync_engine::{MockRemote, RemoteApi, SyncConfig, SyncEngine};
use fieldsync_storage::FileBackend;
use fieldsync_store::{
    Attachment, Clock, LocalStore, ManualClock, NewEvidence, NewForm, RecordId, StoreConfig,
};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Name of the journal file inside a file fixture's directory.
pub const JOURNAL_FILE: &str = "queue.fsj";

/// Start time of every fixture clock: 2024-03-04 08:00 UTC.
pub fn fixed_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 4, 8, 0, 0)
        .single()
        .expect("valid fixture timestamp")
}

enum Location {
    Memory(SharedMemoryBackend),
    File(TempDir),
}

/// A local store with a manual clock and automatic cleanup.
pub struct TestStore {
    /// The store instance.
    pub store: Arc<LocalStore>,
    /// The clock the store reads.
    pub clock: Arc<ManualClock>,
    config: StoreConfig,
    location: Location,
}

impl TestStore {
    /// Creates an in-memory store whose bytes survive [`TestStore::reopen`].
    pub fn memory() -> Self {
        Self::memory_with(StoreConfig::default())
    }

    /// Creates an in-memory store with `config`.
    pub fn memory_with(config: StoreConfig) -> Self {
        let clock = Arc::new(ManualClock::new(fixed_start()));
        let backend = SharedMemoryBackend::new();
        let store = LocalStore::open(
            Box::new(backend.clone()),
            config.clone(),
            Arc::clone(&clock) as Arc<dyn Clock>,
        )
        .expect("Failed to open in-memory store");
        Self {
            store: Arc::new(store),
            clock,
            config,
            location: Location::Memory(backend),
        }
    }

    /// Creates a store backed by a journal file in a temporary directory.
    pub fn file() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let clock = Arc::new(ManualClock::new(fixed_start()));
        let config = StoreConfig::default();
        let store = open_file_store(&temp_dir.path().join(JOURNAL_FILE), &config, &clock);
        Self {
            store: Arc::new(store),
            clock,
            config,
            location: Location::File(temp_dir),
        }
    }

    /// Journal path if file-based, `None` if in-memory.
    pub fn path(&self) -> Option<PathBuf> {
        match &self.location {
            Location::File(dir) => Some(dir.path().join(JOURNAL_FILE)),
            Location::Memory(_) => None,
        }
    }

    /// The shared journal bytes if in-memory.
    pub fn backend(&self) -> Option<&SharedMemoryBackend> {
        match &self.location {
            Location::Memory(backend) => Some(backend),
            Location::File(_) => None,
        }
    }

    /// Drops the store and opens the same journal again, keeping the clock.
    ///
    /// This is how tests simulate an app restart.
    pub fn reopen(self) -> Self {
        let Self {
            store,
            clock,
            config,
            location,
        } = self;
        drop(store);

        let store = match &location {
            Location::Memory(backend) => LocalStore::open(
                Box::new(backend.clone()),
                config.clone(),
                Arc::clone(&clock) as Arc<dyn Clock>,
            )
            .expect("Failed to reopen in-memory store"),
            Location::File(dir) => open_file_store(&dir.path().join(JOURNAL_FILE), &config, &clock),
        };
        Self {
            store: Arc::new(store),
            clock,
            config,
            location,
        }
    }
}

fn open_file_store(path: &Path, config: &StoreConfig, clock: &Arc<ManualClock>) -> LocalStore {
    let backend = FileBackend::open_with_create_dirs(path).expect("Failed to create journal file");
    LocalStore::open(
        Box::new(backend),
        config.clone(),
        Arc::clone(clock) as Arc<dyn Clock>,
    )
    .expect("Failed to open file store")
}

impl std::ops::Deref for TestStore {
    type Target = LocalStore;

    fn deref(&self) -> &Self::Target {
        &self.store
    }
}

/// A sync engine over a [`TestStore`], submitting to a [`MockRemote`].
pub struct TestEngine {
    /// The engine instance.
    pub engine: Arc<SyncEngine>,
    /// The scripted remote.
    pub remote: Arc<MockRemote>,
    /// The store fixture.
    pub fixture: TestStore,
}

impl TestEngine {
    /// Creates an engine with the default configuration over an in-memory store.
    pub fn new() -> Self {
        Self::with_config(SyncConfig::default())
    }

    /// Creates an engine with `config` over an in-memory store.
    pub fn with_config(config: SyncConfig) -> Self {
        Self::over(TestStore::memory(), config)
    }

    /// Creates an engine over an existing store fixture.
    pub fn over(fixture: TestStore, config: SyncConfig) -> Self {
        let remote = Arc::new(MockRemote::new());
        let engine = SyncEngine::new(
            Arc::clone(&fixture.store),
            Arc::clone(&remote) as Arc<dyn RemoteApi>,
            config,
        );
        Self {
            engine,
            remote,
            fixture,
        }
    }

    /// The store the engine drives.
    pub fn store(&self) -> &Arc<LocalStore> {
        &self.fixture.store
    }

    /// The fixture clock.
    pub fn clock(&self) -> &ManualClock {
        &self.fixture.clock
    }
}

impl Default for TestEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// A site inspection form for `tenant_id`.
pub fn sample_form(tenant_id: &str) -> NewForm {
    NewForm::new(
        tenant_id,
        json!({
            "form_type": "site_inspection",
            "site": "North yard",
            "answers": {"ppe_worn": true, "hazards": ["trip"]},
        }),
    )
    .with_worker("worker-1")
}

/// A written observation for `tenant_id`.
pub fn sample_evidence(tenant_id: &str) -> NewEvidence {
    NewEvidence::new(
        tenant_id,
        json!({"note": "Guard rail loose on level 2"}),
    )
    .with_worker("worker-1")
}

/// A photo evidence item for `tenant_id`.
pub fn sample_photo(tenant_id: &str) -> NewEvidence {
    sample_evidence(tenant_id).with_attachment(Attachment {
        file_name: "IMG_0042.jpg".into(),
        media_type: "image/jpeg".into(),
        size_bytes: 482_113,
    })
}

/// Test scenario helpers.
pub mod scenarios {
    use super::*;

    /// A store holding `count` forms spread over two tenants.
    pub fn populated_store(count: usize) -> (TestStore, Vec<RecordId>) {
        let fixture = TestStore::memory();
        let ids = (0..count)
            .map(|i| {
                let tenant = if i % 2 == 0 { "tenant-a" } else { "tenant-b" };
                fixture
                    .create_form(sample_form(tenant))
                    .expect("Failed to create form")
            })
            .collect();
        (fixture, ids)
    }
}
