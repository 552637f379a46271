//! CLI command implementations.

pub mod dump_journal;
pub mod inspect;
pub mod list;
pub mod purge;
pub mod reset;
pub mod verify;

use crate::error::{CliError, CliResult};
use fieldsync_storage::{FileBackend, InMemoryBackend, StorageBackend};
use fieldsync_store::{LocalStore, StoreConfig, SystemClock};
use std::path::Path;
use std::sync::Arc;

/// Reads the whole journal file.
pub(crate) fn read_journal(path: &Path) -> CliResult<Vec<u8>> {
    if !path.exists() {
        return Err(CliError::NotFound(path.to_path_buf()));
    }
    let backend = FileBackend::open(path)?;
    let size = backend.size()?;
    Ok(backend.read_at(0, size as usize)?)
}

/// Replays a copy of the journal in memory.
///
/// Read-only commands use this so they never truncate a torn tail or
/// requeue interrupted items in the file itself.
pub(crate) fn open_snapshot(path: &Path) -> CliResult<LocalStore> {
    let bytes = read_journal(path)?;
    Ok(LocalStore::open(
        Box::new(InMemoryBackend::with_data(bytes)),
        StoreConfig::default(),
        Arc::new(SystemClock),
    )?)
}

/// Opens the journal file for writing.
pub(crate) fn open_store(path: &Path) -> CliResult<LocalStore> {
    if !path.exists() {
        return Err(CliError::NotFound(path.to_path_buf()));
    }
    Ok(LocalStore::open_file(path, StoreConfig::default())?)
}
