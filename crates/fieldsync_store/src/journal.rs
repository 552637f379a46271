//! Append-only journal of committed transactions.
//!
//! Each commit is written as one framed entry:
//!
//! ```text
//! | magic "FSJL" (4) | version (2) | length (4) | CBOR payload | crc32 (4) |
//! ```
//!
//! An entry is either fully present with a valid checksum or it is ignored,
//! which is what makes a multi-row commit atomic on disk. Only the final
//! entry may be damaged (a write torn by a crash); it is cut off on open.
//! Damage anywhere else is reported as corruption.

use crate::error::{StoreError, StoreResult};
use crate::model::{QueueItem, QueueItemId, RecordId, SourceRecord};
use fieldsync_storage::StorageBackend;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Magic bytes opening every journal entry.
pub const JOURNAL_MAGIC: [u8; 4] = *b"FSJL";

/// Current journal format version.
pub const JOURNAL_VERSION: u16 = 1;

/// magic (4) + version (2) + length (4)
const HEADER_SIZE: usize = 10;
const CRC_SIZE: usize = 4;

/// A row-level change inside a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Mutation {
    /// Insert or replace a source record.
    PutRecord(SourceRecord),
    /// Remove a source record.
    DeleteRecord(RecordId),
    /// Insert or replace a queue item.
    PutQueueItem(QueueItem),
    /// Remove a queue item.
    DeleteQueueItem(QueueItemId),
}

/// One committed transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Commit sequence number, strictly increasing.
    pub sequence: u64,
    /// Changes applied by the commit, in order.
    pub mutations: Vec<Mutation>,
}

impl JournalEntry {
    /// Encodes the entry as one framed, checksummed journal record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Codec`] if the entry cannot be serialized.
    pub fn encode(&self) -> StoreResult<Vec<u8>> {
        let mut payload = Vec::new();
        ciborium::into_writer(self, &mut payload).map_err(|e| StoreError::codec(e.to_string()))?;

        let len = u32::try_from(payload.len())
            .map_err(|_| StoreError::codec("journal entry exceeds 4 GiB"))?;

        let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
        frame.extend_from_slice(&JOURNAL_MAGIC);
        frame.extend_from_slice(&JOURNAL_VERSION.to_le_bytes());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&payload);
        let crc = crc32(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());
        Ok(frame)
    }
}

/// Result of scanning a journal.
#[derive(Debug, Default)]
pub struct Scan {
    /// Entries with their offsets.
    pub entries: Vec<(u64, JournalEntry)>,
    /// Offset where the valid prefix ends.
    pub valid_len: u64,
    /// Bytes after `valid_len` belonging to a torn final entry.
    pub torn_bytes: u64,
}

/// Reads every intact entry from `backend` without modifying it.
///
/// # Errors
///
/// Returns [`StoreError::Corrupted`] if a damaged entry is followed by more
/// data, or if an intact frame does not decode.
pub fn scan(backend: &dyn StorageBackend) -> StoreResult<Scan> {
    let size = backend.size()?;
    let mut scan = Scan::default();
    let mut offset = 0u64;

    while offset < size {
        let remaining = size - offset;
        if remaining < (HEADER_SIZE + CRC_SIZE) as u64 {
            scan.torn_bytes = remaining;
            break;
        }

        let header = backend.read_at(offset, HEADER_SIZE)?;
        if header[0..4] != JOURNAL_MAGIC {
            return Err(StoreError::corrupted(offset, "bad magic"));
        }
        let version = u16::from_le_bytes([header[4], header[5]]);
        if version != JOURNAL_VERSION {
            return Err(StoreError::corrupted(
                offset,
                format!("unsupported journal version {version}"),
            ));
        }
        let len = u64::from(u32::from_le_bytes([header[6], header[7], header[8], header[9]]));
        let frame_len = HEADER_SIZE as u64 + len + CRC_SIZE as u64;
        if frame_len > remaining {
            scan.torn_bytes = remaining;
            break;
        }

        let frame = backend.read_at(offset, frame_len as usize)?;
        let body_end = frame.len() - CRC_SIZE;
        let stored_crc = u32::from_le_bytes([
            frame[body_end],
            frame[body_end + 1],
            frame[body_end + 2],
            frame[body_end + 3],
        ]);
        if crc32(&frame[..body_end]) != stored_crc {
            if offset + frame_len == size {
                scan.torn_bytes = remaining;
                break;
            }
            return Err(StoreError::corrupted(offset, "checksum mismatch"));
        }

        let entry: JournalEntry = ciborium::from_reader(&frame[HEADER_SIZE..body_end])
            .map_err(|e| StoreError::corrupted(offset, e.to_string()))?;
        scan.entries.push((offset, entry));
        offset += frame_len;
        scan.valid_len = offset;
    }

    Ok(scan)
}

/// Owns the backend and serialises appends.
pub(crate) struct Journal {
    backend: Mutex<Box<dyn StorageBackend>>,
    sync_on_commit: bool,
}

impl Journal {
    pub(crate) fn new(backend: Box<dyn StorageBackend>, sync_on_commit: bool) -> Self {
        Self {
            backend: Mutex::new(backend),
            sync_on_commit,
        }
    }

    /// Scans the journal and cuts off a torn final entry.
    pub(crate) fn recover(&self) -> StoreResult<Vec<JournalEntry>> {
        let mut backend = self.backend.lock();
        let scan = scan(&**backend)?;
        if scan.torn_bytes > 0 {
            tracing::warn!(
                offset = scan.valid_len,
                bytes = scan.torn_bytes,
                "discarding torn journal entry"
            );
            backend.truncate(scan.valid_len)?;
        }
        Ok(scan.entries.into_iter().map(|(_, entry)| entry).collect())
    }

    /// Appends `entry` and makes it durable.
    ///
    /// On failure the journal is rolled back to its previous length so a
    /// half-written frame never sits in front of later commits.
    pub(crate) fn append(&self, entry: &JournalEntry) -> StoreResult<()> {
        let frame = entry.encode()?;
        let mut backend = self.backend.lock();
        let before = backend.size()?;

        let written = match backend.append(&frame) {
            Ok(_) if self.sync_on_commit => backend.sync(),
            Ok(_) => backend.flush(),
            Err(err) => Err(err),
        };

        if let Err(err) = written {
            if let Err(rollback) = backend.truncate(before) {
                tracing::error!(error = %rollback, "journal rollback failed");
            }
            return Err(err.into());
        }
        Ok(())
    }

    pub(crate) fn size(&self) -> StoreResult<u64> {
        Ok(self.backend.lock().size()?)
    }
}

/// CRC-32 (IEEE) checksum.
pub fn crc32(data: &[u8]) -> u32 {
    const TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut bit = 0;
            while bit < 8 {
                crc = if crc & 1 != 0 {
                    (crc >> 1) ^ 0xEDB8_8320
                } else {
                    crc >> 1
                };
                bit += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        crc = (crc >> 8) ^ TABLE[((crc ^ u32::from(byte)) & 0xFF) as usize];
    }
    !crc
}
