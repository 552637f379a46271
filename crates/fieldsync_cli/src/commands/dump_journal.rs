//! Dump journal command implementation.

use crate::commands::read_journal;
use crate::error::CliResult;
use crate::Format;
use fieldsync_storage::InMemoryBackend;
use fieldsync_store::journal::{self, JournalEntry, Mutation};
use serde::Serialize;
use std::path::Path;

/// Journal entry representation for output.
#[derive(Debug, Serialize)]
pub struct EntryInfo {
    /// Offset in the journal file.
    pub offset: u64,
    /// Commit sequence.
    pub sequence: u64,
    /// One line per mutation.
    pub mutations: Vec<String>,
}

fn describe(mutation: &Mutation) -> String {
    match mutation {
        Mutation::PutRecord(record) => format!(
            "put record {} ({}, {}, tenant {})",
            record.id, record.kind, record.status, record.tenant_id
        ),
        Mutation::DeleteRecord(id) => format!("delete record {id}"),
        Mutation::PutQueueItem(item) => format!(
            "put queue item {} ({}, {}, retries {}, record {})",
            item.id, item.item_type, item.status, item.retry_count, item.record_id
        ),
        Mutation::DeleteQueueItem(id) => format!("delete queue item {id}"),
    }
}

fn entry_info(offset: u64, entry: &JournalEntry) -> EntryInfo {
    EntryInfo {
        offset,
        sequence: entry.sequence,
        mutations: entry.mutations.iter().map(describe).collect(),
    }
}

/// Reads journal entries with a sequence of at least `from`.
pub fn dump(path: &Path, limit: Option<usize>, from: u64) -> CliResult<Vec<EntryInfo>> {
    let backend = InMemoryBackend::with_data(read_journal(path)?);
    let scan = journal::scan(&backend)?;
    Ok(scan
        .entries
        .iter()
        .filter(|(_, entry)| entry.sequence >= from)
        .take(limit.unwrap_or(usize::MAX))
        .map(|(offset, entry)| entry_info(*offset, entry))
        .collect())
}

/// Runs the dump-journal command.
pub fn run(path: &Path, limit: Option<usize>, from: u64, format: Format) -> CliResult<()> {
    let entries = dump(path, limit, from)?;
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&entries)?),
        Format::Text => {
            for entry in &entries {
                println!("#{} @ {}", entry.sequence, entry.offset);
                for mutation in &entry.mutations {
                    println!("    {mutation}");
                }
            }
            println!();
            println!("{} entr{}", entries.len(), if entries.len() == 1 { "y" } else { "ies" });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testing::sample_journal;

    #[test]
    fn dumps_every_commit() {
        let (_dir, path) = sample_journal();
        let entries = dump(&path, None, 0).unwrap();

        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].offset, 0);
        assert_eq!(entries[0].sequence, 1);
        assert_eq!(entries[0].mutations.len(), 2);
        assert!(entries[0].mutations[0].starts_with("put record"));
        assert!(entries[0].mutations[1].contains("form_submission"));
        assert!(entries[2].mutations[1].contains("evidence"));
    }

    #[test]
    fn honours_from_and_limit() {
        let (_dir, path) = sample_journal();
        let entries = dump(&path, Some(1), 2).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].sequence, 2);
        assert!(entries[0].offset > 0);
    }
}
