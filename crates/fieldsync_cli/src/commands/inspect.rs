//! Inspect command implementation.

use crate::commands::{open_snapshot, read_journal};
use crate::error::CliResult;
use crate::Format;
use fieldsync_storage::InMemoryBackend;
use fieldsync_store::journal;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Queue inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Journal path.
    pub path: String,
    /// Journal file size in bytes.
    pub journal_size: u64,
    /// Number of intact journal entries.
    pub entries: usize,
    /// Bytes of a torn final entry, discarded on the next open.
    pub torn_bytes: u64,
    /// Last commit sequence.
    pub sequence: u64,
    /// Number of source records.
    pub records: usize,
    /// Queue items per status.
    pub queue_items: BTreeMap<String, usize>,
    /// Items a bulk pass would consider now.
    pub pending_sync: usize,
}

/// Collects statistics for the journal at `path`.
pub fn inspect(path: &Path) -> CliResult<InspectResult> {
    let bytes = read_journal(path)?;
    let journal_size = bytes.len() as u64;
    let scan = journal::scan(&InMemoryBackend::with_data(bytes))?;

    let store = open_snapshot(path)?;
    let queue_items = store
        .status_counts()
        .into_iter()
        .map(|(status, count)| (status.to_string(), count))
        .collect();

    Ok(InspectResult {
        path: path.display().to_string(),
        journal_size,
        entries: scan.entries.len(),
        torn_bytes: scan.torn_bytes,
        sequence: store.sequence(),
        records: store.record_count(),
        queue_items,
        pending_sync: store.pending_sync_count(),
    })
}

/// Runs the inspect command.
pub fn run(path: &Path, format: Format) -> CliResult<()> {
    let result = inspect(path)?;
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&result)?),
        Format::Text => print_text_output(&result),
    }
    Ok(())
}

fn print_text_output(result: &InspectResult) {
    println!("FieldSync Queue Inspection");
    println!("==========================");
    println!();
    println!("Path: {}", result.path);
    println!();
    println!("Journal:");
    println!("  Size:       {}", format_size(result.journal_size));
    println!("  Entries:    {}", result.entries);
    println!("  Sequence:   {}", result.sequence);
    if result.torn_bytes > 0 {
        println!("  Torn tail:  {} bytes (discarded on next open)", result.torn_bytes);
    }
    println!();
    println!("Records: {}", result.records);
    println!();
    println!("Queue:");
    if result.queue_items.is_empty() {
        println!("  (empty)");
    }
    for (status, count) in &result.queue_items {
        println!("  {status:<12} {count}");
    }
    println!();
    println!("Due for sync: {}", result.pending_sync);
}

fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} bytes", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
