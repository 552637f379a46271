//! List command implementation.

use crate::commands::open_snapshot;
use crate::error::CliResult;
use crate::Format;
use fieldsync_store::{QueueItem, SyncStatus};
use serde::Serialize;
use std::path::Path;

/// Which items to list.
#[derive(Debug, Default)]
pub struct Filter {
    /// Only this status.
    pub status: Option<SyncStatus>,
    /// Only this tenant.
    pub tenant: Option<String>,
    /// At most this many rows.
    pub limit: Option<usize>,
}

/// One listed queue item.
#[derive(Debug, Serialize)]
pub struct ItemRow {
    /// Queue item id.
    pub id: u64,
    /// Item type.
    pub item_type: String,
    /// Status.
    pub status: String,
    /// Priority.
    pub priority: u8,
    /// Failures counted so far.
    pub retry_count: u32,
    /// Owning record.
    pub record_id: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Next automatic attempt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<String>,
    /// Last failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl From<QueueItem> for ItemRow {
    fn from(item: QueueItem) -> Self {
        Self {
            id: item.id.as_u64(),
            item_type: item.item_type.to_string(),
            status: item.status.to_string(),
            priority: item.priority.get(),
            retry_count: item.retry_count,
            record_id: item.record_id.to_string(),
            tenant_id: item.tenant_id,
            next_retry_at: item.next_retry_at.map(|at| at.to_rfc3339()),
            last_error: item.last_error,
        }
    }
}

/// Collects the queue items at `path` matching `filter`, by priority then id.
pub fn list(path: &Path, filter: &Filter) -> CliResult<Vec<ItemRow>> {
    let store = open_snapshot(path)?;
    let statuses: Vec<SyncStatus> = match filter.status {
        Some(status) => vec![status],
        None => SyncStatus::ALL.to_vec(),
    };

    let mut items: Vec<QueueItem> = statuses
        .into_iter()
        .flat_map(|status| store.items_by_status(status))
        .filter(|item| {
            filter
                .tenant
                .as_deref()
                .map_or(true, |tenant| item.tenant_id == tenant)
        })
        .collect();
    items.sort_by_key(|item| (item.priority, item.id));
    items.truncate(filter.limit.unwrap_or(usize::MAX));

    Ok(items.into_iter().map(ItemRow::from).collect())
}

/// Runs the list command.
pub fn run(path: &Path, filter: &Filter, format: Format) -> CliResult<()> {
    let rows = list(path, filter)?;
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
        Format::Text => print_text_output(&rows),
    }
    Ok(())
}

fn print_text_output(rows: &[ItemRow]) {
    if rows.is_empty() {
        println!("No queue items.");
        return;
    }
    println!(
        "{:>6}  {:<16} {:<12} {:>3} {:>5}  {:<10} RECORD",
        "ID", "TYPE", "STATUS", "PRI", "TRIES", "TENANT"
    );
    for row in rows {
        println!(
            "{:>6}  {:<16} {:<12} {:>3} {:>5}  {:<10} {}",
            row.id, row.item_type, row.status, row.priority, row.retry_count, row.tenant_id, row.record_id
        );
        if let Some(error) = &row.last_error {
            println!("        last error: {error}");
        }
        if let Some(at) = &row.next_retry_at {
            println!("        next retry: {at}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testing::sample_journal;

    #[test]
    fn lists_everything_by_default() {
        let (_dir, path) = sample_journal();
        let rows = list(&path, &Filter::default()).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(
            rows.iter().map(|r| r.id).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(rows[2].item_type, "evidence");
    }

    #[test]
    fn filters_by_tenant_status_and_limit() {
        let (_dir, path) = sample_journal();

        let tenant_a = Filter {
            tenant: Some("tenant-a".into()),
            ..Filter::default()
        };
        assert_eq!(list(&path, &tenant_a).unwrap().len(), 2);

        let failed = Filter {
            status: Some(SyncStatus::Failed),
            ..Filter::default()
        };
        assert!(list(&path, &failed).unwrap().is_empty());

        let one = Filter {
            limit: Some(1),
            ..Filter::default()
        };
        assert_eq!(list(&path, &one).unwrap().len(), 1);
    }
}
