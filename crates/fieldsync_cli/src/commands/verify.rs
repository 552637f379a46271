//! Verify command implementation.

use crate::commands::open_snapshot;
use crate::error::{CliError, CliResult};
use crate::Format;
use serde::Serialize;
use std::path::Path;

/// Verification result.
#[derive(Debug, Serialize)]
pub struct VerifyResult {
    /// Records checked.
    pub records: usize,
    /// Queue items checked.
    pub queue_items: usize,
    /// Broken invariants, one line each.
    pub violations: Vec<String>,
}

impl VerifyResult {
    fn is_ok(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Replays the journal at `path` and checks queue invariants.
pub fn verify(path: &Path) -> CliResult<VerifyResult> {
    let store = open_snapshot(path)?;
    Ok(VerifyResult {
        records: store.record_count(),
        queue_items: store.status_counts().values().sum(),
        violations: store.verify().iter().map(ToString::to_string).collect(),
    })
}

/// Runs the verify command.
pub fn run(path: &Path, format: Format) -> CliResult<()> {
    let result = verify(path)?;
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&result)?),
        Format::Text => {
            println!("Verifying queue at {}", path.display());
            println!();
            println!("  Records:     {}", result.records);
            println!("  Queue items: {}", result.queue_items);
            for violation in &result.violations {
                println!("  ✗ {violation}");
            }
            println!();
            if result.is_ok() {
                println!("✓ Queue verification passed");
            } else {
                println!("✗ Queue verification failed");
            }
        }
    }

    if result.is_ok() {
        Ok(())
    } else {
        Err(CliError::Violations(result.violations.len()))
    }
}
