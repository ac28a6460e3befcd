//! Status command implementation.

use chrono::{DateTime, Utc};
use rollcall_store::{LocalStore, TableSummary};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Snapshot status.
#[derive(Debug, Serialize)]
pub struct StatusResult {
    /// Snapshot path.
    pub path: String,
    /// Per-table row counts.
    pub tables: Vec<TableSummary>,
    /// Last successful pull per owner.
    pub checkpoints: BTreeMap<String, DateTime<Utc>>,
}

/// Runs the status command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let result = status(path)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

/// Reads the sync state recorded in a snapshot.
pub fn status(path: &Path) -> Result<StatusResult, Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err(format!("No snapshot found at {:?}", path).into());
    }
    let store = LocalStore::open_snapshot(path)?;

    Ok(StatusResult {
        path: path.display().to_string(),
        tables: store.summary(),
        checkpoints: store
            .checkpoints()
            .into_iter()
            .map(|(owner, at)| (owner.to_string(), at))
            .collect(),
    })
}

fn print_text_output(result: &StatusResult) {
    println!("Store Snapshot");
    println!("==============");
    println!("Path: {}", result.path);
    println!();

    println!("{:<12} {:>7} {:>7} {:>11}", "table", "total", "dirty", "tombstones");
    for table in &result.tables {
        println!(
            "{:<12} {:>7} {:>7} {:>11}",
            table.table, table.total, table.dirty, table.tombstones
        );
    }
    println!();

    if result.checkpoints.is_empty() {
        println!("Checkpoints: none");
    } else {
        println!("Checkpoints:");
        for (owner, at) in &result.checkpoints {
            println!("  {owner}: {at}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::simulate::{simulate, Options};

    #[test]
    fn missing_snapshot_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(status(&dir.path().join("absent.snapshot")).is_err());
    }

    #[tokio::test]
    async fn reports_simulated_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rollcall.snapshot");
        let options = Options {
            owner: "owner-1".into(),
            offline: false,
            fail_table: Some("marks".into()),
        };
        simulate(Some(&path), options).await.unwrap();

        let result = status(&path).unwrap();
        assert_eq!(result.tables.len(), 6);
        let marks = result.tables.iter().find(|t| t.table == "marks").unwrap();
        assert_eq!((marks.total, marks.dirty), (1, 1));
        let terms = result.tables.iter().find(|t| t.table == "terms").unwrap();
        assert_eq!((terms.total, terms.dirty), (1, 0));
        // The push phase failed, so no pull ran.
        assert!(result.checkpoints.is_empty());
    }
}
