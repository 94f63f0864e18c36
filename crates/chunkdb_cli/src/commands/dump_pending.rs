//! Dump pending command implementation.

use super::open_offline;
use chunkdb_core::recovery::PendingOperation;
use chunkdb_core::RecoveryManager;
use serde::Serialize;
use std::path::Path;

/// Pending log entry representation for output.
#[derive(Debug, Serialize)]
pub struct PendingEntryInfo {
    /// Sequence number.
    pub sequence: u64,
    /// File name in the recovery directory.
    pub file: String,
    /// Operation kind (change, batch, rollup).
    pub kind: String,
    /// Human-readable description.
    pub description: String,
    /// Number of changes (if applicable).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changes: Option<usize>,
    /// Decode error, if the entry is unreadable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Runs the dump-pending command.
pub fn run(
    path: &Path,
    limit: Option<usize>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let entries = read_entries(path, limit)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        _ => {
            print_text_output(&entries);
        }
    }

    Ok(())
}

/// Reads pending entries, oldest first, without replaying them.
pub fn read_entries(
    path: &Path,
    limit: Option<usize>,
) -> Result<Vec<PendingEntryInfo>, Box<dyn std::error::Error>> {
    let store = open_offline(path)?;
    let recovery = RecoveryManager::open(store.dir.recovery_dir(), false)?;
    let max_entries = limit.unwrap_or(usize::MAX);

    let mut entries = Vec::new();
    for entry in recovery.pending_entries()?.into_iter().take(max_entries) {
        let info = match recovery.read(&entry) {
            Ok(operation) => PendingEntryInfo {
                sequence: entry.sequence,
                file: entry.name(),
                kind: operation.kind().to_string(),
                description: operation.to_string(),
                changes: match &operation {
                    PendingOperation::Change(_) => Some(1),
                    PendingOperation::Batch(batch) => Some(batch.changes.len()),
                    PendingOperation::Rollup(_) => None,
                },
                error: None,
            },
            Err(e) => PendingEntryInfo {
                sequence: entry.sequence,
                file: entry.name(),
                kind: "unreadable".to_string(),
                description: String::new(),
                changes: None,
                error: Some(e.to_string()),
            },
        };
        entries.push(info);
    }

    Ok(entries)
}

fn print_text_output(entries: &[PendingEntryInfo]) {
    println!("Pending Log Entries");
    println!("===================");
    println!();

    if entries.is_empty() {
        println!("No pending entries");
        return;
    }

    for entry in entries {
        match &entry.error {
            Some(error) => println!("[{}] {} UNREADABLE: {error}", entry.sequence, entry.file),
            None => println!("[{}] {} {}", entry.sequence, entry.file, entry.description),
        }
    }

    println!();
    println!("Total: {} entries", entries.len());
}

#[cfg(test)]
mod tests {
    use super::super::test_support::create_store;
    use super::*;
    use chunkdb_core::recovery::PendingBatchChange;
    use chunkdb_core::{IndividualChange, Key};
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn lists_entries_without_replaying() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("store");
        create_store(&path);

        {
            let offline = open_offline(&path).unwrap();
            let recovery = RecoveryManager::open(offline.dir.recovery_dir(), false).unwrap();
            let changes = vec![
                IndividualChange::insert(Key::point(1, b"a".to_vec()), vec![1]),
                IndividualChange::insert(Key::point(2, b"b".to_vec()), vec![2]),
            ];
            recovery
                .log(&PendingOperation::Batch(PendingBatchChange { changes }))
                .unwrap();
            fs::write(
                offline.dir.recovery_dir().join(format!("{:020}.pending", 99)),
                b"not cbor",
            )
            .unwrap();
        }

        let entries = read_entries(&path, None).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind, "batch");
        assert_eq!(entries[0].changes, Some(2));
        assert_eq!(entries[1].sequence, 99);
        assert!(entries[1].error.is_some());

        assert_eq!(read_entries(&path, Some(1)).unwrap().len(), 1);
        // Still pending: listing never replays.
        assert_eq!(read_entries(&path, None).unwrap().len(), 2);
    }
}
