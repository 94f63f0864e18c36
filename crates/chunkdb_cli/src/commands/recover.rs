//! Recover command implementation.

use super::open_store;
use serde::Serialize;
use std::path::Path;

/// Recovery result.
#[derive(Debug, Serialize)]
pub struct RecoverResult {
    /// Store path.
    pub path: String,
    /// Pending entries replayed.
    pub replayed: usize,
    /// Single changes among them.
    pub changes: usize,
    /// Batches among them.
    pub batches: usize,
    /// Rollups among them.
    pub rollups: usize,
}

/// Runs the recover command.
///
/// Opening the store replays the pending log; an entry that cannot be
/// replayed fails the command and stays in the log.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let result = recover(path)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            println!("Recovered store at {}", result.path);
            println!("  Replayed: {} entries", result.replayed);
            println!("    Changes: {}", result.changes);
            println!("    Batches: {}", result.batches);
            println!("    Rollups: {}", result.rollups);
        }
    }

    Ok(())
}

/// Opens the store and reports what the replay did.
pub fn recover(path: &Path) -> Result<RecoverResult, Box<dyn std::error::Error>> {
    let store = open_store(path)?;
    let report = store.recovery_report();
    Ok(RecoverResult {
        path: store.path().display().to_string(),
        replayed: report.replayed,
        changes: report.changes,
        batches: report.batches,
        rollups: report.rollups,
    })
}

#[cfg(test)]
mod tests {
    use super::super::{open_offline, test_support::create_store};
    use super::*;
    use chunkdb_core::recovery::{PendingOperation, PendingRollup};
    use chunkdb_core::{Range, RecoveryManager, RollupTarget};
    use tempfile::tempdir;

    #[test]
    fn replays_pending_rollup() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("store");
        create_store(&path);

        {
            let offline = open_offline(&path).unwrap();
            let recovery = RecoveryManager::open(offline.dir.recovery_dir(), false).unwrap();
            recovery
                .log(&PendingOperation::Rollup(PendingRollup {
                    target: RollupTarget::new(0, Range::new(0, 9)),
                }))
                .unwrap();
        }

        let result = recover(&path).unwrap();
        assert_eq!(result.replayed, 1);
        assert_eq!(result.rollups, 1);

        let again = recover(&path).unwrap();
        assert_eq!(again.replayed, 0);
    }
}
