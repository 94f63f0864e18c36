//! Pending log and replay.

use crate::dir::sync_directory;
use crate::error::{CoreError, CoreResult};
use crate::recovery::entry::{PendingBatchChange, PendingChange, PendingOperation, PendingRollup};
use crate::segment::RollupOutcome;
use crate::types::{sort_changes, IndividualChange, RollupTarget};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

const ENTRY_SUFFIX: &str = ".pending";
const TEMP_SUFFIX: &str = ".tmp";

/// What the recovery manager applies operations to.
///
/// Both methods must be safe to call again with the same arguments after a
/// crash at any point of a previous call.
pub trait RecoveryTarget {
    /// Applies changes, routing them to every segment they touch.
    fn apply_changes(&self, changes: &[IndividualChange]) -> CoreResult<()>;

    /// Runs or resumes a rollup.
    fn rollup(&self, target: &RollupTarget) -> CoreResult<RollupOutcome>;
}

/// A durable log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    /// Position in the log.
    pub sequence: u64,
    /// Path of the entry file.
    pub path: PathBuf,
}

impl PendingEntry {
    /// Returns the entry's file name.
    #[must_use]
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Summary of a [`RecoveryManager::recover`] run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Entries replayed and committed.
    pub replayed: usize,
    /// Single changes among them.
    pub changes: usize,
    /// Batches among them.
    pub batches: usize,
    /// Rollups among them.
    pub rollups: usize,
}

/// Makes writes and rollups crash-atomic with a directory of pending entries.
///
/// Every operation goes through `pending -> applied -> committed`:
///
/// 1. The operation is written to `<seq>.pending` (temp file, fsync, rename)
/// 2. It is applied to the segment files
/// 3. The entry file is deleted
///
/// A crash leaves the entry behind and [`recover`](Self::recover) applies it
/// again. Entries are never modified after they are written.
#[derive(Debug)]
pub struct RecoveryManager {
    dir: PathBuf,
    next_sequence: AtomicU64,
    sync: bool,
}

impl RecoveryManager {
    /// Opens the pending log in `dir`, creating it if needed.
    ///
    /// Temp files of entries that never became durable are deleted.
    pub fn open(dir: impl Into<PathBuf>, sync: bool) -> CoreResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let mut last = None;
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.ends_with(TEMP_SUFFIX) {
                tracing::warn!(path = %path.display(), "discarding incomplete log entry");
                fs::remove_file(&path)?;
            } else if let Some(sequence) = parse_sequence(name) {
                last = last.max(Some(sequence));
            }
        }

        Ok(Self {
            dir,
            next_sequence: AtomicU64::new(last.map_or(0, |s| s + 1)),
            sync,
        })
    }

    /// Returns the log directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Writes `operation` durably and returns its entry.
    pub fn log(&self, operation: &PendingOperation) -> CoreResult<PendingEntry> {
        let data = operation.encode()?;
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        let path = self.dir.join(format!("{sequence:020}{ENTRY_SUFFIX}"));
        let temp = self.dir.join(format!("{sequence:020}{ENTRY_SUFFIX}{TEMP_SUFFIX}"));

        let mut file = File::create(&temp)?;
        file.write_all(&data)?;
        if self.sync {
            file.sync_all()?;
        }
        drop(file);
        fs::rename(&temp, &path)?;
        if self.sync {
            sync_directory(&self.dir)?;
        }

        tracing::debug!(sequence, kind = operation.kind(), "logged pending operation");
        Ok(PendingEntry { sequence, path })
    }

    /// Deletes a fully applied entry.
    pub fn commit(&self, entry: &PendingEntry) -> CoreResult<()> {
        match fs::remove_file(&entry.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        if self.sync {
            sync_directory(&self.dir)?;
        }
        Ok(())
    }

    /// Lists the entries in the log, oldest first.
    pub fn pending_entries(&self) -> CoreResult<Vec<PendingEntry>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let sequence = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(parse_sequence);
            if let Some(sequence) = sequence {
                entries.push(PendingEntry { sequence, path });
            }
        }
        entries.sort_by_key(|e| e.sequence);
        Ok(entries)
    }

    /// Reads the operation stored in `entry`.
    pub fn read(&self, entry: &PendingEntry) -> CoreResult<PendingOperation> {
        let data = fs::read(&entry.path)?;
        PendingOperation::decode(&data)
    }

    /// Applies one change under a log entry.
    pub fn apply_change<T>(&self, target: &T, change: IndividualChange) -> CoreResult<()>
    where
        T: RecoveryTarget + ?Sized,
    {
        let operation = PendingOperation::Change(PendingChange { change });
        self.journaled(target, &operation).map(|_| ())
    }

    /// Applies a batch of changes under one log entry.
    pub fn apply_batch<T>(&self, target: &T, mut changes: Vec<IndividualChange>) -> CoreResult<()>
    where
        T: RecoveryTarget + ?Sized,
    {
        if changes.is_empty() {
            return Ok(());
        }
        sort_changes(&mut changes);
        let operation = PendingOperation::Batch(PendingBatchChange { changes });
        self.journaled(target, &operation).map(|_| ())
    }

    /// Runs a rollup under a log entry.
    pub fn rollup<T>(&self, target: &T, rollup: RollupTarget) -> CoreResult<RollupOutcome>
    where
        T: RecoveryTarget + ?Sized,
    {
        let operation = PendingOperation::Rollup(PendingRollup { target: rollup });
        let outcome = self.journaled(target, &operation)?;
        Ok(outcome.unwrap_or(RollupOutcome::Nothing))
    }

    /// Log, apply, commit. On failure the entry stays for the next recovery.
    fn journaled<T>(
        &self,
        target: &T,
        operation: &PendingOperation,
    ) -> CoreResult<Option<RollupOutcome>>
    where
        T: RecoveryTarget + ?Sized,
    {
        let entry = self.log(operation)?;
        match replay(target, operation) {
            Ok(outcome) => {
                self.commit(&entry)?;
                Ok(outcome)
            }
            // Rejected before any file was touched; nothing to replay.
            Err(e @ CoreError::InvalidRollupRange { .. }) => {
                self.commit(&entry)?;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Replays every pending entry, oldest first, committing each one.
    ///
    /// The first entry that cannot be read or applied stops recovery with
    /// [`CoreError::UnrecoverableLogEntry`] and stays in the log.
    pub fn recover<T>(&self, target: &T) -> CoreResult<RecoveryReport>
    where
        T: RecoveryTarget + ?Sized,
    {
        let mut report = RecoveryReport::default();
        for entry in self.pending_entries()? {
            let operation = self
                .read(&entry)
                .map_err(|e| CoreError::unrecoverable(entry.name(), e))?;
            tracing::info!(entry = %entry.name(), %operation, "replaying pending operation");

            replay(target, &operation).map_err(|e| {
                tracing::error!(entry = %entry.name(), error = %e, "replay failed");
                CoreError::unrecoverable(entry.name(), e)
            })?;
            self.commit(&entry)?;

            report.replayed += 1;
            match operation {
                PendingOperation::Change(_) => report.changes += 1,
                PendingOperation::Batch(_) => report.batches += 1,
                PendingOperation::Rollup(_) => report.rollups += 1,
            }
        }
        if report.replayed > 0 {
            tracing::info!(
                replayed = report.replayed,
                changes = report.changes,
                batches = report.batches,
                rollups = report.rollups,
                "recovery complete"
            );
        }
        Ok(report)
    }
}

fn replay<T>(target: &T, operation: &PendingOperation) -> CoreResult<Option<RollupOutcome>>
where
    T: RecoveryTarget + ?Sized,
{
    match operation {
        PendingOperation::Change(p) => {
            target.apply_changes(std::slice::from_ref(&p.change))?;
            Ok(None)
        }
        PendingOperation::Batch(p) => {
            target.apply_changes(&p.changes)?;
            Ok(None)
        }
        PendingOperation::Rollup(p) => target.rollup(&p.target).map(Some),
    }
}

fn parse_sequence(name: &str) -> Option<u64> {
    name.strip_suffix(ENTRY_SUFFIX)?.parse().ok()
}
