//! Rollup command implementation.

use super::open_store;
use chunkdb_core::{Range, RollupOutcome, RollupTarget, Store};
use std::collections::BTreeSet;
use std::path::Path;

/// Which rollups to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Every level-aligned range holding chunk files, level by level.
    All,
    /// One explicit target.
    Target {
        /// Grouping number inside the segment.
        segment: i64,
        /// Range to merge.
        range: Range,
    },
    /// The rollups a fresh write of every existing chunk would schedule.
    Scheduled,
}

/// Counts of rollup outcomes.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RollupSummary {
    /// Rollups that merged chunks.
    pub merged: usize,
    /// Interrupted rollups that were finished.
    pub completed: usize,
    /// Rollups with nothing to do.
    pub skipped: usize,
}

impl RollupSummary {
    fn record(&mut self, outcome: &RollupOutcome) {
        match outcome {
            RollupOutcome::Merged { .. } => self.merged += 1,
            RollupOutcome::Completed { .. } => self.completed += 1,
            RollupOutcome::AlreadyDone | RollupOutcome::Nothing => self.skipped += 1,
        }
    }
}

/// Runs the rollup command.
pub fn run(path: &Path, mode: Mode) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(path)?;

    match mode {
        Mode::All => {
            let summary = rollup_all(&store)?;
            println!(
                "Rolled up {} ranges ({} finished after interruption, {} unchanged)",
                summary.merged, summary.completed, summary.skipped
            );
        }
        Mode::Target { segment, range } => {
            let outcome = store.rollup(RollupTarget::new(segment, range))?;
            println!("{range}: {outcome:?}");
        }
        Mode::Scheduled => {
            let chunks = store.schedule_existing_chunks()?;
            let ran = store.run_pending_rollups()?;
            println!("Scheduled from {chunks} chunk files, ran {ran} rollups");
        }
    }

    Ok(())
}

/// Rolls up every segment bottom-up: for each level above the smallest,
/// every aligned range that holds a smaller chunk is merged.
pub fn rollup_all(store: &Store) -> Result<RollupSummary, Box<dyn std::error::Error>> {
    let mut summary = RollupSummary::default();
    let levels = store.segment_config().rollup_levels().to_vec();

    for segment in store.segments().get_existing_segments(Range::FULL)? {
        let seg = segment.range();
        for &level in levels.iter().skip(1) {
            let targets: BTreeSet<Range> = segment
                .chunk_ranges()?
                .into_iter()
                .filter(|chunk| chunk.end() >= seg.start())
                .filter_map(|chunk| {
                    let aligned = Range::aligned(chunk.start(), level).intersection(&seg)?;
                    (aligned.encloses(&chunk) && aligned != chunk).then_some(aligned)
                })
                .collect();

            for range in targets {
                let outcome = store.rollup(RollupTarget::new(seg.start(), range))?;
                tracing::debug!(segment = %seg, %range, ?outcome, "forced rollup");
                summary.record(&outcome);
            }
        }
    }

    Ok(summary)
}
