//! Crash recovery testing for rollups and batches.
//!
//! A rollup runs in steps: merge the sources into a temp file, rename it to
//! the target, delete the sources. The harness stops a journaled rollup after
//! each step, reopens the store (which replays the pending log) and compares
//! the result with an uninterrupted run on an identical store.
//!
//! A batch is written one segment at a time. [`BatchCrashHarness`] logs a
//! batch, writes it to only the first few segments it touches, reopens and
//! checks that the whole batch took effect.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use chunkdb_testkit::crash::{ChunkLayout, RollupCrashHarness};
//!
//! let layout = ChunkLayout::new().chunk(Range::single(3), vec![entity]);
//! for result in RollupCrashHarness::new(layout).run_all(target) {
//!     assert!(result.passed, "{result:?}");
//! }
//! ```

use crate::fixtures::{put_chunk, TestStore};
use crate::invariants::check_store;
use chunkdb_core::recovery::{PendingBatchChange, PendingOperation, PendingRollup};
use chunkdb_core::segment::RollupCrashPoint;
use chunkdb_core::{sort_changes, Entity, IndividualChange, Key, Range, RollupTarget, Store};
use std::collections::{BTreeMap, BTreeSet};

/// Chunk files written directly before a crash test.
#[derive(Debug, Clone, Default)]
pub struct ChunkLayout {
    chunks: Vec<(Range, Vec<Entity>)>,
}

impl ChunkLayout {
    /// Creates an empty layout.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a chunk file.
    #[must_use]
    pub fn chunk(mut self, range: Range, entities: Vec<Entity>) -> Self {
        self.chunks.push((range, entities));
        self
    }

    /// Writes every chunk file into `store`.
    pub fn apply(&self, store: &Store) {
        for (range, entities) in &self.chunks {
            put_chunk(store, *range, entities);
        }
    }
}

/// Result of a crash recovery test.
#[derive(Debug, Clone)]
pub struct CrashRecoveryResult {
    /// Whether the test passed.
    pub passed: bool,
    /// Where the rollup was interrupted.
    pub crash_point: RollupCrashPoint,
    /// Entities after the uninterrupted rollup.
    pub expected_entities: usize,
    /// Entities after crash and recovery.
    pub actual_entities: usize,
    /// What differed, if anything.
    pub error: Option<String>,
}

impl CrashRecoveryResult {
    fn pass(crash_point: RollupCrashPoint, entities: usize) -> Self {
        Self {
            passed: true,
            crash_point,
            expected_entities: entities,
            actual_entities: entities,
            error: None,
        }
    }

    fn fail(crash_point: RollupCrashPoint, expected: usize, actual: usize, error: String) -> Self {
        Self {
            passed: false,
            crash_point,
            expected_entities: expected,
            actual_entities: actual,
            error: Some(error),
        }
    }
}

/// Observable state of a store after a rollup.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Snapshot {
    contents: BTreeMap<Key, Vec<u8>>,
    chunks: Vec<Range>,
    pending: usize,
}

impl Snapshot {
    fn take(store: &TestStore, segment_start: i64) -> Self {
        let segment = store.segments().get_segment(segment_start);
        Self {
            contents: store.contents(),
            chunks: segment.chunk_ranges().expect("Failed to list chunks"),
            pending: store
                .recovery()
                .pending_entries()
                .expect("Failed to list pending log")
                .len(),
        }
    }
}

/// Interrupts rollups at every crash point and checks recovery.
#[derive(Debug, Clone)]
pub struct RollupCrashHarness {
    layout: ChunkLayout,
}

impl RollupCrashHarness {
    /// Creates a harness that starts every run from `layout`.
    #[must_use]
    pub fn new(layout: ChunkLayout) -> Self {
        Self { layout }
    }

    /// Runs the rollup without interruption and returns the final snapshot.
    fn reference(&self, target: RollupTarget) -> Snapshot {
        let store = TestStore::new();
        self.layout.apply(&store);
        store.rollup(target).expect("Reference rollup failed");
        Snapshot::take(&store, target.segment_grouping_number)
    }

    /// Interrupts the rollup at `crash_point`, reopens and compares.
    pub fn run(&self, target: RollupTarget, crash_point: RollupCrashPoint) -> CrashRecoveryResult {
        let expected = self.reference(target);

        let store = TestStore::new();
        self.layout.apply(&store);
        let logged = store
            .recovery()
            .log(&PendingOperation::Rollup(PendingRollup { target }));
        if let Err(e) = logged {
            return CrashRecoveryResult::fail(crash_point, expected.contents.len(), 0, e.to_string());
        }
        let interrupted = store
            .segments()
            .get_segment(target.segment_grouping_number)
            .rollup_interrupted(target.range, crash_point);
        if let Err(e) = interrupted {
            return CrashRecoveryResult::fail(crash_point, expected.contents.len(), 0, e.to_string());
        }

        let store = match store.try_reopen() {
            Ok(store) => store,
            Err(e) => {
                return CrashRecoveryResult::fail(
                    crash_point,
                    expected.contents.len(),
                    0,
                    format!("recovery failed: {e}"),
                )
            }
        };
        let actual = Snapshot::take(&store, target.segment_grouping_number);

        if actual == expected {
            CrashRecoveryResult::pass(crash_point, actual.contents.len())
        } else {
            CrashRecoveryResult::fail(
                crash_point,
                expected.contents.len(),
                actual.contents.len(),
                format!("expected {expected:?}, recovered {actual:?}"),
            )
        }
    }

    /// Runs [`run`](Self::run) at every crash point.
    pub fn run_all(&self, target: RollupTarget) -> Vec<CrashRecoveryResult> {
        RollupCrashPoint::ALL
            .into_iter()
            .map(|crash_point| self.run(target, crash_point))
            .collect()
    }
}

/// Result of one interrupted batch.
#[derive(Debug, Clone)]
pub struct BatchCrashResult {
    /// Whether the test passed.
    pub passed: bool,
    /// Segments the batch reached before the crash.
    pub applied_segments: usize,
    /// Entities after the uninterrupted batch.
    pub expected_entities: usize,
    /// Entities after crash and recovery.
    pub actual_entities: usize,
    /// What differed, if anything.
    pub error: Option<String>,
}

impl BatchCrashResult {
    fn fail(applied_segments: usize, expected: usize, actual: usize, error: String) -> Self {
        Self {
            passed: false,
            applied_segments,
            expected_entities: expected,
            actual_entities: actual,
            error: Some(error),
        }
    }
}

/// Interrupts a journaled batch between segments and checks recovery.
#[derive(Debug, Clone)]
pub struct BatchCrashHarness {
    layout: ChunkLayout,
    changes: Vec<IndividualChange>,
}

impl BatchCrashHarness {
    /// Creates a harness that applies `changes` on top of `layout`.
    #[must_use]
    pub fn new(layout: ChunkLayout, changes: Vec<IndividualChange>) -> Self {
        let mut changes = changes;
        sort_changes(&mut changes);
        Self { layout, changes }
    }

    /// Start of every segment the batch touches, ascending.
    fn touched_segments(&self, store: &Store) -> Vec<Range> {
        let touched: BTreeSet<Range> = self
            .changes
            .iter()
            .flat_map(|c| store.segments().get_all_segments(c.key.span()))
            .map(|segment| segment.range())
            .collect();
        touched.into_iter().collect()
    }

    fn reference(&self) -> BTreeMap<Key, Vec<u8>> {
        let store = TestStore::new();
        self.layout.apply(&store);
        store
            .apply_batch(self.changes.clone())
            .expect("Reference batch failed");
        store.contents()
    }

    /// Logs the batch, writes it to the first `applied_segments` segments it
    /// touches, reopens and compares with the uninterrupted batch.
    pub fn run(&self, applied_segments: usize) -> BatchCrashResult {
        let expected = self.reference();
        let fail = |actual: usize, error: String| {
            BatchCrashResult::fail(applied_segments, expected.len(), actual, error)
        };

        let store = TestStore::new();
        self.layout.apply(&store);
        let operation = PendingOperation::Batch(PendingBatchChange {
            changes: self.changes.clone(),
        });
        if let Err(e) = store.recovery().log(&operation) {
            return fail(0, e.to_string());
        }
        for range in self.touched_segments(&store).into_iter().take(applied_segments) {
            let routed: Vec<IndividualChange> = self
                .changes
                .iter()
                .filter(|c| c.key.span().overlaps(&range))
                .cloned()
                .collect();
            if let Err(e) = store.segments().get_segment(range.start()).apply_changes(&routed) {
                return fail(0, e.to_string());
            }
        }

        let store = match store.try_reopen() {
            Ok(store) => store,
            Err(e) => return fail(0, format!("recovery failed: {e}")),
        };
        let actual = store.contents();
        let pending = store
            .recovery()
            .pending_entries()
            .expect("Failed to list pending log")
            .len();

        if actual != expected {
            return fail(actual.len(), format!("expected {expected:?}, recovered {actual:?}"));
        }
        if pending != 0 {
            return fail(actual.len(), format!("{pending} entries left in the pending log"));
        }
        if let Err(e) = check_store(&store) {
            return fail(actual.len(), e.to_string());
        }
        BatchCrashResult {
            passed: true,
            applied_segments,
            expected_entities: expected.len(),
            actual_entities: actual.len(),
            error: None,
        }
    }

    /// Runs [`run`](Self::run) for every prefix of the touched segments,
    /// from none to all of them.
    pub fn run_all(&self) -> Vec<BatchCrashResult> {
        let touched = {
            let store = TestStore::new();
            self.touched_segments(&store).len()
        };
        (0..=touched).map(|applied| self.run(applied)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(g: i64, id: &str, value: &str) -> Entity {
        Entity::new(Key::point(g, id), value)
    }

    fn assert_all_pass(results: Vec<CrashRecoveryResult>) {
        assert_eq!(results.len(), 4);
        for result in results {
            assert!(result.passed, "{result:?}");
        }
    }

    #[test]
    fn merge_of_single_chunks_recovers_everywhere() {
        let layout = ChunkLayout::new()
            .chunk(Range::single(1), vec![entity(1, "a", "x")])
            .chunk(Range::single(4), vec![entity(4, "a", "y"), entity(4, "b", "z")])
            .chunk(Range::single(9), vec![entity(9, "c", "w")]);
        let harness = RollupCrashHarness::new(layout);
        assert_all_pass(harness.run_all(RollupTarget::new(0, Range::new(0, 9))));
    }

    #[test]
    fn multi_level_merge_recovers_everywhere() {
        let layout = ChunkLayout::new()
            .chunk(Range::new(0, 9), vec![entity(2, "a", "x")])
            .chunk(Range::single(15), vec![entity(15, "a", "y")])
            .chunk(Range::new(90, 99), vec![entity(95, "a", "z")]);
        let harness = RollupCrashHarness::new(layout);
        assert_all_pass(harness.run_all(RollupTarget::new(0, Range::new(0, 99))));
    }

    #[test]
    fn merge_of_empty_chunks_recovers_everywhere() {
        let layout = ChunkLayout::new()
            .chunk(Range::single(6001), vec![])
            .chunk(Range::single(6002), vec![]);
        let harness = RollupCrashHarness::new(layout);
        assert_all_pass(harness.run_all(RollupTarget::new(6000, Range::new(6000, 6009))));
    }

    #[test]
    fn negative_segment_recovers_everywhere() {
        let layout = ChunkLayout::new()
            .chunk(Range::single(-100), vec![entity(-100, "n", "1")])
            .chunk(Range::single(-95), vec![entity(-95, "n", "2")]);
        let harness = RollupCrashHarness::new(layout);
        assert_all_pass(harness.run_all(RollupTarget::new(-6000, Range::new(-100, -1))));
    }

    #[test]
    fn batch_across_segments_recovers_after_any_segment() {
        let layout = ChunkLayout::new()
            .chunk(Range::single(5), vec![entity(5, "a", "old")])
            .chunk(Range::single(6005), vec![entity(6005, "a", "gone")]);
        let changes = vec![
            IndividualChange::update(Key::point(5, "a"), Some(b"old".to_vec()), "new"),
            IndividualChange::insert(Key::point(-20, "n"), "neg"),
            IndividualChange::delete(Key::point(6005, "a"), Some(b"gone".to_vec())),
            IndividualChange::insert(Key::interval(Range::new(5990, 12_010), "f"), "frame"),
            IndividualChange::insert(Key::point(13_000, "z"), "far"),
        ];
        let harness = BatchCrashHarness::new(layout, changes);

        let results = harness.run_all();
        // -6000, 0, 6000, 12000 segments plus the run with nothing applied.
        assert_eq!(results.len(), 5);
        for result in &results {
            assert!(result.passed, "{result:?}");
            assert_eq!(result.expected_entities, 4);
        }
    }
}
