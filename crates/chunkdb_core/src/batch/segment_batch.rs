//! Packing a sorted change list into the chunk files of one segment.

use crate::error::{CoreError, CoreResult};
use crate::lock::WriteLockGuard;
use crate::range::Range;
use crate::segment::Segment;
use crate::types::{Entity, IndividualChange, Key};
use std::collections::BTreeMap;

/// Supplies the chunk ranges currently present in a segment.
pub trait ExistingChunkRangeFinder {
    /// Lists existing chunk ranges, sorted.
    fn existing_chunk_ranges(&self) -> CoreResult<Vec<Range>>;
}

impl ExistingChunkRangeFinder for [Range] {
    fn existing_chunk_ranges(&self) -> CoreResult<Vec<Range>> {
        let mut ranges = self.to_vec();
        ranges.sort();
        Ok(ranges)
    }
}

impl ExistingChunkRangeFinder for Vec<Range> {
    fn existing_chunk_ranges(&self) -> CoreResult<Vec<Range>> {
        self.as_slice().existing_chunk_ranges()
    }
}

/// Returns the candidate chunk ranges for `grouping_number`, smallest first.
///
/// Inside the segment there is one aligned range per rollup level. A grouping
/// number before the segment start only fits the pre-segment catch-all range.
#[must_use]
pub fn possible_chunk_ranges(segment: Range, levels: &[i64], grouping_number: i64) -> Vec<Range> {
    if grouping_number < segment.start() {
        return vec![Range::new(i64::MIN, segment.start() - 1)];
    }
    let mut ranges: Vec<Range> = Vec::with_capacity(levels.len());
    for &level in levels {
        if let Some(range) = Range::aligned(grouping_number, level).intersection(&segment) {
            if ranges.last() != Some(&range) {
                ranges.push(range);
            }
        }
    }
    ranges
}

/// Picks the largest candidate that overlaps no existing chunk, except one
/// with an identical range.
#[must_use]
pub fn largest_empty_range(candidates: &[Range], existing: &[Range]) -> Option<Range> {
    candidates
        .iter()
        .rev()
        .find(|candidate| {
            existing
                .iter()
                .all(|e| e == *candidate || !e.overlaps(candidate))
        })
        .copied()
}

/// One chunk file a change list would write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    /// Range of the chunk file.
    pub range: Range,
    /// Number of consecutive changes absorbed by it.
    pub changes: usize,
    /// Whether a chunk with this range already existed.
    pub existing: bool,
}

/// Computes the chunk files `changes` would be written to, without touching
/// the disk.
///
/// `changes` must be sorted (see [`sort_changes`](crate::sort_changes)).
pub fn plan<F>(
    segment: Range,
    levels: &[i64],
    finder: &F,
    changes: &[IndividualChange],
) -> CoreResult<Vec<ChunkPlan>>
where
    F: ExistingChunkRangeFinder + ?Sized,
{
    let mut existing = finder.existing_chunk_ranges()?;
    let mut plans = Vec::new();
    let mut rest = changes;

    while let Some(first) = rest.first() {
        let g = first.grouping_number();
        let candidates = possible_chunk_ranges(segment, levels, g);
        let range = largest_empty_range(&candidates, &existing)
            .ok_or_else(|| no_free_range(segment, g))?;
        let count = rest
            .iter()
            .take_while(|c| range.contains(c.grouping_number()))
            .count();

        let was_present = existing.contains(&range);
        if !was_present {
            existing.push(range);
        }
        plans.push(ChunkPlan {
            range,
            changes: count,
            existing: was_present,
        });
        rest = &rest[count..];
    }
    Ok(plans)
}

fn no_free_range(segment: Range, grouping_number: i64) -> CoreError {
    CoreError::invalid_operation(format!(
        "no free chunk range for {grouping_number} in segment {segment}"
    ))
}

/// Applies sorted changes to one segment.
///
/// For each run of changes the writer picks the largest free ladder range,
/// locks it together with every ladder range enclosing it, re-checks the
/// choice against the directory and merges the run into that chunk file.
/// Holding the enclosing ranges serializes the write with any rollup or
/// concurrent write that could produce an overlapping chunk.
#[derive(Debug)]
pub struct SegmentBatch<'a> {
    segment: &'a Segment,
}

impl<'a> SegmentBatch<'a> {
    /// Creates a batch writer for `segment`.
    #[must_use]
    pub const fn new(segment: &'a Segment) -> Self {
        Self { segment }
    }

    /// Writes every change. `changes` must be sorted.
    pub fn apply(&self, changes: &[IndividualChange]) -> CoreResult<()> {
        let mut rest = changes;
        while let Some(first) = rest.first() {
            let (range, guards) = self.lock_chunk_range(first.grouping_number())?;
            let count = rest
                .iter()
                .take_while(|c| range.contains(c.grouping_number()))
                .count();
            let (run, tail) = rest.split_at(count);
            let written = self.write_chunk(range, run)?;
            drop(guards);

            if written {
                self.segment.report_write(range);
            }
            rest = tail;
        }
        Ok(())
    }

    fn lock_chunk_range(&self, g: i64) -> CoreResult<(Range, Vec<WriteLockGuard>)> {
        let candidates = self.segment.possible_chunk_ranges(g);
        loop {
            let existing = self.segment.chunk_ranges()?;
            let chosen = largest_empty_range(&candidates, &existing)
                .ok_or_else(|| no_free_range(self.segment.range(), g))?;

            let mut lock_ranges: Vec<Range> = candidates
                .iter()
                .filter(|c| c.encloses(&chosen))
                .copied()
                .collect();
            lock_ranges.sort_by_key(Range::lock_order);
            let guards = self.segment.locks().acquire_write_locks(
                lock_ranges.iter().map(|r| self.segment.chunk(*r).path()),
            );

            let existing = self.segment.chunk_ranges()?;
            if largest_empty_range(&candidates, &existing) == Some(chosen) {
                return Ok((chosen, guards));
            }
            tracing::debug!(
                segment = %self.segment.range(),
                chunk = %chosen,
                "chunk layout changed while locking, choosing again"
            );
        }
    }

    /// Merges `run` into the chunk for `range`. Returns false if nothing was
    /// written because only deletes hit a missing chunk.
    fn write_chunk(&self, range: Range, run: &[IndividualChange]) -> CoreResult<bool> {
        let chunk = self.segment.chunk(range);
        let previous = chunk.read_if_exists()?;
        let existed = previous.is_some();

        let mut merged: BTreeMap<Key, Vec<u8>> = previous
            .unwrap_or_default()
            .into_iter()
            .map(|e| (e.key, e.value))
            .collect();
        for change in run {
            match &change.new_value {
                Some(value) => {
                    merged.insert(change.key.clone(), value.clone());
                }
                None => {
                    merged.remove(&change.key);
                }
            }
        }

        if merged.is_empty() && !existed {
            return Ok(false);
        }

        let entities: Vec<Entity> = merged
            .into_iter()
            .map(|(key, value)| Entity::new(key, value))
            .collect();
        chunk.write(&entities, self.segment.sync())?;

        tracing::debug!(
            chunk = %chunk.path().display(),
            changes = run.len(),
            entities = entities.len(),
            "wrote chunk"
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SegmentConfig;
    use crate::lock::LockManager;
    use std::sync::Arc;
    use std::thread;
    use tempfile::{tempdir, TempDir};

    const SEGMENT: Range = Range::new(0, 5999);
    const LEVELS: [i64; 3] = [1, 10, 100];

    fn inserts(gs: &[i64]) -> Vec<IndividualChange> {
        gs.iter()
            .map(|&g| IndividualChange::insert(Key::point(g, vec![0]), vec![1]))
            .collect()
    }

    fn ranges(plans: &[ChunkPlan]) -> Vec<Range> {
        plans.iter().map(|p| p.range).collect()
    }

    fn segment(temp: &TempDir) -> Segment {
        Segment::new(
            temp.path().join("seg"),
            SEGMENT,
            Arc::new(SegmentConfig::new(6000, LEVELS.to_vec()).unwrap()),
            LockManager::new(),
            None,
            false,
        )
    }

    #[test]
    fn ladder_for_grouping_number() {
        assert_eq!(
            possible_chunk_ranges(SEGMENT, &LEVELS, 117),
            vec![Range::single(117), Range::new(110, 119), Range::new(100, 199)]
        );
        assert_eq!(
            possible_chunk_ranges(Range::new(6000, 11_999), &LEVELS, 3),
            vec![Range::new(i64::MIN, 5999)]
        );
    }

    #[test]
    fn ladder_is_clipped_to_segment() {
        let segment = Range::new(i64::MAX - 49, i64::MAX);
        let ranges = possible_chunk_ranges(segment, &LEVELS, i64::MAX);
        assert_eq!(ranges.first(), Some(&Range::single(i64::MAX)));
        assert!(ranges.iter().all(|r| segment.encloses(r)));
    }

    #[test]
    fn largest_empty_prefers_biggest_free_candidate() {
        let candidates = possible_chunk_ranges(SEGMENT, &LEVELS, 4);
        assert_eq!(largest_empty_range(&candidates, &[]), Some(Range::new(0, 99)));
        assert_eq!(
            largest_empty_range(&candidates, &[Range::single(7)]),
            Some(Range::single(4))
        );
        assert_eq!(
            largest_empty_range(&candidates, &[Range::new(0, 9)]),
            Some(Range::new(0, 9))
        );
        assert_eq!(
            largest_empty_range(&candidates, &[Range::new(0, 99), Range::new(100, 199)]),
            Some(Range::new(0, 99))
        );
    }

    #[test]
    fn plan_coalesces_into_one_chunk() {
        let plans = plan(SEGMENT, &LEVELS, &Vec::<Range>::new(), &inserts(&[0, 1, 4])).unwrap();
        assert_eq!(
            plans,
            vec![ChunkPlan {
                range: Range::new(0, 99),
                changes: 3,
                existing: false
            }]
        );
    }

    #[test]
    fn plan_around_existing_single_chunk() {
        let existing = vec![Range::single(7)];
        let plans = plan(SEGMENT, &LEVELS, &existing, &inserts(&[0, 1, 4])).unwrap();
        assert_eq!(
            ranges(&plans),
            vec![Range::single(0), Range::single(1), Range::single(4)]
        );
    }

    #[test]
    fn plan_spreads_across_ladder_blocks() {
        let plans = plan(SEGMENT, &LEVELS, &Vec::<Range>::new(), &inserts(&[5, 50, 150, 151])).unwrap();
        assert_eq!(ranges(&plans), vec![Range::new(0, 99), Range::new(100, 199)]);
        assert_eq!(plans[0].changes, 2);
        assert_eq!(plans[1].changes, 2);
    }

    #[test]
    fn plan_reuses_identical_existing_chunk() {
        let existing = vec![Range::new(10, 19)];
        let plans = plan(SEGMENT, &LEVELS, &existing, &inserts(&[12, 15, 25])).unwrap();
        assert_eq!(ranges(&plans), vec![Range::new(10, 19), Range::new(20, 29)]);
        assert!(plans[0].existing);
        assert!(!plans[1].existing);
    }

    #[test]
    fn plan_routes_early_interval_keys_to_catch_all() {
        let segment = Range::new(6000, 11_999);
        let changes = vec![
            IndividualChange::insert(Key::interval(Range::new(5990, 6010), vec![1]), vec![1]),
            IndividualChange::insert(Key::point(6005, vec![1]), vec![1]),
        ];
        let plans = plan(segment, &LEVELS, &Vec::<Range>::new(), &changes).unwrap();
        assert_eq!(
            ranges(&plans),
            vec![Range::new(i64::MIN, 5999), Range::new(6000, 6099)]
        );
    }

    #[test]
    fn apply_writes_planned_chunks() {
        let temp = tempdir().unwrap();
        let seg = segment(&temp);
        seg.chunk(Range::single(7)).write(&[], false).unwrap();

        SegmentBatch::new(&seg).apply(&inserts(&[0, 1, 4])).unwrap();
        assert_eq!(
            seg.chunk_ranges().unwrap(),
            vec![
                Range::single(0),
                Range::single(1),
                Range::single(4),
                Range::single(7)
            ]
        );
    }

    #[test]
    fn delete_of_missing_key_writes_nothing() {
        let temp = tempdir().unwrap();
        let seg = segment(&temp);
        let change = IndividualChange::delete(Key::point(3, vec![0]), None);
        SegmentBatch::new(&seg).apply(&[change]).unwrap();
        assert!(seg.chunk_ranges().unwrap().is_empty());
    }

    #[test]
    fn last_change_to_a_key_wins() {
        let temp = tempdir().unwrap();
        let seg = segment(&temp);
        let key = Key::point(3, vec![0]);
        let changes = vec![
            IndividualChange::insert(key.clone(), b"a".to_vec()),
            IndividualChange::update(key.clone(), Some(b"a".to_vec()), b"b".to_vec()),
        ];
        SegmentBatch::new(&seg).apply(&changes).unwrap();
        assert_eq!(seg.get(&key).unwrap(), Some(b"b".to_vec()));
    }

    #[test]
    fn apply_releases_locks() {
        let temp = tempdir().unwrap();
        let seg = segment(&temp);
        SegmentBatch::new(&seg).apply(&inserts(&[1, 2, 300])).unwrap();
        assert_eq!(seg.locks().tracked_paths(), 0);
    }

    #[test]
    fn concurrent_writers_keep_chunks_disjoint() {
        let temp = tempdir().unwrap();
        let seg = Arc::new(segment(&temp));

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let seg = Arc::clone(&seg);
                thread::spawn(move || {
                    for i in 0..25 {
                        let g = (i * 37 + t * 11) % 600;
                        let change =
                            IndividualChange::insert(Key::point(g, vec![t as u8]), vec![1]);
                        SegmentBatch::new(&seg).apply(&[change]).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let ranges = seg.chunk_ranges().unwrap();
        for (i, a) in ranges.iter().enumerate() {
            for b in &ranges[i + 1..] {
                assert!(!a.overlaps(b), "{a} overlaps {b}");
            }
        }
        let count = seg.iter(Range::FULL, None).unwrap().count();
        assert_eq!(count, 100);
    }
}
