//! A single segment: one fixed range of the key space and its chunk files.

use crate::batch::{possible_chunk_ranges, ExistingChunkRangeFinder, SegmentBatch};
use crate::chunk::{list_chunk_ranges, ChunkFile};
use crate::config::SegmentConfig;
use crate::dir::sync_directory;
use crate::error::{CoreError, CoreResult};
use crate::lock::{LockManager, ReadLockGuard};
use crate::range::Range;
use crate::rollup::Rollupable;
use crate::segment::iterator::SegmentIterator;
use crate::types::{Entity, IndividualChange, Key};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// How often a point read re-lists the segment after a chunk vanished under it.
const MAX_READ_ATTEMPTS: usize = 4;

enum Lookup {
    Found(Vec<u8>),
    Absent,
    Vanished,
}

/// Result of [`Segment::rollup`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollupOutcome {
    /// Source chunks were merged into the target chunk.
    Merged {
        /// Number of source chunk files merged and deleted.
        sources: usize,
        /// Number of entities in the target chunk.
        entities: usize,
    },
    /// The target already existed next to leftover sources from an
    /// interrupted rollup; the leftovers were deleted.
    Completed {
        /// Number of leftover source files deleted.
        removed: usize,
    },
    /// The range is already covered by a single chunk file.
    AlreadyDone,
    /// No chunk files lie inside the range.
    Nothing,
}

/// Steps after which a rollup can be interrupted to simulate a crash.
#[doc(hidden)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollupCrashPoint {
    /// Sources locked, nothing written.
    BeforeMerge,
    /// Merged temp file written but not renamed.
    AfterTempWritten,
    /// Temp file renamed to the target, no source deleted.
    AfterRename,
    /// Target in place, only the first source deleted.
    AfterPartialDelete,
}

impl RollupCrashPoint {
    /// Every crash point, in protocol order.
    pub const ALL: [Self; 4] = [
        Self::BeforeMerge,
        Self::AfterTempWritten,
        Self::AfterRename,
        Self::AfterPartialDelete,
    ];
}

/// A fixed range of the key space stored as a directory of chunk files.
///
/// The chunk files of a segment never overlap unless their ranges are
/// identical. A segment's data is the union of its chunk files; a deleted key
/// is simply absent.
pub struct Segment {
    dir: PathBuf,
    range: Range,
    config: Arc<SegmentConfig>,
    locks: Arc<LockManager>,
    owner: Option<Arc<dyn Rollupable>>,
    sync: bool,
}

impl Segment {
    /// Creates a segment handle. No directory is created until the first write.
    pub fn new(
        dir: PathBuf,
        range: Range,
        config: Arc<SegmentConfig>,
        locks: Arc<LockManager>,
        owner: Option<Arc<dyn Rollupable>>,
        sync: bool,
    ) -> Self {
        Self {
            dir,
            range,
            config,
            locks,
            owner,
            sync,
        }
    }

    /// Returns the segment range.
    #[must_use]
    pub const fn range(&self) -> Range {
        self.range
    }

    /// Returns the segment directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the rollup levels, smallest first.
    #[must_use]
    pub fn rollup_levels(&self) -> &[i64] {
        self.config.rollup_levels()
    }

    /// Returns true if the segment directory exists.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.dir.is_dir()
    }

    /// Returns the range of the catch-all chunk holding keys that start
    /// before this segment, if any number precedes the segment.
    #[must_use]
    pub fn pre_segment_range(&self) -> Option<Range> {
        (self.range.start() > i64::MIN).then(|| Range::new(i64::MIN, self.range.start() - 1))
    }

    /// Lists the ranges of all chunk files, sorted.
    pub fn chunk_ranges(&self) -> CoreResult<Vec<Range>> {
        list_chunk_ranges(&self.dir)
    }

    /// Returns the chunk file handle for `range`.
    #[must_use]
    pub fn chunk(&self, range: Range) -> ChunkFile {
        ChunkFile::new(&self.dir, range)
    }

    /// Returns the candidate chunk ranges containing `grouping_number`,
    /// smallest first.
    #[must_use]
    pub fn possible_chunk_ranges(&self, grouping_number: i64) -> Vec<Range> {
        possible_chunk_ranges(self.range, self.rollup_levels(), grouping_number)
    }

    pub(crate) fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub(crate) const fn sync(&self) -> bool {
        self.sync
    }

    pub(crate) fn report_write(&self, written: Range) {
        if let Some(owner) = &self.owner {
            owner.report_write(self, written);
        }
    }

    /// Reads the value stored under `key`.
    ///
    /// Chunk listing is optimistic. If rollups keep replacing the chunks that
    /// hold the key, the last pass read-locks every chunk range that can
    /// contain it first, which keeps rollups and batch writes out.
    pub fn get(&self, key: &Key) -> CoreResult<Option<Vec<u8>>> {
        for _ in 0..MAX_READ_ATTEMPTS {
            match self.lookup(key, true)? {
                Lookup::Found(value) => return Ok(Some(value)),
                Lookup::Absent => return Ok(None),
                Lookup::Vanished => {}
            }
        }

        tracing::debug!(segment = %self.range, %key, "chunks kept vanishing, locking the ladder");
        let mut ladder = self.possible_chunk_ranges(key.grouping_number());
        ladder.sort_by_key(Range::lock_order);
        let _guards: Vec<ReadLockGuard> = ladder
            .iter()
            .map(|r| self.locks.acquire_read_lock(&self.chunk(*r).path()))
            .collect();
        match self.lookup(key, false)? {
            Lookup::Found(value) => Ok(Some(value)),
            Lookup::Absent => Ok(None),
            Lookup::Vanished => Err(CoreError::invalid_operation(format!(
                "chunk holding {key} vanished while locked"
            ))),
        }
    }

    fn lookup(&self, key: &Key, lock_chunks: bool) -> CoreResult<Lookup> {
        let g = key.grouping_number();
        let mut vanished = false;
        for range in self.chunk_ranges()?.into_iter().filter(|r| r.contains(g)) {
            let chunk = self.chunk(range);
            let _guard = lock_chunks.then(|| self.locks.acquire_read_lock(&chunk.path()));
            match chunk.read() {
                Ok(entities) => {
                    if let Ok(pos) = entities.binary_search_by(|e| e.key.cmp(key)) {
                        return Ok(Lookup::Found(entities[pos].value.clone()));
                    }
                }
                // Superseded by a rollup between listing and locking.
                Err(e) if e.is_not_found() => vanished = true,
                Err(e) => return Err(e),
            }
        }
        Ok(if vanished {
            Lookup::Vanished
        } else {
            Lookup::Absent
        })
    }

    /// Returns true if `key` is stored.
    pub fn contains(&self, key: &Key) -> CoreResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Inserts or replaces one entity.
    pub fn insert(&self, key: Key, value: impl Into<Vec<u8>>) -> CoreResult<()> {
        self.apply_changes(&[IndividualChange::insert(key, value)])
    }

    /// Deletes one entity.
    pub fn delete(&self, key: Key) -> CoreResult<()> {
        self.apply_changes(&[IndividualChange::delete(key, None)])
    }

    /// Applies sorted changes through the batch writer.
    pub fn apply_changes(&self, changes: &[IndividualChange]) -> CoreResult<()> {
        SegmentBatch::new(self).apply(changes)
    }

    /// Returns a lazy iterator over entities overlapping `[start, end]`.
    ///
    /// With a `timeout`, the iterator auto-closes when it is neither advanced
    /// nor kept alive for that long.
    pub fn iter(&self, query: Range, timeout: Option<Duration>) -> CoreResult<SegmentIterator> {
        SegmentIterator::new(self, query, timeout)
    }

    /// Checks that `range` is a level-aligned range inside this segment.
    pub fn validate_rollup_range(&self, range: Range) -> CoreResult<()> {
        if !self.range.encloses(&range) {
            return Err(CoreError::invalid_rollup_range(
                range,
                format!("not inside segment {}", self.range),
            ));
        }
        let aligned = self.rollup_levels().iter().any(|&level| {
            Range::aligned(range.start(), level).intersection(&self.range) == Some(range)
        });
        if !aligned {
            return Err(CoreError::invalid_rollup_range(
                range,
                format!("not aligned to rollup levels {:?}", self.rollup_levels()),
            ));
        }
        Ok(())
    }

    /// Merges every chunk file inside `range` into one chunk covering exactly
    /// `range`.
    ///
    /// The merge goes to a temp file that is renamed over the target before the
    /// sources are deleted, so the procedure can be resumed after a crash at
    /// any step. Repeating a finished rollup is a no-op.
    pub fn rollup(&self, range: Range) -> CoreResult<RollupOutcome> {
        self.rollup_inner(range, None)?
            .ok_or_else(|| CoreError::invalid_operation("rollup stopped without a crash point"))
    }

    /// Runs a rollup and stops right after `crash`, leaving the files as a
    /// crash at that point would.
    #[doc(hidden)]
    pub fn rollup_interrupted(&self, range: Range, crash: RollupCrashPoint) -> CoreResult<()> {
        self.rollup_inner(range, Some(crash)).map(|_| ())
    }

    fn rollup_inner(
        &self,
        range: Range,
        crash: Option<RollupCrashPoint>,
    ) -> CoreResult<Option<RollupOutcome>> {
        self.validate_rollup_range(range)?;
        let target = self.chunk(range);

        let (overlapping, _guards) = loop {
            let overlapping = self.overlapping_chunks(range)?;
            if overlapping.iter().any(|r| *r != range && r.encloses(&range)) {
                // Already folded into a larger chunk.
                let _guard = self.locks.acquire_write_lock(&target.path());
                target.remove_temp()?;
                return Ok(Some(RollupOutcome::AlreadyDone));
            }
            if let Some(straddler) = overlapping.iter().find(|r| !range.encloses(r)) {
                return Err(CoreError::invalid_rollup_range(
                    range,
                    format!("chunk {straddler} straddles the range"),
                ));
            }

            let mut lock_ranges = overlapping.clone();
            lock_ranges.push(range);
            lock_ranges.sort_by_key(Range::lock_order);
            let guards = self
                .locks
                .acquire_write_locks(lock_ranges.iter().map(|r| self.chunk(*r).path()));

            if self.overlapping_chunks(range)? == overlapping {
                break (overlapping, guards);
            }
        };

        let sources: Vec<Range> = overlapping.into_iter().filter(|r| *r != range).collect();

        if target.exists() {
            if sources.is_empty() {
                target.remove_temp()?;
                return Ok(Some(RollupOutcome::AlreadyDone));
            }
            // The rename happened before a crash; only deletions are missing.
            let removed = self.delete_sources(&sources, None)?;
            tracing::info!(
                segment = %self.range,
                target = %range,
                removed,
                "completed interrupted rollup"
            );
            return Ok(Some(RollupOutcome::Completed { removed }));
        }

        if target.remove_temp()? {
            tracing::warn!(target = %range, "discarded stray rollup temp file");
        }
        if sources.is_empty() {
            return Ok(Some(RollupOutcome::Nothing));
        }
        if crash == Some(RollupCrashPoint::BeforeMerge) {
            return Ok(None);
        }

        let mut merged: BTreeMap<Key, Vec<u8>> = BTreeMap::new();
        for source in &sources {
            for entity in self.chunk(*source).read()? {
                merged.insert(entity.key, entity.value);
            }
        }
        let entities: Vec<Entity> = merged
            .into_iter()
            .map(|(key, value)| Entity::new(key, value))
            .collect();

        if !entities.is_empty() {
            target.write_temp(&entities, self.sync)?;
            if crash == Some(RollupCrashPoint::AfterTempWritten) {
                return Ok(None);
            }
            target.promote_temp(self.sync)?;
        }
        if crash == Some(RollupCrashPoint::AfterRename) {
            return Ok(None);
        }

        let removed = self.delete_sources(&sources, crash)?;
        if crash == Some(RollupCrashPoint::AfterPartialDelete) {
            return Ok(None);
        }

        tracing::info!(
            segment = %self.range,
            target = %range,
            sources = removed,
            entities = entities.len(),
            "rolled up chunks"
        );
        Ok(Some(RollupOutcome::Merged {
            sources: sources.len(),
            entities: entities.len(),
        }))
    }

    fn overlapping_chunks(&self, range: Range) -> CoreResult<Vec<Range>> {
        Ok(self
            .chunk_ranges()?
            .into_iter()
            .filter(|r| r.overlaps(&range))
            .collect())
    }

    /// Deletes source chunks (and any temp files they left). Stops after the
    /// first deletion when simulating a partial delete.
    fn delete_sources(
        &self,
        sources: &[Range],
        crash: Option<RollupCrashPoint>,
    ) -> CoreResult<usize> {
        let mut removed = 0;
        for source in sources {
            let chunk = self.chunk(*source);
            if chunk.remove(false)? {
                removed += 1;
            }
            chunk.remove_temp()?;
            if crash == Some(RollupCrashPoint::AfterPartialDelete) {
                break;
            }
        }
        if self.sync && self.exists() {
            sync_directory(&self.dir)?;
        }
        Ok(removed)
    }
}

impl ExistingChunkRangeFinder for Segment {
    fn existing_chunk_ranges(&self) -> CoreResult<Vec<Range>> {
        self.chunk_ranges()
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("range", &self.range)
            .field("dir", &self.dir)
            .field("levels", &self.rollup_levels())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, TempDir};

    fn segment(temp: &TempDir) -> Segment {
        Segment::new(
            temp.path().join("seg"),
            Range::new(0, 5999),
            Arc::new(SegmentConfig::new(6000, vec![1, 10, 100]).unwrap()),
            LockManager::new(),
            None,
            false,
        )
    }

    fn key(g: i64) -> Key {
        Key::point(g, format!("k{g}").into_bytes())
    }

    fn all_entities(segment: &Segment) -> Vec<Entity> {
        segment
            .iter(Range::FULL, None)
            .unwrap()
            .collect::<CoreResult<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn insert_get_delete() {
        let temp = tempdir().unwrap();
        let seg = segment(&temp);

        seg.insert(key(5), b"five".to_vec()).unwrap();
        assert_eq!(seg.get(&key(5)).unwrap(), Some(b"five".to_vec()));
        assert!(seg.contains(&key(5)).unwrap());

        seg.delete(key(5)).unwrap();
        assert_eq!(seg.get(&key(5)).unwrap(), None);
        assert!(!seg.contains(&key(5)).unwrap());
    }

    #[test]
    fn get_missing_key_in_empty_segment() {
        let temp = tempdir().unwrap();
        let seg = segment(&temp);
        assert!(!seg.exists());
        assert_eq!(seg.get(&key(1)).unwrap(), None);
    }

    #[test]
    fn insert_overwrites_value() {
        let temp = tempdir().unwrap();
        let seg = segment(&temp);
        seg.insert(key(5), b"a".to_vec()).unwrap();
        seg.insert(key(5), b"b".to_vec()).unwrap();
        assert_eq!(seg.get(&key(5)).unwrap(), Some(b"b".to_vec()));
        assert_eq!(all_entities(&seg).len(), 1);
    }

    #[test]
    fn validate_rollup_range_rules() {
        let temp = tempdir().unwrap();
        let seg = segment(&temp);

        assert!(seg.validate_rollup_range(Range::new(0, 99)).is_ok());
        assert!(seg.validate_rollup_range(Range::new(10, 19)).is_ok());
        assert!(seg.validate_rollup_range(Range::single(7)).is_ok());

        for bad in [
            Range::new(5, 14),
            Range::new(0, 49),
            Range::new(0, 5999),
            Range::new(5950, 6049),
            Range::new(-100, -1),
        ] {
            let err = seg.validate_rollup_range(bad).unwrap_err();
            assert!(matches!(err, CoreError::InvalidRollupRange { .. }), "{bad}");
        }
    }

    #[test]
    fn invalid_rollup_leaves_files_untouched() {
        let temp = tempdir().unwrap();
        let seg = segment(&temp);
        seg.insert(key(1), b"x".to_vec()).unwrap();
        let before = seg.chunk_ranges().unwrap();

        assert!(seg.rollup(Range::new(0, 49)).is_err());
        assert_eq!(seg.chunk_ranges().unwrap(), before);
    }

    fn put_chunk(segment: &Segment, range: Range, gs: &[i64]) {
        let entities: Vec<Entity> = gs
            .iter()
            .map(|&g| Entity::new(key(g), g.to_string().into_bytes()))
            .collect();
        segment.chunk(range).write(&entities, false).unwrap();
    }

    #[test]
    fn first_insert_takes_largest_free_range() {
        let temp = tempdir().unwrap();
        let seg = segment(&temp);
        seg.insert(key(7), b"7".to_vec()).unwrap();
        seg.insert(key(3), b"3".to_vec()).unwrap();
        assert_eq!(seg.chunk_ranges().unwrap(), vec![Range::new(0, 99)]);
    }

    #[test]
    fn rollup_merges_small_chunks() {
        let temp = tempdir().unwrap();
        let seg = segment(&temp);
        put_chunk(&seg, Range::single(3), &[3]);
        put_chunk(&seg, Range::single(7), &[7]);
        put_chunk(&seg, Range::single(8), &[8]);
        let before = all_entities(&seg);

        let outcome = seg.rollup(Range::new(0, 9)).unwrap();
        assert_eq!(
            outcome,
            RollupOutcome::Merged {
                sources: 3,
                entities: 3
            }
        );
        assert_eq!(seg.chunk_ranges().unwrap(), vec![Range::new(0, 9)]);
        assert_eq!(all_entities(&seg), before);

        assert_eq!(seg.rollup(Range::new(0, 9)).unwrap(), RollupOutcome::AlreadyDone);
        assert_eq!(seg.rollup(Range::single(3)).unwrap(), RollupOutcome::AlreadyDone);
        assert_eq!(seg.rollup(Range::new(10, 19)).unwrap(), RollupOutcome::Nothing);
    }

    #[test]
    fn rollup_of_deleted_entities_removes_chunks() {
        let temp = tempdir().unwrap();
        let seg = segment(&temp);
        put_chunk(&seg, Range::single(3), &[3]);
        put_chunk(&seg, Range::single(7), &[7]);
        seg.delete(key(7)).unwrap();
        seg.delete(key(3)).unwrap();
        assert_eq!(seg.chunk_ranges().unwrap().len(), 2);

        let outcome = seg.rollup(Range::new(0, 99)).unwrap();
        assert_eq!(
            outcome,
            RollupOutcome::Merged {
                sources: 2,
                entities: 0
            }
        );
        assert!(seg.chunk_ranges().unwrap().is_empty());
    }

    #[test]
    fn resume_after_rename_deletes_leftovers() {
        let temp = tempdir().unwrap();
        let seg = segment(&temp);
        put_chunk(&seg, Range::single(3), &[3]);
        put_chunk(&seg, Range::single(7), &[7]);

        seg.rollup_interrupted(Range::new(0, 9), RollupCrashPoint::AfterRename)
            .unwrap();
        assert_eq!(seg.chunk_ranges().unwrap().len(), 3);

        let outcome = seg.rollup(Range::new(0, 9)).unwrap();
        assert_eq!(outcome, RollupOutcome::Completed { removed: 2 });
        assert_eq!(seg.chunk_ranges().unwrap(), vec![Range::new(0, 9)]);
    }

    #[test]
    fn stray_temp_is_discarded_and_rollup_rerun() {
        let temp = tempdir().unwrap();
        let seg = segment(&temp);
        put_chunk(&seg, Range::single(3), &[3]);
        put_chunk(&seg, Range::single(7), &[7]);

        seg.rollup_interrupted(Range::new(0, 9), RollupCrashPoint::AfterTempWritten)
            .unwrap();
        assert!(seg.chunk(Range::new(0, 9)).temp_exists());

        seg.rollup(Range::new(0, 9)).unwrap();
        assert!(!seg.chunk(Range::new(0, 9)).temp_exists());
        assert_eq!(seg.chunk_ranges().unwrap(), vec![Range::new(0, 9)]);
        assert_eq!(seg.get(&key(3)).unwrap(), Some(b"3".to_vec()));
        assert_eq!(seg.get(&key(7)).unwrap(), Some(b"7".to_vec()));
    }

    #[test]
    fn pre_segment_range() {
        let temp = tempdir().unwrap();
        let seg = segment(&temp);
        assert_eq!(seg.pre_segment_range(), Some(Range::new(i64::MIN, -1)));
    }

    #[test]
    fn get_never_misses_a_key_moved_by_rollups() {
        let temp = tempdir().unwrap();
        let seg = Arc::new(segment(&temp));
        let stored = Entity::new(key(3), b"three".to_vec());
        seg.chunk(Range::single(3)).write(&[stored.clone()], false).unwrap();

        let churn = {
            let seg = Arc::clone(&seg);
            std::thread::spawn(move || {
                let mut ladder = seg.possible_chunk_ranges(3);
                ladder.sort_by_key(Range::lock_order);
                for _ in 0..200 {
                    seg.rollup(Range::new(0, 9)).unwrap();
                    // Split 0_9 back into 3_3 the way a writer would, under locks.
                    let _guards = seg
                        .locks()
                        .acquire_write_locks(ladder.iter().map(|r| seg.chunk(*r).path()));
                    seg.chunk(Range::single(3)).write(&[stored.clone()], false).unwrap();
                    seg.chunk(Range::new(0, 9)).remove(false).unwrap();
                }
            })
        };

        for _ in 0..2000 {
            assert_eq!(seg.get(&key(3)).unwrap(), Some(b"three".to_vec()));
        }
        churn.join().unwrap();
        assert_eq!(seg.get(&key(3)).unwrap(), Some(b"three".to_vec()));
    }
}
