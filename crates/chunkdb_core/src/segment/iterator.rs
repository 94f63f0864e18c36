//! Lazy iteration over the chunk files of one segment.

use crate::chunk::{list_chunk_ranges, ChunkFile};
use crate::error::{CoreError, CoreResult};
use crate::lock::{LeasedReadLock, LockManager, ReadLockGuard};
use crate::range::Range;
use crate::segment::Segment;
use crate::types::Entity;
use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A chunk file the iterator could not decode and skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedChunk {
    /// Path of the chunk file.
    pub path: PathBuf,
    /// Decode error.
    pub message: String,
}

enum ChunkLock {
    Scoped(ReadLockGuard),
    Leased(LeasedReadLock),
}

impl ChunkLock {
    fn path(&self) -> &Path {
        match self {
            Self::Scoped(guard) => guard.path(),
            Self::Leased(lease) => lease.path(),
        }
    }
}

struct OpenChunk {
    range: Range,
    entities: std::vec::IntoIter<Entity>,
    lock: ChunkLock,
}

/// Forward-only iterator over the entities of one segment whose key overlaps
/// a query range.
///
/// Chunk files are visited in ascending range order and only the chunk being
/// read is locked. A chunk that disappears because a rollup superseded it is
/// not an error: the iterator re-lists the segment and continues after the
/// last chunk it finished, so no entity is yielded twice.
///
/// With a timeout the read lock is a lease. An iterator that is neither
/// advanced nor kept alive for the timeout closes itself; the next call fails
/// with [`CoreError::IteratorClosed`].
pub struct SegmentIterator {
    dir: PathBuf,
    segment: Range,
    locks: Arc<LockManager>,
    query: Range,
    timeout: Option<Duration>,
    pending: VecDeque<Range>,
    current: Option<OpenChunk>,
    /// End of the last chunk finished; entities at or below it were yielded.
    resume_after: Option<i64>,
    peeked: Option<Entity>,
    last_used: Instant,
    closed: Option<String>,
    finished: bool,
    failures: Vec<SkippedChunk>,
}

impl SegmentIterator {
    pub(crate) fn new(
        segment: &Segment,
        query: Range,
        timeout: Option<Duration>,
    ) -> CoreResult<Self> {
        let mut iter = Self {
            dir: segment.dir().to_path_buf(),
            segment: segment.range(),
            locks: Arc::clone(segment.locks()),
            query,
            timeout,
            pending: VecDeque::new(),
            current: None,
            resume_after: None,
            peeked: None,
            last_used: Instant::now(),
            closed: None,
            finished: false,
            failures: Vec::new(),
        };
        iter.relist()?;
        Ok(iter)
    }

    /// Returns the query range.
    #[must_use]
    pub const fn query(&self) -> Range {
        self.query
    }

    /// Returns true if another entity is available.
    pub fn has_next(&mut self) -> CoreResult<bool> {
        self.touch()?;
        if self.peeked.is_none() {
            self.peeked = self.advance()?;
        }
        Ok(self.peeked.is_some())
    }

    /// Resets the inactivity timer and renews the lease on the current chunk.
    pub fn keep_alive(&mut self) -> CoreResult<()> {
        self.touch()
    }

    /// Closes the iterator and releases its lock. Later calls fail with
    /// [`CoreError::IteratorClosed`].
    pub fn close(&mut self) {
        self.shut("closed by caller");
    }

    /// Returns true once the iterator was closed explicitly or timed out.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_some()
    }

    /// Returns the chunk files skipped because they could not be decoded.
    #[must_use]
    pub fn read_failures(&self) -> &[SkippedChunk] {
        &self.failures
    }

    fn shut(&mut self, reason: impl Into<String>) {
        self.current = None;
        self.pending.clear();
        self.peeked = None;
        if self.closed.is_none() {
            self.closed = Some(reason.into());
        }
    }

    fn touch(&mut self) -> CoreResult<()> {
        if let Some(reason) = &self.closed {
            return Err(CoreError::iterator_closed(reason.clone()));
        }
        if let Some(timeout) = self.timeout {
            if self.last_used.elapsed() > timeout {
                let reason = format!("no activity for {timeout:?}");
                tracing::debug!(dir = %self.dir.display(), "iterator timed out");
                self.shut(reason.clone());
                return Err(CoreError::iterator_closed(reason));
            }
            let renewed = match &self.current {
                Some(OpenChunk {
                    lock: ChunkLock::Leased(lease),
                    ..
                }) => lease.renew(timeout),
                _ => Ok(()),
            };
            if let Err(e) = renewed {
                self.shut(e.to_string());
                return Err(e);
            }
        }
        self.last_used = Instant::now();
        Ok(())
    }

    fn selects(&self, range: Range) -> bool {
        // An interval key sits in the chunk of its first grouping number, which
        // may end before the query starts, so every chunk up to the query end
        // is a candidate. This includes the pre-segment catch-all chunk.
        range.start() <= self.query.end()
            && self.resume_after.map_or(true, |after| range.end() > after)
    }

    fn relist(&mut self) -> CoreResult<()> {
        let ranges = list_chunk_ranges(&self.dir)?;
        self.pending = ranges.into_iter().filter(|r| self.selects(*r)).collect();
        Ok(())
    }

    fn finish_chunk(&mut self, range: Range) {
        self.resume_after = Some(self.resume_after.map_or(range.end(), |a| a.max(range.end())));
    }

    fn advance(&mut self) -> CoreResult<Option<Entity>> {
        loop {
            if let Some(open) = &mut self.current {
                let query = self.query;
                let resume_after = self.resume_after;
                let next = open.entities.by_ref().find(|entity| {
                    entity.key.span().overlaps(&query)
                        && resume_after.map_or(true, |after| entity.key.grouping_number() > after)
                });
                if next.is_some() {
                    return Ok(next);
                }
                let range = open.range;
                self.current = None;
                self.finish_chunk(range);
                continue;
            }

            let Some(range) = self.pending.pop_front() else {
                self.finished = true;
                return Ok(None);
            };
            self.open(range)?;
        }
    }

    fn open(&mut self, range: Range) -> CoreResult<()> {
        let chunk = ChunkFile::new(&self.dir, range);
        let path = chunk.path();
        let lock = match self.timeout {
            Some(timeout) => ChunkLock::Leased(self.locks.acquire_leased_read_lock(&path, timeout)),
            None => ChunkLock::Scoped(self.locks.acquire_read_lock(&path)),
        };

        match chunk.read() {
            Ok(entities) => {
                self.current = Some(OpenChunk {
                    range,
                    entities: entities.into_iter(),
                    lock,
                });
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                drop(lock);
                tracing::debug!(chunk = %range, "chunk vanished during iteration, re-listing");
                self.relist()
            }
            Err(CoreError::ChunkReadFailure { path, message }) => {
                tracing::warn!(path = %path.display(), %message, "skipping unreadable chunk file");
                self.failures.push(SkippedChunk { path, message });
                self.finish_chunk(range);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

impl Iterator for SegmentIterator {
    type Item = CoreResult<Entity>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Err(e) = self.touch() {
            return Some(Err(e));
        }
        if let Some(entity) = self.peeked.take() {
            return Some(Ok(entity));
        }
        if self.finished {
            return None;
        }
        match self.advance() {
            Ok(next) => next.map(Ok),
            Err(e) => {
                self.shut(e.to_string());
                Some(Err(e))
            }
        }
    }
}

impl fmt::Debug for SegmentIterator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentIterator")
            .field("segment", &self.segment)
            .field("query", &self.query)
            .field("current", &self.current.as_ref().map(|c| c.lock.path()))
            .field("pending", &self.pending.len())
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SegmentConfig;
    use crate::types::Key;
    use std::fs;
    use std::thread;
    use tempfile::{tempdir, TempDir};

    fn segment(temp: &TempDir, locks: Arc<LockManager>) -> Segment {
        Segment::new(
            temp.path().join("seg"),
            Range::new(0, 5999),
            Arc::new(SegmentConfig::new(6000, vec![1, 10, 100]).unwrap()),
            locks,
            None,
            false,
        )
    }

    fn put_chunk(segment: &Segment, range: Range, gs: &[i64]) {
        let entities: Vec<Entity> = gs
            .iter()
            .map(|&g| Entity::new(Key::point(g, vec![1]), g.to_le_bytes().to_vec()))
            .collect();
        segment.chunk(range).write(&entities, false).unwrap();
    }

    fn groups(iter: SegmentIterator) -> Vec<i64> {
        iter.map(|e| e.unwrap().key.grouping_number()).collect()
    }

    #[test]
    fn visits_chunks_in_range_order() {
        let temp = tempdir().unwrap();
        let seg = segment(&temp, LockManager::new());
        put_chunk(&seg, Range::new(100, 199), &[150, 120]);
        put_chunk(&seg, Range::single(7), &[7]);
        put_chunk(&seg, Range::new(10, 19), &[11, 18]);

        let iter = seg.iter(Range::FULL, None).unwrap();
        assert_eq!(groups(iter), vec![7, 11, 18, 150, 120]);
    }

    #[test]
    fn query_filters_entities() {
        let temp = tempdir().unwrap();
        let seg = segment(&temp, LockManager::new());
        put_chunk(&seg, Range::new(0, 99), &[1, 50, 99]);
        put_chunk(&seg, Range::new(100, 199), &[100, 150]);

        let iter = seg.iter(Range::new(50, 120), None).unwrap();
        assert_eq!(groups(iter), vec![50, 99, 100]);
    }

    #[test]
    fn empty_segment_yields_nothing() {
        let temp = tempdir().unwrap();
        let seg = segment(&temp, LockManager::new());
        let mut iter = seg.iter(Range::FULL, None).unwrap();
        assert!(!iter.has_next().unwrap());
        assert!(iter.next().is_none());
    }

    #[test]
    fn has_next_does_not_consume() {
        let temp = tempdir().unwrap();
        let seg = segment(&temp, LockManager::new());
        put_chunk(&seg, Range::single(3), &[3]);

        let mut iter = seg.iter(Range::FULL, None).unwrap();
        assert!(iter.has_next().unwrap());
        assert!(iter.has_next().unwrap());
        assert_eq!(iter.next().unwrap().unwrap().key.grouping_number(), 3);
        assert!(!iter.has_next().unwrap());
    }

    #[test]
    fn holds_lock_only_on_current_chunk() {
        let temp = tempdir().unwrap();
        let locks = LockManager::new();
        let seg = segment(&temp, Arc::clone(&locks));
        put_chunk(&seg, Range::single(3), &[3]);
        put_chunk(&seg, Range::single(7), &[7]);

        let mut iter = seg.iter(Range::FULL, None).unwrap();
        iter.next().unwrap().unwrap();
        assert!(locks.is_locked(&seg.chunk(Range::single(3)).path()));
        assert!(!locks.is_locked(&seg.chunk(Range::single(7)).path()));

        iter.next().unwrap().unwrap();
        assert!(!locks.is_locked(&seg.chunk(Range::single(3)).path()));
        assert!(locks.is_locked(&seg.chunk(Range::single(7)).path()));

        assert!(iter.next().is_none());
        assert_eq!(locks.tracked_paths(), 0);
    }

    #[test]
    fn close_releases_lock_and_fails_later_calls() {
        let temp = tempdir().unwrap();
        let locks = LockManager::new();
        let seg = segment(&temp, Arc::clone(&locks));
        put_chunk(&seg, Range::single(3), &[3, 3]);

        let mut iter = seg.iter(Range::FULL, None).unwrap();
        assert!(iter.has_next().unwrap());
        iter.close();

        assert!(iter.is_closed());
        assert!(!locks.is_locked(&seg.chunk(Range::single(3)).path()));
        assert!(matches!(
            iter.next(),
            Some(Err(CoreError::IteratorClosed { .. }))
        ));
        assert!(iter.has_next().is_err());
    }

    #[test]
    fn idle_iterator_times_out() {
        let temp = tempdir().unwrap();
        let locks = LockManager::new();
        let seg = segment(&temp, Arc::clone(&locks));
        put_chunk(&seg, Range::single(3), &[3]);
        put_chunk(&seg, Range::single(4), &[4]);

        let mut iter = seg.iter(Range::FULL, Some(Duration::from_millis(30))).unwrap();
        iter.next().unwrap().unwrap();
        thread::sleep(Duration::from_millis(60));

        assert!(matches!(
            iter.next(),
            Some(Err(CoreError::IteratorClosed { .. }))
        ));
        assert!(iter.is_closed());
        assert!(!locks.is_locked(&seg.chunk(Range::single(3)).path()));
    }

    #[test]
    fn keep_alive_prevents_timeout() {
        let temp = tempdir().unwrap();
        let seg = segment(&temp, LockManager::new());
        put_chunk(&seg, Range::single(3), &[3]);
        put_chunk(&seg, Range::single(4), &[4]);

        let mut iter = seg.iter(Range::FULL, Some(Duration::from_millis(200))).unwrap();
        iter.next().unwrap().unwrap();
        for _ in 0..4 {
            thread::sleep(Duration::from_millis(60));
            iter.keep_alive().unwrap();
        }
        assert_eq!(iter.next().unwrap().unwrap().key.grouping_number(), 4);
    }

    #[test]
    fn survives_rollup_between_chunks() {
        let temp = tempdir().unwrap();
        let seg = segment(&temp, LockManager::new());
        put_chunk(&seg, Range::single(3), &[3]);
        put_chunk(&seg, Range::single(5), &[5]);
        put_chunk(&seg, Range::single(8), &[8]);

        let mut iter = seg.iter(Range::FULL, None).unwrap();
        assert_eq!(iter.next().unwrap().unwrap().key.grouping_number(), 3);
        // What a rollup of 0_9 leaves behind once it gets the locks.
        put_chunk(&seg, Range::new(0, 9), &[3, 5, 8]);
        fs::remove_file(seg.chunk(Range::single(5)).path()).unwrap();
        fs::remove_file(seg.chunk(Range::single(8)).path()).unwrap();
        fs::remove_file(seg.chunk(Range::single(3)).path()).unwrap();

        let rest: Vec<i64> = iter.map(|e| e.unwrap().key.grouping_number()).collect();
        assert_eq!(rest, vec![5, 8]);
    }

    #[test]
    fn unreadable_chunk_is_skipped_and_recorded() {
        let temp = tempdir().unwrap();
        let seg = segment(&temp, LockManager::new());
        put_chunk(&seg, Range::single(3), &[3]);
        put_chunk(&seg, Range::single(7), &[7]);
        fs::write(seg.chunk(Range::single(3)).path(), b"corrupt").unwrap();

        let mut iter = seg.iter(Range::FULL, None).unwrap();
        assert_eq!(iter.next().unwrap().unwrap().key.grouping_number(), 7);
        assert!(iter.next().is_none());
        assert_eq!(iter.read_failures().len(), 1);
        assert_eq!(iter.read_failures()[0].path, seg.chunk(Range::single(3)).path());
    }

    #[test]
    fn catch_all_chunk_is_visited_first() {
        let temp = tempdir().unwrap();
        let seg = segment(&temp, LockManager::new());
        let spanning = Entity::new(Key::interval(Range::new(-50, 20), vec![9]), vec![1]);
        seg.chunk(Range::new(i64::MIN, -1))
            .write(&[spanning.clone()], false)
            .unwrap();
        put_chunk(&seg, Range::single(3), &[3]);

        let all: Vec<Entity> = seg
            .iter(Range::new(0, 10), None)
            .unwrap()
            .collect::<CoreResult<_>>()
            .unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0], spanning);

        let later = seg.iter(Range::new(30, 40), None).unwrap();
        assert_eq!(later.count(), 0);
    }

    #[test]
    fn interval_key_found_past_its_chunk() {
        let temp = tempdir().unwrap();
        let seg = segment(&temp, LockManager::new());
        let wide = Entity::new(Key::interval(Range::new(10, 500), vec![2]), vec![1]);
        seg.chunk(Range::new(10, 19)).write(&[wide.clone()], false).unwrap();
        put_chunk(&seg, Range::new(200, 299), &[250]);
        put_chunk(&seg, Range::new(600, 699), &[650]);

        let hits: Vec<Entity> = seg
            .iter(Range::new(200, 300), None)
            .unwrap()
            .collect::<CoreResult<_>>()
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0], wide);
        assert_eq!(hits[1].key.grouping_number(), 250);

        assert_eq!(groups(seg.iter(Range::new(501, 700), None).unwrap()), vec![650]);
    }
}
