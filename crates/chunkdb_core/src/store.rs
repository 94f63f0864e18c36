//! Store facade.

use crate::config::{StoreConfig, SegmentConfig};
use crate::dir::{StoreDir, StoreMeta, FORMAT_VERSION};
use crate::error::{CoreError, CoreResult};
use crate::lock::LockManager;
use crate::range::Range;
use crate::recovery::{RecoveryManager, RecoveryReport};
use crate::rollup::{RollupQueue, RollupScheduler, Rollupable, ScheduledRollup};
use crate::segment::{RollupOutcome, Segment, SegmentIterator, SegmentManager, SkippedChunk};
use crate::types::{Entity, IndividualChange, Key, RollupTarget};
use parking_lot::Mutex;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// State shared with the rollup thread.
struct StoreInner {
    dir: StoreDir,
    config: StoreConfig,
    meta: StoreMeta,
    segments: SegmentManager,
    recovery: RecoveryManager,
    recovered: RecoveryReport,
    queue: Arc<RollupQueue>,
}

impl StoreInner {
    fn run_rollup(&self, target: RollupTarget) -> CoreResult<RollupOutcome> {
        self.segments
            .get_segment(target.segment_grouping_number)
            .validate_rollup_range(target.range)?;
        self.recovery.rollup(&self.segments, target)
    }

    /// Runs due rollups, logging failures. The log entry of a failed rollup
    /// stays behind for the next recovery.
    fn run_due_rollups(&self) {
        for target in self.queue.take_due(Instant::now()) {
            match self.run_rollup(target) {
                Ok(outcome) => tracing::debug!(%target, ?outcome, "background rollup finished"),
                Err(e) => tracing::error!(%target, error = %e, "background rollup failed"),
            }
        }
    }
}

/// An open store.
///
/// `Store` ties the pieces together: every write is journaled by the
/// recovery manager before the batch writer touches chunk files, every chunk
/// write schedules rollups, and a background thread runs the due ones.
///
/// # Opening a Store
///
/// ```rust,ignore
/// use chunkdb_core::{Key, KeyKind, Range, Store, StoreConfig};
/// use std::path::Path;
///
/// let store = Store::open(Path::new("my_store"), StoreConfig::new().key_kind(KeyKind::Time))?;
/// store.insert(Key::point(1_700_000_000_000, b"sensor-1".to_vec()), b"21.5".to_vec())?;
///
/// for entity in store.iter(Range::new(1_700_000_000_000, 1_700_000_060_000))? {
///     let entity = entity?;
///     println!("{} = {:?}", entity.key, entity.value);
/// }
/// ```
///
/// Dropping the store stops the rollup thread and releases the directory lock.
pub struct Store {
    inner: Arc<StoreInner>,
    scheduler: Mutex<Option<RollupScheduler>>,
}

impl Store {
    /// Opens or creates a store.
    ///
    /// Opening replays the pending log. A pending entry that cannot be
    /// replayed aborts the open with [`CoreError::UnrecoverableLogEntry`].
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Another process has the store locked (`StoreLocked`)
    /// - The configuration does not match the one the store was created with
    /// - Recovery fails
    /// - I/O errors occur
    pub fn open(path: &Path, config: StoreConfig) -> CoreResult<Self> {
        let dir = StoreDir::open(path, config.create_if_missing)?;
        let meta = Self::load_or_create_meta(&dir, &config)?;

        let queue = Arc::new(RollupQueue::new(config.rollup_base_delay));
        let owner: Arc<dyn Rollupable> = queue.clone();
        let segments = SegmentManager::new(
            dir.data_dir(),
            meta.segment.clone(),
            LockManager::shared(),
            Some(owner),
            config.sync_writes,
        );

        let recovery = RecoveryManager::open(dir.recovery_dir(), config.sync_writes)?;
        let report = recovery.recover(&segments)?;
        tracing::info!(
            path = %path.display(),
            segment_size = meta.segment.segment_size(),
            replayed = report.replayed,
            "opened store"
        );

        let inner = Arc::new(StoreInner {
            dir,
            config,
            meta,
            segments,
            recovery,
            recovered: report,
            queue,
        });

        let scheduler = if inner.config.background_rollups {
            let weak = Arc::downgrade(&inner);
            Some(RollupScheduler::spawn(
                inner.config.rollup_poll_interval,
                move || match weak.upgrade() {
                    Some(inner) => {
                        inner.run_due_rollups();
                        true
                    }
                    None => false,
                },
            )?)
        } else {
            None
        };

        Ok(Self {
            inner,
            scheduler: Mutex::new(scheduler),
        })
    }

    fn load_or_create_meta(dir: &StoreDir, config: &StoreConfig) -> CoreResult<StoreMeta> {
        if let Some(meta) = dir.load_meta()? {
            if meta.format_version.0 != FORMAT_VERSION.0 {
                return Err(CoreError::invalid_config(format!(
                    "unsupported store format {}.{}",
                    meta.format_version.0, meta.format_version.1
                )));
            }
            if let Some(segment) = &config.segment {
                if *segment != meta.segment {
                    return Err(CoreError::invalid_config(format!(
                        "store was created with segment size {} and levels {:?}",
                        meta.segment.segment_size(),
                        meta.segment.rollup_levels()
                    )));
                }
            } else if config.key_kind != meta.key_kind {
                return Err(CoreError::invalid_config(format!(
                    "store was created for {:?} keys",
                    meta.key_kind
                )));
            }
            return Ok(meta);
        }

        let meta = StoreMeta {
            format_version: FORMAT_VERSION,
            key_kind: config.key_kind,
            segment: config.segment_config(),
        };
        dir.save_meta(&meta)?;
        Ok(meta)
    }

    /// Returns the store root.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.inner.dir.path()
    }

    /// Returns the configuration the store was opened with.
    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Returns the persisted metadata.
    #[must_use]
    pub fn meta(&self) -> &StoreMeta {
        &self.inner.meta
    }

    /// Returns the segment configuration in effect.
    #[must_use]
    pub fn segment_config(&self) -> &SegmentConfig {
        &self.inner.meta.segment
    }

    /// Returns the segment manager.
    #[must_use]
    pub fn segments(&self) -> &SegmentManager {
        &self.inner.segments
    }

    /// Returns the recovery manager.
    #[must_use]
    pub fn recovery(&self) -> &RecoveryManager {
        &self.inner.recovery
    }

    /// Returns the lock table.
    #[must_use]
    pub fn lock_manager(&self) -> &Arc<LockManager> {
        self.inner.segments.lock_manager()
    }

    /// Reads the value stored under `key`.
    pub fn get(&self, key: &Key) -> CoreResult<Option<Vec<u8>>> {
        self.inner.segments.get_first_segment(key).get(key)
    }

    /// Returns true if `key` is stored.
    pub fn contains(&self, key: &Key) -> CoreResult<bool> {
        self.inner.segments.get_first_segment(key).contains(key)
    }

    /// Inserts or replaces an entity.
    pub fn insert(&self, key: Key, value: impl Into<Vec<u8>>) -> CoreResult<()> {
        let inner = &self.inner;
        inner
            .recovery
            .apply_change(&inner.segments, IndividualChange::insert(key, value))
    }

    /// Replaces an entity and returns the previous value.
    pub fn update(&self, key: Key, value: impl Into<Vec<u8>>) -> CoreResult<Option<Vec<u8>>> {
        let old = self.get(&key)?;
        let change = IndividualChange::update(key, old.clone(), value);
        self.inner.recovery.apply_change(&self.inner.segments, change)?;
        Ok(old)
    }

    /// Deletes an entity and returns its value, if it existed.
    pub fn delete(&self, key: Key) -> CoreResult<Option<Vec<u8>>> {
        let Some(old) = self.get(&key)? else {
            return Ok(None);
        };
        let change = IndividualChange::delete(key, Some(old.clone()));
        self.inner.recovery.apply_change(&self.inner.segments, change)?;
        Ok(Some(old))
    }

    /// Applies several changes as one journaled batch.
    pub fn apply_batch(&self, changes: Vec<IndividualChange>) -> CoreResult<()> {
        self.inner.recovery.apply_batch(&self.inner.segments, changes)
    }

    /// Returns an iterator over every entity whose key overlaps `range`,
    /// using the configured iterator timeout.
    pub fn iter(&self, range: Range) -> CoreResult<StoreIterator> {
        self.iter_with_timeout(range, self.inner.config.iterator_timeout)
    }

    /// Returns an iterator with an explicit inactivity timeout.
    ///
    /// Without a timeout the iterator holds a plain read lock on its current
    /// chunk. Writing to that chunk from the thread that owns the iterator then
    /// blocks forever, so close or drop the iterator first.
    pub fn iter_with_timeout(
        &self,
        range: Range,
        timeout: Option<Duration>,
    ) -> CoreResult<StoreIterator> {
        let segments = self.inner.segments.get_existing_segments(range)?;
        Ok(StoreIterator::new(segments, range, timeout))
    }

    /// Runs a rollup through the pending log.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRollupRange` without touching any file if the range is
    /// not a level-aligned range of the target segment.
    pub fn rollup(&self, target: RollupTarget) -> CoreResult<RollupOutcome> {
        self.inner.run_rollup(target)
    }

    /// Runs every scheduled rollup now, ignoring delays. Returns how many ran.
    ///
    /// A failing rollup does not stop the others. It goes back into the
    /// schedule with the base delay and the first error is returned once
    /// every target has been tried.
    pub fn run_pending_rollups(&self) -> CoreResult<usize> {
        let targets = self.inner.queue.take_all();
        let count = targets.len();
        let mut first_error = None;
        for target in targets {
            if let Err(e) = self.inner.run_rollup(target) {
                tracing::error!(%target, error = %e, "forced rollup failed, rescheduling");
                self.inner
                    .queue
                    .schedule(target, self.inner.config.rollup_base_delay);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(count),
        }
    }

    /// Returns what the replay during [`open`](Self::open) did.
    #[must_use]
    pub fn recovery_report(&self) -> RecoveryReport {
        self.inner.recovered
    }

    /// Replays the pending log on demand.
    pub fn recover(&self) -> CoreResult<RecoveryReport> {
        self.inner.recovery.recover(&self.inner.segments)
    }

    /// Schedules rollups for every chunk file on disk, as if each had just
    /// been written. Returns the number of chunks reported.
    ///
    /// The schedule lives in memory, so a reopened store starts empty.
    pub fn schedule_existing_chunks(&self) -> CoreResult<usize> {
        let mut chunks = 0;
        for segment in self.inner.segments.get_existing_segments(Range::FULL)? {
            for range in segment.chunk_ranges()? {
                self.inner.queue.schedule_write(&segment, range);
                chunks += 1;
            }
        }
        Ok(chunks)
    }

    /// Returns a read-only snapshot of the scheduled rollups.
    #[must_use]
    pub fn scheduled_rollups(&self) -> Vec<ScheduledRollup> {
        self.inner.queue.snapshot()
    }

    /// Stops the background rollup thread. Scheduled targets stay queued.
    pub fn stop_background_rollups(&self) {
        if let Some(mut scheduler) = self.scheduler.lock().take() {
            scheduler.shutdown();
        }
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.path())
            .field("meta", &self.inner.meta)
            .field("scheduled_rollups", &self.inner.queue.len())
            .finish_non_exhaustive()
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        self.stop_background_rollups();
    }
}

/// Iterator over every entity of a store overlapping a range.
///
/// Segments are scanned in ascending order with one [`SegmentIterator`] at a
/// time. An interval key stored in several segments is yielded once, by the
/// segment holding the first grouping number the key shares with the query.
pub struct StoreIterator {
    segments: std::vec::IntoIter<Arc<Segment>>,
    current: Option<(Range, SegmentIterator)>,
    query: Range,
    timeout: Option<Duration>,
    peeked: Option<Entity>,
    last_used: Instant,
    closed: Option<String>,
    failures: Vec<SkippedChunk>,
}

impl StoreIterator {
    fn new(segments: Vec<Arc<Segment>>, query: Range, timeout: Option<Duration>) -> Self {
        Self {
            segments: segments.into_iter(),
            current: None,
            query,
            timeout,
            peeked: None,
            last_used: Instant::now(),
            closed: None,
            failures: Vec::new(),
        }
    }

    /// Returns true if another entity is available.
    pub fn has_next(&mut self) -> CoreResult<bool> {
        if self.peeked.is_some() {
            self.keep_alive()?;
            return Ok(true);
        }
        self.touch()?;
        self.peeked = self.advance()?;
        Ok(self.peeked.is_some())
    }

    /// Resets the inactivity timer of this iterator and its current segment.
    pub fn keep_alive(&mut self) -> CoreResult<()> {
        self.touch()?;
        self.renew_current()
    }

    fn renew_current(&mut self) -> CoreResult<()> {
        if let Some((_, iter)) = &mut self.current {
            if let Err(e) = iter.keep_alive() {
                self.shut(e.to_string());
                return Err(e);
            }
        }
        Ok(())
    }

    /// Closes the iterator and releases its lock.
    pub fn close(&mut self) {
        self.shut("closed by caller");
    }

    /// Returns true once the iterator was closed or timed out.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_some()
    }

    /// Returns the chunk files skipped so far because they could not be read.
    #[must_use]
    pub fn read_failures(&self) -> Vec<SkippedChunk> {
        let mut failures = self.failures.clone();
        if let Some((_, iter)) = &self.current {
            failures.extend_from_slice(iter.read_failures());
        }
        failures
    }

    fn shut(&mut self, reason: impl Into<String>) {
        if let Some((_, mut iter)) = self.current.take() {
            self.failures.extend_from_slice(iter.read_failures());
            iter.close();
        }
        self.segments = Vec::new().into_iter();
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
                self.shut(reason.clone());
                return Err(CoreError::iterator_closed(reason));
            }
        }
        self.last_used = Instant::now();
        Ok(())
    }

    fn advance(&mut self) -> CoreResult<Option<Entity>> {
        loop {
            if let Some((range, iter)) = &mut self.current {
                match iter.next() {
                    Some(Ok(entity)) => {
                        let first_shared = entity.key.span().start().max(self.query.start());
                        if range.contains(first_shared) {
                            return Ok(Some(entity));
                        }
                        continue;
                    }
                    Some(Err(e)) => return Err(e),
                    None => {
                        self.failures.extend_from_slice(iter.read_failures());
                        self.current = None;
                    }
                }
            }

            let Some(segment) = self.segments.next() else {
                return Ok(None);
            };
            let iter = segment.iter(self.query, self.timeout)?;
            self.current = Some((segment.range(), iter));
        }
    }
}

impl Iterator for StoreIterator {
    type Item = CoreResult<Entity>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Err(e) = self.touch() {
            return Some(Err(e));
        }
        if let Some(entity) = self.peeked.take() {
            if let Err(e) = self.renew_current() {
                return Some(Err(e));
            }
            return Some(Ok(entity));
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

impl fmt::Debug for StoreIterator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreIterator")
            .field("query", &self.query)
            .field("current", &self.current.as_ref().map(|(range, _)| *range))
            .field("remaining_segments", &self.segments.len())
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}
