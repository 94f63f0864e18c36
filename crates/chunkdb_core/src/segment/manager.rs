//! Maps grouping numbers to segments.

use crate::config::SegmentConfig;
use crate::error::CoreResult;
use crate::lock::LockManager;
use crate::range::Range;
use crate::recovery::RecoveryTarget;
use crate::rollup::Rollupable;
use crate::segment::layout::{existing_segment_ranges, segment_dir};
use crate::segment::{RollupOutcome, Segment};
use crate::types::{IndividualChange, Key, RollupTarget};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Owns the segment tree of a store and hands out [`Segment`] handles.
///
/// Segments are created lazily and cached by index. Creating a handle never
/// touches the disk; the segment directory appears with its first chunk.
pub struct SegmentManager {
    root: PathBuf,
    config: Arc<SegmentConfig>,
    locks: Arc<LockManager>,
    owner: Option<Arc<dyn Rollupable>>,
    sync: bool,
    segments: RwLock<HashMap<i64, Arc<Segment>>>,
}

impl SegmentManager {
    /// Creates a manager for the segment tree rooted at `root`.
    ///
    /// `owner` is notified of every chunk write so it can schedule rollups.
    pub fn new(
        root: impl Into<PathBuf>,
        config: SegmentConfig,
        locks: Arc<LockManager>,
        owner: Option<Arc<dyn Rollupable>>,
        sync: bool,
    ) -> Self {
        Self {
            root: root.into(),
            config: Arc::new(config),
            locks,
            owner,
            sync,
            segments: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the root of the segment tree.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the segment configuration.
    #[must_use]
    pub fn config(&self) -> &SegmentConfig {
        &self.config
    }

    /// Returns the lock table shared by every segment.
    #[must_use]
    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.locks
    }

    /// Returns the segment containing `grouping_number`.
    ///
    /// Every `i64` has a segment; the first and last segments are clamped to
    /// the ends of the domain. Only segments with a directory on disk are
    /// cached, so probing empty parts of the key space leaves nothing behind.
    pub fn get_segment(&self, grouping_number: i64) -> Arc<Segment> {
        let index = self.config.segment_index(grouping_number);
        if let Some(segment) = self.segments.read().get(&index) {
            return Arc::clone(segment);
        }

        let range = self.config.segment_range(grouping_number);
        let segment = Arc::new(Segment::new(
            segment_dir(&self.root, index, range),
            range,
            Arc::clone(&self.config),
            Arc::clone(&self.locks),
            self.owner.clone(),
            self.sync,
        ));
        if !segment.exists() {
            return segment;
        }
        Arc::clone(self.segments.write().entry(index).or_insert(segment))
    }

    /// Returns every segment overlapping `span`, in ascending order.
    ///
    /// Interval keys are stored in each of these segments.
    pub fn get_all_segments(&self, span: Range) -> Vec<Arc<Segment>> {
        let mut segments = vec![self.get_segment(span.start())];
        while let Some(last) = segments.last() {
            if last.range().end() >= span.end() {
                break;
            }
            match self.get_segment_after(last) {
                Some(next) => segments.push(next),
                None => break,
            }
        }
        segments
    }

    /// Returns the segments overlapping `range` whose directory exists.
    ///
    /// Empty parts of the key space are skipped without creating handles.
    pub fn get_existing_segments(&self, range: Range) -> CoreResult<Vec<Arc<Segment>>> {
        let ranges = existing_segment_ranges(&self.root, &self.config, range)?;
        Ok(ranges
            .into_iter()
            .map(|r| self.get_segment(r.start()))
            .collect())
    }

    /// Returns the first segment that stores `key`.
    pub fn get_first_segment(&self, key: &Key) -> Arc<Segment> {
        self.get_segment(key.grouping_number())
    }

    /// Returns the segment following `segment`, or `None` for the last one.
    pub fn get_segment_after(&self, segment: &Segment) -> Option<Arc<Segment>> {
        segment
            .range()
            .end()
            .checked_add(1)
            .map(|next| self.get_segment(next))
    }

    /// Returns the number of cached segment handles.
    #[must_use]
    pub fn cached_segments(&self) -> usize {
        self.segments.read().len()
    }
}

impl RecoveryTarget for SegmentManager {
    fn apply_changes(&self, changes: &[IndividualChange]) -> CoreResult<()> {
        crate::batch::apply_changes(self, changes)
    }

    fn rollup(&self, target: &RollupTarget) -> CoreResult<RollupOutcome> {
        self.get_segment(target.segment_grouping_number)
            .rollup(target.range)
    }
}

impl fmt::Debug for SegmentManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentManager")
            .field("root", &self.root)
            .field("config", &self.config)
            .field("cached_segments", &self.cached_segments())
            .finish_non_exhaustive()
    }
}
