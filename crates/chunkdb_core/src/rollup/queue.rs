//! The table of scheduled rollups.

use crate::range::Range;
use crate::rollup::Rollupable;
use crate::segment::Segment;
use crate::types::RollupTarget;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// A scheduled rollup as seen by [`RollupQueue::snapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledRollup {
    /// The rollup to run.
    pub target: RollupTarget,
    /// Time left until it becomes eligible (zero if overdue).
    pub due_in: Duration,
}

/// Rollup targets keyed by segment and range, each with the instant it
/// becomes eligible.
///
/// Every reported write schedules one target per rollup level above the
/// smallest that is larger than the written chunk. Level `i` of the ladder
/// waits `i * base_delay`, so small chunks age before they are folded into
/// bigger ones. Rescheduling a pending target keeps its earlier due time.
#[derive(Debug)]
pub struct RollupQueue {
    base_delay: Duration,
    entries: Mutex<HashMap<(i64, Range), (Instant, RollupTarget)>>,
}

impl RollupQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new(base_delay: Duration) -> Self {
        Self {
            base_delay,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Schedules the rollups that would absorb a chunk `written` in `segment`.
    pub fn schedule_write(&self, segment: &Segment, written: Range) {
        let segment_range = segment.range();
        if written.end() < segment_range.start() {
            // The pre-segment chunk is never rolled up.
            return;
        }

        let now = Instant::now();
        let mut entries = self.entries.lock();
        for (level_index, &level) in segment.rollup_levels().iter().enumerate().skip(1) {
            if u128::from(level.unsigned_abs()) <= written.len() {
                continue;
            }
            let Some(range) = Range::aligned(written.start(), level).intersection(&segment_range)
            else {
                continue;
            };
            let delay = self
                .base_delay
                .saturating_mul(u32::try_from(level_index).unwrap_or(u32::MAX));
            let target = RollupTarget {
                segment_grouping_number: segment_range.start(),
                range,
                scheduled_delay_millis: i64::try_from(delay.as_millis()).unwrap_or(i64::MAX),
            };
            Self::insert(&mut entries, target, now + delay);
        }
    }

    /// Schedules `target` to run after `delay`.
    pub fn schedule(&self, target: RollupTarget, delay: Duration) {
        let mut entries = self.entries.lock();
        Self::insert(&mut entries, target, Instant::now() + delay);
    }

    fn insert(
        entries: &mut HashMap<(i64, Range), (Instant, RollupTarget)>,
        target: RollupTarget,
        due: Instant,
    ) {
        let key = (target.segment_grouping_number, target.range);
        match entries.get_mut(&key) {
            Some((existing_due, _)) if *existing_due <= due => {}
            Some(entry) => *entry = (due, target),
            None => {
                entries.insert(key, (due, target));
            }
        }
    }

    /// Removes and returns the targets due at `now`, smallest range first.
    pub fn take_due(&self, now: Instant) -> Vec<RollupTarget> {
        let mut entries = self.entries.lock();
        let due: Vec<(i64, Range)> = entries
            .iter()
            .filter(|(_, (at, _))| *at <= now)
            .map(|(key, _)| *key)
            .collect();
        let mut targets: Vec<RollupTarget> = due
            .into_iter()
            .filter_map(|key| entries.remove(&key).map(|(_, target)| target))
            .collect();
        sort_for_execution(&mut targets);
        targets
    }

    /// Removes and returns every target regardless of due time.
    pub fn take_all(&self) -> Vec<RollupTarget> {
        let mut targets: Vec<RollupTarget> = self
            .entries
            .lock()
            .drain()
            .map(|(_, (_, target))| target)
            .collect();
        sort_for_execution(&mut targets);
        targets
    }

    /// Returns a read-only copy of the table, smallest range first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ScheduledRollup> {
        let now = Instant::now();
        let mut scheduled: Vec<ScheduledRollup> = self
            .entries
            .lock()
            .values()
            .map(|(due, target)| ScheduledRollup {
                target: *target,
                due_in: due.saturating_duration_since(now),
            })
            .collect();
        scheduled.sort_by_key(|s| (s.target.range.len(), s.target.range));
        scheduled
    }

    /// Returns the number of scheduled targets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if nothing is scheduled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Smaller ranges first so nested levels merge bottom-up.
fn sort_for_execution(targets: &mut [RollupTarget]) {
    targets.sort_by_key(|t| (t.range.len(), t.range));
}

impl Rollupable for RollupQueue {
    fn report_write(&self, segment: &Segment, written: Range) {
        self.schedule_write(segment, written);
    }
}
