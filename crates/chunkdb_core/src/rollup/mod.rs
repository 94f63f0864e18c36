//! Rollup scheduling.
//!
//! Writes report the chunk they produced to the segment's owner through
//! [`Rollupable`]. The store's owner is a [`RollupQueue`], and a
//! [`RollupScheduler`] thread periodically takes the due targets and runs
//! them through the recovery manager so each rollup is journaled.

mod queue;
mod scheduler;

pub use queue::{RollupQueue, ScheduledRollup};
pub use scheduler::RollupScheduler;

use crate::range::Range;
use crate::segment::Segment;

/// Receives a notification for every chunk file a write produced.
pub trait Rollupable: Send + Sync {
    /// Called after `written` was (re)written in `segment`.
    fn report_write(&self, segment: &Segment, written: Range);
}
