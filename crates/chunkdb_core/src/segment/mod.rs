//! Segments and their chunk files.
//!
//! The key space is cut into fixed-size, aligned segments. Each segment is a
//! directory of chunk files named by the range they cover:
//!
//! ```text
//! <data>/pos/0/000/000/000/000/000/0_5999/
//! ├─ -9223372036854775808_-1   # catch-all for interval keys starting earlier
//! ├─ 0_99
//! ├─ 100_109
//! └─ 117_117
//! ```
//!
//! ## Invariant
//!
//! No two chunk files of a segment have overlapping ranges unless the ranges
//! are identical. Inserts pick a free range from the rollup ladder and rollups
//! replace every chunk inside a ladder range with one chunk covering it.
//!
//! ## Rollup protocol
//!
//! 1. Merge the sources into `<target>.tmp`
//! 2. Rename the temp file to `<target>`
//! 3. Delete the sources
//!
//! A crash at any point leaves a state the next rollup of the same range
//! recognizes and finishes.

mod iterator;
mod layout;
mod manager;
mod store;

pub use iterator::{SegmentIterator, SkippedChunk};
pub use layout::{existing_segment_ranges, segment_dir};
pub use manager::SegmentManager;
pub use store::{RollupCrashPoint, RollupOutcome, Segment};
