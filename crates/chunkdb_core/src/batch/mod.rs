//! Batch writer.
//!
//! Changes are packed into chunk files greedily: for the next unconsumed
//! change the writer takes the largest ladder range around its grouping number
//! that no differing chunk overlaps, and absorbs every following change that
//! falls into it. Co-arriving inserts therefore share one large chunk, while a
//! segment that already holds small chunks gets small chunks next to them.
//!
//! With a segment of 6000 and levels `[1, 10, 100]`, inserts at `0, 1, 4`
//! produce the single chunk `0_99`. If `7_7` already exists, every larger
//! candidate overlaps it and the inserts land in `0_0`, `1_1` and `4_4`.

mod apply;
mod segment_batch;

pub use apply::apply_changes;
pub use segment_batch::{
    largest_empty_range, plan, possible_chunk_ranges, ChunkPlan, ExistingChunkRangeFinder,
    SegmentBatch,
};
