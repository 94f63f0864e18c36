//! Crash recovery.
//!
//! ## Log Format
//!
//! ```text
//! <store>/recovery/
//! ├─ 00000000000000000041.pending   # CBOR PendingOperation
//! └─ 00000000000000000042.pending
//! ```
//!
//! Sequence numbers grow monotonically across restarts. Replay is serial in
//! sequence order, and every replayed operation is idempotent: changes are
//! written again with the same values, and rollups detect which step a crash
//! interrupted (see [`Segment::rollup`](crate::segment::Segment::rollup)).

mod entry;
mod manager;

pub use entry::{PendingBatchChange, PendingChange, PendingOperation, PendingRollup};
pub use manager::{PendingEntry, RecoveryManager, RecoveryReport, RecoveryTarget};
