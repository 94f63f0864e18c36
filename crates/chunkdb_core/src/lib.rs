//! # ChunkDB Core
//!
//! Segmented chunk-file storage engine.
//!
//! Entities are keyed by a signed 64-bit grouping number (a timestamp or any
//! other ordered number) plus an id. The key space is cut into fixed-size
//! segments, one directory each, and every segment stores its entities in
//! chunk files named after the grouping-number range they cover.
//!
//! This crate provides:
//! - Chunk files with atomic replacement and checksummed records
//! - A batch writer that packs changes into the largest free chunk range
//! - Rollups that merge small chunks into level-aligned larger ones
//! - A pending log that makes writes and rollups crash-safe
//! - Path-keyed read/write locks and auto-closing range iterators
//! - The [`Store`] facade tying it together

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod batch;
pub mod chunk;
pub mod config;
pub mod dir;
mod error;
pub mod lock;
mod range;
pub mod recovery;
pub mod rollup;
pub mod segment;
mod store;
mod types;

pub use config::{KeyKind, SegmentConfig, StoreConfig};
pub use dir::{StoreDir, StoreMeta, FORMAT_VERSION};
pub use error::{CoreError, CoreResult};
pub use lock::LockManager;
pub use range::{ParseRangeError, Range};
pub use recovery::{RecoveryManager, RecoveryReport};
pub use rollup::ScheduledRollup;
pub use segment::{RollupOutcome, Segment, SegmentIterator, SegmentManager, SkippedChunk};
pub use store::{Store, StoreIterator};
pub use types::{sort_changes, ChangeKind, Entity, IndividualChange, Key, RollupTarget};
