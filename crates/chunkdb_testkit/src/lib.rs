//! # ChunkDB Testkit
//!
//! Test utilities for ChunkDB.
//!
//! This crate provides:
//! - Temporary store fixtures
//! - Property-based test generators using proptest
//! - Crash harnesses for interrupted rollups and batches
//! - Checkers for the on-disk invariants
//!
//! ## Usage
//!
//! ```rust,ignore
//! use chunkdb_testkit::prelude::*;
//!
//! #[test]
//! fn test_with_store() {
//!     with_temp_store(|store| {
//!         store.insert(Key::point(1, b"a".to_vec()), b"v".to_vec()).unwrap();
//!         check_store_non_overlap(store).unwrap();
//!     });
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod fixtures;
pub mod generators;
pub mod invariants;

#[cfg(test)]
mod properties;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::invariants::*;
    pub use chunkdb_core::{Entity, IndividualChange, Key, Range, RollupTarget, Store};
}

pub use crash::*;
pub use fixtures::*;
pub use generators::*;
pub use invariants::*;
