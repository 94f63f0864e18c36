//! Per-path reader/writer locks.
//!
//! Chunk files are the unit of locking. A batch write locks the chunk it
//! writes plus every ladder range enclosing it; a rollup locks its target and
//! its sources. No operation ever locks a whole segment, so unrelated chunks
//! stay readable and writable throughout.

mod manager;

pub use manager::{LeasedReadLock, LockManager, ReadLockGuard, WriteLockGuard};
