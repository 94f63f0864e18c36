//! CLI command implementations.

pub mod dump_pending;
pub mod inspect;
pub mod recover;
pub mod rollup;
pub mod verify;

use chunkdb_core::{LockManager, SegmentManager, Store, StoreConfig, StoreDir, StoreMeta};
use std::path::Path;

/// A store directory opened without replaying the pending log.
///
/// Holds the directory lock, so no store can open the directory meanwhile.
pub struct OfflineStore {
    /// Locked store directory.
    pub dir: StoreDir,
    /// Persisted metadata.
    pub meta: StoreMeta,
    /// Segment manager without a rollup owner.
    pub segments: SegmentManager,
}

/// Opens the store directory for read-only tooling.
pub fn open_offline(path: &Path) -> Result<OfflineStore, Box<dyn std::error::Error>> {
    let dir = StoreDir::open(path, false)?;
    let meta = dir
        .load_meta()?
        .ok_or_else(|| format!("No store found at {}", path.display()))?;
    let segments = SegmentManager::new(
        dir.data_dir(),
        meta.segment.clone(),
        LockManager::new(),
        None,
        false,
    );
    Ok(OfflineStore {
        dir,
        meta,
        segments,
    })
}

/// Opens the store with its persisted configuration and no background
/// rollup thread. Opening replays the pending log.
pub fn open_store(path: &Path) -> Result<Store, Box<dyn std::error::Error>> {
    let meta = chunkdb_core::dir::load_meta(path)?
        .ok_or_else(|| format!("No store found at {}", path.display()))?;
    let config = StoreConfig::new()
        .create_if_missing(false)
        .key_kind(meta.key_kind)
        .segment(meta.segment)
        .background_rollups(false);
    Ok(Store::open(path, config)?)
}

fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes}")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
