//! Store directory management.
//!
//! This module handles the file system layout of a store:
//!
//! ```text
//! <store_path>/
//! ├─ STORE             # Metadata (format version, segment configuration)
//! ├─ LOCK              # Advisory lock for single-writer
//! ├─ data/             # Segment tree: pos|neg/d/ddd/.../<start>_<end>/<chunk files>
//! └─ recovery/         # Pending log entries
//! ```
//!
//! The LOCK file ensures only one process writes to the store at a time. The
//! STORE file pins the segment size chosen at creation.

use crate::config::{KeyKind, SegmentConfig};
use crate::error::{CoreError, CoreResult};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// File names within the store directory.
const META_FILE: &str = "STORE";
const META_TEMP: &str = "STORE.tmp";
const LOCK_FILE: &str = "LOCK";
const DATA_DIR: &str = "data";
const RECOVERY_DIR: &str = "recovery";

/// Current on-disk format version.
pub const FORMAT_VERSION: (u16, u16) = (1, 0);

/// Persistent store metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreMeta {
    /// On-disk format version (major, minor).
    pub format_version: (u16, u16),
    /// Key kind the store was created with.
    pub key_kind: KeyKind,
    /// Segment configuration; immutable after creation.
    pub segment: SegmentConfig,
}

/// Manages the store directory structure and file locking.
///
/// The `StoreDir` holds an exclusive advisory lock on the store directory for
/// its whole lifetime.
#[derive(Debug)]
pub struct StoreDir {
    /// Root directory path.
    path: PathBuf,
    /// Lock file handle (held for exclusive access).
    _lock_file: File,
}

impl StoreDir {
    /// Opens or creates a store directory.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory doesn't exist and `create_if_missing` is false
    /// - Another process holds the lock (returns `StoreLocked`)
    /// - I/O errors occur
    pub fn open(path: &Path, create_if_missing: bool) -> CoreResult<Self> {
        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(CoreError::invalid_operation(format!(
                    "store directory does not exist: {}",
                    path.display()
                )));
            }
        }

        if !path.is_dir() {
            return Err(CoreError::invalid_operation(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;

        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::StoreLocked);
        }

        fs::create_dir_all(path.join(DATA_DIR))?;
        fs::create_dir_all(path.join(RECOVERY_DIR))?;

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Returns the store root.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the root of the segment tree.
    #[must_use]
    pub fn data_dir(&self) -> PathBuf {
        self.path.join(DATA_DIR)
    }

    /// Returns the pending log directory.
    #[must_use]
    pub fn recovery_dir(&self) -> PathBuf {
        self.path.join(RECOVERY_DIR)
    }

    /// Returns the metadata file path.
    #[must_use]
    pub fn meta_path(&self) -> PathBuf {
        self.path.join(META_FILE)
    }

    /// Loads the metadata, returning `None` for a new store.
    pub fn load_meta(&self) -> CoreResult<Option<StoreMeta>> {
        load_meta(&self.path)
    }

    /// Saves the metadata atomically (temp file, fsync, rename, dir fsync).
    pub fn save_meta(&self, meta: &StoreMeta) -> CoreResult<()> {
        let mut data = Vec::new();
        ciborium::into_writer(meta, &mut data).map_err(|e| CoreError::codec(e.to_string()))?;

        let temp_path = self.path.join(META_TEMP);
        let mut file = File::create(&temp_path)?;
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, self.meta_path())?;
        sync_directory(&self.path)
    }
}

/// Reads store metadata without taking the store lock.
///
/// Used by read-only tooling.
pub fn load_meta(store_path: &Path) -> CoreResult<Option<StoreMeta>> {
    let data = match fs::read(store_path.join(META_FILE)) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if data.is_empty() {
        return Ok(None);
    }
    let meta = ciborium::from_reader(data.as_slice())
        .map_err(|e| CoreError::codec(format!("store metadata: {e}")))?;
    Ok(Some(meta))
}

/// Syncs a directory so that entries created, renamed or deleted in it are
/// durable.
#[cfg(unix)]
pub(crate) fn sync_directory(path: &Path) -> CoreResult<()> {
    File::open(path)?.sync_all()?;
    Ok(())
}

/// NTFS journals metadata; directory handles cannot be fsynced on Windows.
#[cfg(not(unix))]
pub(crate) fn sync_directory(_path: &Path) -> CoreResult<()> {
    Ok(())
}
