//! Test fixtures and store helpers.
//!
//! Provides convenience functions for setting up temporary stores
//! and common test scenarios.

use chunkdb_core::{CoreResult, Entity, Key, Range, SegmentConfig, Store, StoreConfig};
use std::collections::BTreeMap;
use std::path::Path;
use tempfile::TempDir;

/// Segment size used by [`test_config`].
pub const TEST_SEGMENT_SIZE: i64 = 6000;

/// Rollup levels used by [`test_config`].
pub const TEST_ROLLUP_LEVELS: [i64; 3] = [1, 10, 100];

/// Configuration for test stores: small segments, no fsync and no
/// background thread, so tests control when rollups run.
pub fn test_config() -> StoreConfig {
    let segment = SegmentConfig::new(TEST_SEGMENT_SIZE, TEST_ROLLUP_LEVELS.to_vec())
        .expect("test segment config is valid");
    StoreConfig::new()
        .segment(segment)
        .sync_writes(false)
        .background_rollups(false)
        .iterator_timeout(None)
}

/// A store in a temporary directory, removed on drop.
pub struct TestStore {
    /// The store instance.
    pub store: Store,
    config: StoreConfig,
    // Declared after `store` so the store is closed before the directory goes.
    temp_dir: TempDir,
}

impl TestStore {
    /// Creates a store with [`test_config`].
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    /// Creates a store with a custom configuration.
    pub fn with_config(config: StoreConfig) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let store = Store::open(&temp_dir.path().join("store"), config.clone())
            .expect("Failed to open test store");
        Self {
            store,
            config,
            temp_dir,
        }
    }

    /// Returns the store root.
    pub fn path(&self) -> &Path {
        self.store.path()
    }

    /// Returns the directory holding the store root.
    pub fn temp_path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Closes and reopens the store, which replays the pending log.
    pub fn reopen(self) -> Self {
        self.try_reopen().expect("Failed to reopen test store")
    }

    /// Closes and reopens the store, returning the open error.
    pub fn try_reopen(self) -> CoreResult<Self> {
        let Self {
            store,
            config,
            temp_dir,
        } = self;
        drop(store);
        let store = Store::open(&temp_dir.path().join("store"), config.clone())?;
        Ok(Self {
            store,
            config,
            temp_dir,
        })
    }

    /// Returns every entity, in iteration order.
    pub fn entities(&self) -> Vec<Entity> {
        scan(&self.store)
    }

    /// Returns every entity keyed by its key.
    pub fn contents(&self) -> BTreeMap<Key, Vec<u8>> {
        contents(&self.store)
    }
}

impl Default for TestStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for TestStore {
    type Target = Store;

    fn deref(&self) -> &Self::Target {
        &self.store
    }
}

/// Scans the whole key space of a store.
pub fn scan(store: &Store) -> Vec<Entity> {
    store
        .iter_with_timeout(Range::FULL, None)
        .expect("Failed to open iterator")
        .collect::<CoreResult<Vec<_>>>()
        .expect("Failed to scan store")
}

/// Scans a store into a map. Panics if a key is yielded twice.
pub fn contents(store: &Store) -> BTreeMap<Key, Vec<u8>> {
    let mut map = BTreeMap::new();
    for entity in scan(store) {
        let key = entity.key.clone();
        assert!(
            map.insert(entity.key, entity.value).is_none(),
            "key {key} yielded twice"
        );
    }
    map
}

/// Runs a test with a temporary store.
///
/// # Example
///
/// ```rust,ignore
/// use chunkdb_testkit::with_temp_store;
///
/// #[test]
/// fn my_test() {
///     with_temp_store(|store| {
///         store.insert(Key::point(5, b"id".to_vec()), b"v".to_vec()).unwrap();
///     });
/// }
/// ```
pub fn with_temp_store<F, R>(f: F) -> R
where
    F: FnOnce(&Store) -> R,
{
    let test_store = TestStore::new();
    f(&test_store.store)
}

/// Writes a chunk file directly, bypassing the batch writer.
///
/// Used to build fragmented layouts the batch writer would coalesce.
pub fn put_chunk(store: &Store, range: Range, entities: &[Entity]) {
    let segment = store.segments().get_segment(range.start());
    let mut entities = entities.to_vec();
    entities.sort_by(|a, b| a.key.cmp(&b.key));
    segment
        .chunk(range)
        .write(&entities, false)
        .expect("Failed to write chunk");
}

/// Test scenario helpers.
pub mod scenarios {
    use super::*;

    /// Creates a store with `count` point entities spread over several
    /// segments, one batch per entity.
    pub fn populated_store(count: usize) -> TestStore {
        let test_store = TestStore::new();
        for i in 0..count {
            let g = i as i64 * 257 - 3000;
            test_store
                .insert(Key::point(g, format!("id-{i}")), format!("value-{i}"))
                .expect("Failed to insert entity");
        }
        test_store
    }

    /// Creates a store whose first segment holds one single-number chunk
    /// per grouping number in `groups`.
    pub fn fragmented_store(groups: &[i64]) -> TestStore {
        let test_store = TestStore::new();
        for &g in groups {
            let entity = Entity::new(Key::point(g, b"f".to_vec()), g.to_le_bytes().to_vec());
            put_chunk(&test_store, Range::single(g), &[entity]);
        }
        test_store
    }
}
