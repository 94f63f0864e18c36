//! Property-based test generators using proptest.
//!
//! Grouping numbers are drawn from a window a few segments wide around zero
//! so workloads cross segment boundaries and the sign boundary, and ids come
//! from a tiny alphabet so changes collide on the same key.

use crate::fixtures::TEST_SEGMENT_SIZE;
use chunkdb_core::{Entity, IndividualChange, Key, Range};
use proptest::prelude::*;

/// Lowest grouping number the generators produce.
pub const MIN_GROUPING: i64 = -2 * TEST_SEGMENT_SIZE;

/// Highest grouping number the generators produce.
pub const MAX_GROUPING: i64 = 3 * TEST_SEGMENT_SIZE - 1;

/// Strategy for grouping numbers inside the test window.
pub fn grouping_strategy() -> impl Strategy<Value = i64> {
    prop_oneof![
        3 => MIN_GROUPING..=MAX_GROUPING,
        // Clustered values so chunks get shared and rolled up.
        2 => (-2i64..=2, 0i64..40).prop_map(|(segment, offset)| segment * TEST_SEGMENT_SIZE + offset),
    ]
}

/// Strategy for key ids.
pub fn id_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(b'a'..=b'c', 1..3)
}

/// Strategy for entity values.
pub fn value_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..32)
}

/// Strategy for point keys.
pub fn point_key_strategy() -> impl Strategy<Value = Key> {
    (grouping_strategy(), id_strategy()).prop_map(|(g, id)| Key::point(g, id))
}

/// Strategy for interval keys, some of which cross segment boundaries.
pub fn interval_key_strategy() -> impl Strategy<Value = Key> {
    (grouping_strategy(), 1i64..(2 * TEST_SEGMENT_SIZE), id_strategy()).prop_map(
        |(start, len, id)| {
            let end = start.saturating_add(len);
            Key::interval(Range::new(start, end), id)
        },
    )
}

/// Strategy for keys, mostly points.
pub fn key_strategy() -> impl Strategy<Value = Key> {
    prop_oneof![
        4 => point_key_strategy(),
        1 => interval_key_strategy(),
    ]
}

/// Strategy for entities.
pub fn entity_strategy() -> impl Strategy<Value = Entity> {
    (key_strategy(), value_strategy()).prop_map(|(key, value)| Entity::new(key, value))
}

/// Strategy for a single change.
///
/// Deletes carry no old value since generated changes are not read-modify-write.
pub fn change_strategy() -> impl Strategy<Value = IndividualChange> {
    prop_oneof![
        3 => (key_strategy(), value_strategy())
            .prop_map(|(key, value)| IndividualChange::insert(key, value)),
        1 => (key_strategy(), value_strategy())
            .prop_map(|(key, value)| IndividualChange::update(key, None, value)),
        1 => key_strategy().prop_map(|key| IndividualChange::delete(key, None)),
    ]
}

/// Strategy for a list of changes.
pub fn change_list_strategy(
    min_changes: usize,
    max_changes: usize,
) -> impl Strategy<Value = Vec<IndividualChange>> {
    prop::collection::vec(change_strategy(), min_changes..max_changes)
}

/// Strategy for a list of changes whose later entries revisit earlier keys,
/// so deletes and updates hit stored entities.
pub fn workload_strategy(max_changes: usize) -> impl Strategy<Value = Vec<IndividualChange>> {
    prop::collection::vec(key_strategy(), 1..max_changes.max(2)).prop_flat_map(|keys| {
        let picks = prop::collection::vec(
            (0..keys.len(), any::<bool>(), value_strategy()),
            keys.len()..keys.len() * 2,
        );
        (Just(keys), picks)
    })
    .prop_map(|(keys, picks)| {
        picks
            .into_iter()
            .map(|(index, keep, value)| {
                let key = keys[index].clone();
                if keep {
                    IndividualChange::insert(key, value)
                } else {
                    IndividualChange::delete(key, None)
                }
            })
            .collect()
    })
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 64,
            max_shrink_iters: 500,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests. Every case touches disk.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 16,
            max_shrink_iters: 100,
        }
    }

    /// Creates a configuration for thorough tests.
    #[must_use]
    pub fn thorough() -> Self {
        Self {
            cases: 512,
            max_shrink_iters: 5000,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}
