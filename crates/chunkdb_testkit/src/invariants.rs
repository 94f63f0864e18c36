//! Checkers for the on-disk invariants.

use chunkdb_core::{CoreError, IndividualChange, Key, Range, Segment, Store};
use std::collections::BTreeMap;
use std::fmt;

/// A broken invariant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    /// Two chunk files of one segment cover overlapping ranges.
    OverlappingChunks {
        /// Segment range.
        segment: Range,
        /// First chunk.
        first: Range,
        /// Second chunk.
        second: Range,
    },
    /// An entity is stored in a chunk whose range does not cover it.
    MisplacedEntity {
        /// Segment range.
        segment: Range,
        /// Chunk holding the entity.
        chunk: Range,
        /// Key of the entity.
        key: Key,
    },
    /// A chunk file could not be read.
    UnreadableChunk {
        /// Chunk range.
        chunk: Range,
        /// Read error.
        message: String,
    },
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OverlappingChunks {
                segment,
                first,
                second,
            } => write!(f, "segment {segment}: chunks {first} and {second} overlap"),
            Self::MisplacedEntity {
                segment,
                chunk,
                key,
            } => write!(f, "segment {segment}: chunk {chunk} holds foreign key {key}"),
            Self::UnreadableChunk { chunk, message } => {
                write!(f, "chunk {chunk} is unreadable: {message}")
            }
        }
    }
}

impl std::error::Error for InvariantViolation {}

/// Checks that no two chunk files of `segment` overlap.
pub fn check_non_overlap(segment: &Segment) -> Result<(), InvariantViolation> {
    let ranges = segment
        .chunk_ranges()
        .map_err(|e| InvariantViolation::UnreadableChunk {
            chunk: segment.range(),
            message: e.to_string(),
        })?;
    // Sorted by start, so checking neighbours is enough once the widest
    // range seen so far is carried along.
    let mut widest: Option<Range> = None;
    for range in ranges {
        if let Some(previous) = widest {
            if previous.overlaps(&range) {
                return Err(InvariantViolation::OverlappingChunks {
                    segment: segment.range(),
                    first: previous,
                    second: range,
                });
            }
        }
        widest = match widest {
            Some(previous) if previous.end() >= range.end() => Some(previous),
            _ => Some(range),
        };
    }
    Ok(())
}

/// Checks that every chunk of `segment` decodes and only holds keys it may
/// hold: keys grouped inside the chunk range, or, in the catch-all chunk,
/// interval keys reaching into the segment from before it.
pub fn check_chunk_contents(segment: &Segment) -> Result<usize, InvariantViolation> {
    let ranges = segment
        .chunk_ranges()
        .map_err(|e| InvariantViolation::UnreadableChunk {
            chunk: segment.range(),
            message: e.to_string(),
        })?;

    let mut entities = 0;
    for chunk in ranges {
        let stored = segment
            .chunk(chunk)
            .read()
            .map_err(|e| InvariantViolation::UnreadableChunk {
                chunk,
                message: e.to_string(),
            })?;
        for entity in stored {
            let key = &entity.key;
            let placed = if chunk.end() < segment.range().start() {
                key.grouping_number() < segment.range().start()
                    && key.span().overlaps(&segment.range())
            } else {
                chunk.contains(key.grouping_number())
            };
            if !placed {
                return Err(InvariantViolation::MisplacedEntity {
                    segment: segment.range(),
                    chunk,
                    key: entity.key,
                });
            }
            entities += 1;
        }
    }
    Ok(entities)
}

/// Runs every segment check on every existing segment of `store`.
pub fn check_store(store: &Store) -> Result<(), InvariantViolation> {
    for segment in existing_segments(store)? {
        check_non_overlap(&segment)?;
        check_chunk_contents(&segment)?;
    }
    Ok(())
}

/// Checks the non-overlap invariant on every existing segment of `store`.
pub fn check_store_non_overlap(store: &Store) -> Result<(), InvariantViolation> {
    for segment in existing_segments(store)? {
        check_non_overlap(&segment)?;
    }
    Ok(())
}

fn existing_segments(
    store: &Store,
) -> Result<Vec<std::sync::Arc<Segment>>, InvariantViolation> {
    store
        .segments()
        .get_existing_segments(Range::FULL)
        .map_err(|e: CoreError| InvariantViolation::UnreadableChunk {
            chunk: Range::FULL,
            message: e.to_string(),
        })
}

/// Applies changes to an in-memory map, in submission order.
///
/// This is the reference model every write path must agree with.
pub fn expected_contents<'a, I>(changes: I) -> BTreeMap<Key, Vec<u8>>
where
    I: IntoIterator<Item = &'a IndividualChange>,
{
    let mut model = BTreeMap::new();
    for change in changes {
        match &change.new_value {
            Some(value) => {
                model.insert(change.key.clone(), value.clone());
            }
            None => {
                model.remove(&change.key);
            }
        }
    }
    model
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{put_chunk, TestStore};
    use chunkdb_core::Entity;

    fn entity(g: i64) -> Entity {
        Entity::new(Key::point(g, b"e".to_vec()), vec![1])
    }

    #[test]
    fn clean_segment_passes() {
        let store = TestStore::new();
        put_chunk(&store, Range::new(0, 9), &[entity(3)]);
        put_chunk(&store, Range::new(10, 19), &[entity(12)]);
        check_store(&store).unwrap();
    }

    #[test]
    fn overlap_is_reported() {
        let store = TestStore::new();
        put_chunk(&store, Range::new(0, 99), &[entity(3)]);
        put_chunk(&store, Range::single(50), &[entity(50)]);
        let segment = store.segments().get_segment(0);
        assert_eq!(
            check_non_overlap(&segment),
            Err(InvariantViolation::OverlappingChunks {
                segment: segment.range(),
                first: Range::new(0, 99),
                second: Range::single(50),
            })
        );
    }

    #[test]
    fn nested_overlap_behind_a_wide_chunk_is_reported() {
        let store = TestStore::new();
        put_chunk(&store, Range::new(0, 99), &[]);
        put_chunk(&store, Range::single(5), &[]);
        put_chunk(&store, Range::single(60), &[]);
        let segment = store.segments().get_segment(0);
        assert!(check_non_overlap(&segment).is_err());
    }

    #[test]
    fn misplaced_entity_is_reported() {
        let store = TestStore::new();
        put_chunk(&store, Range::new(0, 9), &[entity(42)]);
        assert!(matches!(
            check_store(&store),
            Err(InvariantViolation::MisplacedEntity { .. })
        ));
    }

    #[test]
    fn interval_in_catch_all_is_placed() {
        let store = TestStore::new();
        let frame = Key::interval(Range::new(5000, 7000), b"f".to_vec());
        store.insert(frame, b"x".to_vec()).unwrap();
        check_store(&store).unwrap();
        let later = store.segments().get_segment(6000);
        assert_eq!(
            later.chunk_ranges().unwrap(),
            vec![Range::new(i64::MIN, 5999)]
        );
    }

    #[test]
    fn model_applies_in_order() {
        let key = Key::point(1, b"a".to_vec());
        let changes = vec![
            IndividualChange::insert(key.clone(), b"1".to_vec()),
            IndividualChange::delete(key.clone(), None),
            IndividualChange::insert(key.clone(), b"2".to_vec()),
        ];
        let model = expected_contents(&changes);
        assert_eq!(model.get(&key), Some(&b"2".to_vec()));
    }
}
