//! Core type definitions for chunkdb.

use crate::range::Range;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Key of a stored entity.
///
/// Every key covers a span of grouping numbers. Point keys (timestamps,
/// integers, hashes) span a single number; time-frame keys span an interval
/// and are stored in every segment the interval touches.
///
/// Keys order by span start, span end, then id bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Key {
    span: Range,
    id: Vec<u8>,
}

impl Key {
    /// Creates a key at a single grouping number.
    #[must_use]
    pub fn point(grouping_number: i64, id: impl Into<Vec<u8>>) -> Self {
        Self {
            span: Range::single(grouping_number),
            id: id.into(),
        }
    }

    /// Creates a key covering an interval of grouping numbers.
    #[must_use]
    pub fn interval(span: Range, id: impl Into<Vec<u8>>) -> Self {
        Self {
            span,
            id: id.into(),
        }
    }

    /// Returns the grouping number used to place the key.
    #[must_use]
    pub const fn grouping_number(&self) -> i64 {
        self.span.start()
    }

    /// Returns the span of grouping numbers the key covers.
    #[must_use]
    pub const fn span(&self) -> Range {
        self.span
    }

    /// Returns the id bytes.
    #[must_use]
    pub fn id(&self) -> &[u8] {
        &self.id
    }

    /// Returns true if the key covers more than one grouping number.
    #[must_use]
    pub fn is_interval(&self) -> bool {
        self.span.start() != self.span.end()
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_interval() {
            write!(f, "[{}]:", self.span)?;
        } else {
            write!(f, "{}:", self.span.start())?;
        }
        for byte in &self.id {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// A stored `(key, value)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    /// Entity key.
    pub key: Key,
    /// Opaque serialized value.
    pub value: Vec<u8>,
}

impl Entity {
    /// Creates a new entity.
    #[must_use]
    pub fn new(key: Key, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key,
            value: value.into(),
        }
    }
}

/// Kind of a logical change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    /// New entity.
    Insert,
    /// Replacement of an existing entity.
    Update,
    /// Removal of an entity.
    Delete,
}

/// One logical change to a single entity.
///
/// The batch writer consumes changes sorted by key (grouping number first,
/// id bytes as the tie-breaker); see [`sort_changes`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndividualChange {
    /// Key of the changed entity.
    pub key: Key,
    /// Value before the change, if known.
    pub old_value: Option<Vec<u8>>,
    /// Value after the change; `None` removes the entity.
    pub new_value: Option<Vec<u8>>,
    /// What kind of change this is.
    pub kind: ChangeKind,
}

impl IndividualChange {
    /// Creates an insert.
    #[must_use]
    pub fn insert(key: Key, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key,
            old_value: None,
            new_value: Some(value.into()),
            kind: ChangeKind::Insert,
        }
    }

    /// Creates an update.
    #[must_use]
    pub fn update(key: Key, old_value: Option<Vec<u8>>, new_value: impl Into<Vec<u8>>) -> Self {
        Self {
            key,
            old_value,
            new_value: Some(new_value.into()),
            kind: ChangeKind::Update,
        }
    }

    /// Creates a delete.
    #[must_use]
    pub fn delete(key: Key, old_value: Option<Vec<u8>>) -> Self {
        Self {
            key,
            old_value,
            new_value: None,
            kind: ChangeKind::Delete,
        }
    }

    /// Returns the grouping number of the changed key.
    #[must_use]
    pub const fn grouping_number(&self) -> i64 {
        self.key.grouping_number()
    }
}

/// Sorts changes into batch-writer order.
///
/// The sort is stable, so several changes to the same key keep their
/// submission order and the last one wins.
pub fn sort_changes(changes: &mut [IndividualChange]) {
    changes.sort_by(|a, b| a.key.cmp(&b.key));
}

/// "Roll up this sub-range of this segment."
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RollupTarget {
    /// Any grouping number inside the owning segment (its start by convention).
    pub segment_grouping_number: i64,
    /// The level-aligned range to merge.
    pub range: Range,
    /// Delay the scheduler applied before the target became eligible.
    pub scheduled_delay_millis: i64,
}

impl RollupTarget {
    /// Creates a rollup target with no delay.
    #[must_use]
    pub const fn new(segment_grouping_number: i64, range: Range) -> Self {
        Self {
            segment_grouping_number,
            range,
            scheduled_delay_millis: 0,
        }
    }
}

impl fmt::Display for RollupTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rollup {} in segment@{}",
            self.range, self.segment_grouping_number
        )
    }
}
