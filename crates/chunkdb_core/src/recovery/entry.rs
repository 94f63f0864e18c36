//! Pending log entry payloads.

use crate::error::{CoreError, CoreResult};
use crate::types::{IndividualChange, RollupTarget};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A single change that has not been confirmed applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingChange {
    /// The change.
    pub change: IndividualChange,
}

/// A sorted batch of changes that has not been confirmed applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingBatchChange {
    /// The changes, in batch-writer order.
    pub changes: Vec<IndividualChange>,
}

/// A rollup that has not been confirmed complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRollup {
    /// The rollup.
    pub target: RollupTarget,
}

/// Everything a pending log entry can hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PendingOperation {
    /// One change.
    Change(PendingChange),
    /// A batch of changes.
    Batch(PendingBatchChange),
    /// A rollup.
    Rollup(PendingRollup),
}

impl PendingOperation {
    /// Serializes the operation to CBOR.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        let mut data = Vec::new();
        ciborium::into_writer(self, &mut data).map_err(|e| CoreError::codec(e.to_string()))?;
        Ok(data)
    }

    /// Deserializes an operation from CBOR.
    pub fn decode(data: &[u8]) -> CoreResult<Self> {
        ciborium::from_reader(data).map_err(|e| CoreError::codec(e.to_string()))
    }

    /// Short name of the operation kind.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Change(_) => "change",
            Self::Batch(_) => "batch",
            Self::Rollup(_) => "rollup",
        }
    }
}

impl fmt::Display for PendingOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Change(p) => write!(f, "change {:?} {}", p.change.kind, p.change.key),
            Self::Batch(p) => write!(f, "batch of {} changes", p.changes.len()),
            Self::Rollup(p) => write!(f, "{}", p.target),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::range::Range;
    use crate::types::Key;

    #[test]
    fn operations_survive_cbor() {
        let ops = vec![
            PendingOperation::Change(PendingChange {
                change: IndividualChange::delete(Key::point(-4, b"x".to_vec()), Some(vec![1])),
            }),
            PendingOperation::Batch(PendingBatchChange {
                changes: vec![
                    IndividualChange::insert(Key::interval(Range::new(1, 9), vec![]), vec![7]),
                    IndividualChange::update(Key::point(3, vec![2]), None, vec![8]),
                ],
            }),
            PendingOperation::Rollup(PendingRollup {
                target: RollupTarget::new(0, Range::new(0, 99)),
            }),
        ];
        for op in ops {
            let data = op.encode().unwrap();
            assert_eq!(PendingOperation::decode(&data).unwrap(), op);
        }
    }

    #[test]
    fn garbage_is_a_codec_error() {
        let err = PendingOperation::decode(&[0xff, 0x00, 0x13]).unwrap_err();
        assert!(matches!(err, CoreError::Codec { .. }));
    }

    #[test]
    fn display_names_the_operation() {
        let op = PendingOperation::Rollup(PendingRollup {
            target: RollupTarget::new(6000, Range::new(6000, 6099)),
        });
        assert_eq!(op.kind(), "rollup");
        assert_eq!(op.to_string(), "rollup 6000_6099 in segment@6000");
    }
}
