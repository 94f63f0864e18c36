//! Error types for the chunkdb core.

use crate::range::Range;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in chunkdb core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A pending log entry or metadata record could not be (de)serialized.
    #[error("codec error: {message}")]
    Codec {
        /// Description of the failure.
        message: String,
    },

    /// A rollup was requested for a range that is not one of the segment's
    /// level-aligned ranges.
    #[error("invalid rollup range {range}: {reason}")]
    InvalidRollupRange {
        /// The rejected range.
        range: Range,
        /// Why it was rejected.
        reason: String,
    },

    /// A pending log entry could not be replayed.
    #[error("unrecoverable log entry {entry}: {source}")]
    UnrecoverableLogEntry {
        /// File name of the entry.
        entry: String,
        /// The error raised while replaying it.
        #[source]
        source: Box<CoreError>,
    },

    /// A chunk file could not be opened or decoded.
    #[error("chunk read failure at {}: {message}", path.display())]
    ChunkReadFailure {
        /// Path of the chunk file.
        path: PathBuf,
        /// Description of the failure.
        message: String,
    },

    /// An iterator was used after it was closed or after its lease expired.
    #[error("iterator closed: {reason}")]
    IteratorClosed {
        /// Why the iterator is closed.
        reason: String,
    },

    /// Configuration is invalid.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Description of the problem.
        message: String,
    },

    /// Another process holds the store lock.
    #[error("store locked: another process has exclusive access")]
    StoreLocked,

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },
}

impl CoreError {
    /// Creates a codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    /// Creates an invalid rollup range error.
    pub fn invalid_rollup_range(range: Range, reason: impl Into<String>) -> Self {
        Self::InvalidRollupRange {
            range,
            reason: reason.into(),
        }
    }

    /// Wraps a replay failure for the named log entry.
    pub fn unrecoverable(entry: impl Into<String>, source: CoreError) -> Self {
        Self::UnrecoverableLogEntry {
            entry: entry.into(),
            source: Box::new(source),
        }
    }

    /// Creates a chunk read failure.
    pub fn chunk_read_failure(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::ChunkReadFailure {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates an iterator closed error.
    pub fn iterator_closed(reason: impl Into<String>) -> Self {
        Self::IteratorClosed {
            reason: reason.into(),
        }
    }

    /// Creates an invalid configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Returns true if the error is a `NotFound` I/O error.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Io(e) if e.kind() == io::ErrorKind::NotFound)
    }
}
