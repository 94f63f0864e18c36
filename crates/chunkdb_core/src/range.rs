//! Inclusive grouping-number ranges.
//!
//! A [`Range`] names every segment and every chunk file. Chunk file names are
//! the `Display` form of their range (`"<start>_<end>"`), so parsing a file name
//! back into a range is the inverse of formatting it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// An inclusive `[start, end]` interval over grouping numbers.
///
/// Ranges order by `start`, then by `end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawRange")]
pub struct Range {
    start: i64,
    end: i64,
}

#[derive(Deserialize)]
struct RawRange {
    start: i64,
    end: i64,
}

impl TryFrom<RawRange> for Range {
    type Error = String;

    fn try_from(raw: RawRange) -> Result<Self, String> {
        Self::try_new(raw.start, raw.end)
            .ok_or_else(|| format!("range start {} exceeds end {}", raw.start, raw.end))
    }
}

impl Range {
    /// The range covering every grouping number.
    pub const FULL: Self = Self {
        start: i64::MIN,
        end: i64::MAX,
    };

    /// Creates a new range.
    ///
    /// # Panics
    ///
    /// Panics if `start > end`.
    #[must_use]
    pub const fn new(start: i64, end: i64) -> Self {
        assert!(start <= end, "range start must not exceed range end");
        Self { start, end }
    }

    /// Creates a range, returning `None` if `start > end`.
    #[must_use]
    pub const fn try_new(start: i64, end: i64) -> Option<Self> {
        if start <= end {
            Some(Self { start, end })
        } else {
            None
        }
    }

    /// Creates a range holding a single grouping number.
    #[must_use]
    pub const fn single(value: i64) -> Self {
        Self {
            start: value,
            end: value,
        }
    }

    /// Returns the `size`-aligned range containing `value`.
    ///
    /// Alignment is absolute: the start is `floor(value / size) * size`. Ranges
    /// that would extend past the ends of the `i64` domain are clamped.
    #[must_use]
    pub fn aligned(value: i64, size: i64) -> Self {
        let size = i128::from(size.max(1));
        let start = i128::from(value).div_euclid(size) * size;
        let end = start + size - 1;
        Self {
            start: clamp_i64(start),
            end: clamp_i64(end),
        }
    }

    /// Returns the first grouping number in the range.
    #[must_use]
    pub const fn start(&self) -> i64 {
        self.start
    }

    /// Returns the last grouping number in the range.
    #[must_use]
    pub const fn end(&self) -> i64 {
        self.end
    }

    /// Returns the number of grouping numbers covered.
    #[must_use]
    pub fn len(&self) -> u128 {
        (i128::from(self.end) - i128::from(self.start) + 1) as u128
    }

    /// Ranges are never empty; provided for API symmetry with `len`.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        false
    }

    /// Returns true if `value` lies inside the range.
    #[must_use]
    pub const fn contains(&self, value: i64) -> bool {
        self.start <= value && value <= self.end
    }

    /// Returns true if the two ranges share at least one grouping number.
    #[must_use]
    pub const fn overlaps(&self, other: &Range) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// Returns true if `other` lies entirely inside this range.
    #[must_use]
    pub const fn encloses(&self, other: &Range) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Returns the overlapping part of two ranges.
    #[must_use]
    pub fn intersection(&self, other: &Range) -> Option<Range> {
        Range::try_new(self.start.max(other.start), self.end.min(other.end))
    }

    /// Orders ranges for lock acquisition: ascending start, wider range first.
    ///
    /// Every component that takes several path locks sorts them with this key.
    #[must_use]
    pub fn lock_order(&self) -> (i64, std::cmp::Reverse<i64>) {
        (self.start, std::cmp::Reverse(self.end))
    }
}

fn clamp_i64(value: i128) -> i64 {
    value.clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.start, self.end)
    }
}

/// Error returned when a string is not a `"<start>_<end>"` range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseRangeError(String);

impl fmt::Display for ParseRangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "not a range name: {:?}", self.0)
    }
}

impl std::error::Error for ParseRangeError {}

impl FromStr for Range {
    type Err = ParseRangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseRangeError(s.to_string());
        // Negative numbers carry '-', never '_', so the separator is unambiguous.
        let (start, end) = s.split_once('_').ok_or_else(err)?;
        let start = start.parse::<i64>().map_err(|_| err())?;
        let end = end.parse::<i64>().map_err(|_| err())?;
        Range::try_new(start, end).ok_or_else(err)
    }
}
