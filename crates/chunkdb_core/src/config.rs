//! Store configuration.

use crate::error::{CoreError, CoreResult};
use crate::range::Range;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Milliseconds per day, the segment size of time-keyed stores.
const DAY_MILLIS: i64 = 86_400_000;

/// Segment size and rollup ladder of a store.
///
/// `rollup_levels` lists the permitted chunk sizes from the smallest
/// (single-insert granularity) to the largest. Every level divides the next
/// and the largest divides `segment_size`, so aligned ranges nest and segment
/// boundaries never cut a chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawSegmentConfig")]
pub struct SegmentConfig {
    segment_size: i64,
    rollup_levels: Vec<i64>,
}

/// Unchecked wire form; decoding goes through [`SegmentConfig::new`].
#[derive(Deserialize)]
struct RawSegmentConfig {
    segment_size: i64,
    rollup_levels: Vec<i64>,
}

impl TryFrom<RawSegmentConfig> for SegmentConfig {
    type Error = CoreError;

    fn try_from(raw: RawSegmentConfig) -> CoreResult<Self> {
        Self::new(raw.segment_size, raw.rollup_levels)
    }
}

impl SegmentConfig {
    /// Creates and validates a segment configuration.
    pub fn new(segment_size: i64, rollup_levels: Vec<i64>) -> CoreResult<Self> {
        if segment_size <= 0 {
            return Err(CoreError::invalid_config(format!(
                "segment size must be positive, got {segment_size}"
            )));
        }
        let Some(&largest) = rollup_levels.last() else {
            return Err(CoreError::invalid_config("at least one rollup level required"));
        };
        if rollup_levels[0] <= 0 {
            return Err(CoreError::invalid_config("rollup levels must be positive"));
        }
        for pair in rollup_levels.windows(2) {
            if pair[1] <= pair[0] || pair[1] % pair[0] != 0 {
                return Err(CoreError::invalid_config(format!(
                    "rollup level {} must be a larger multiple of {}",
                    pair[1], pair[0]
                )));
            }
        }
        if segment_size % largest != 0 {
            return Err(CoreError::invalid_config(format!(
                "largest rollup level {largest} must divide segment size {segment_size}"
            )));
        }
        Ok(Self {
            segment_size,
            rollup_levels,
        })
    }

    /// Returns the segment size.
    #[must_use]
    pub const fn segment_size(&self) -> i64 {
        self.segment_size
    }

    /// Returns the rollup levels, smallest first.
    #[must_use]
    pub fn rollup_levels(&self) -> &[i64] {
        &self.rollup_levels
    }

    /// Returns the range of the segment containing `grouping_number`.
    ///
    /// Segments at the ends of the `i64` domain are clamped, so every grouping
    /// number has a segment.
    #[must_use]
    pub fn segment_range(&self, grouping_number: i64) -> Range {
        Range::aligned(grouping_number, self.segment_size)
    }

    /// Returns the segment index (`start / segment_size`, floored).
    #[must_use]
    pub fn segment_index(&self, grouping_number: i64) -> i64 {
        grouping_number.div_euclid(self.segment_size)
    }
}

/// The closed set of key kinds, each with a default segment ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyKind {
    /// Millisecond timestamps.
    Time,
    /// Millisecond intervals; entities span every segment they overlap.
    TimeFrame,
    /// Arbitrary 64-bit integers.
    Long,
    /// 32-bit integers widened to 64 bits.
    Integer,
    /// Hash buckets of opaque keys.
    HashGrouped,
}

impl KeyKind {
    /// Returns the default segment configuration for this kind.
    #[must_use]
    pub fn default_segment_config(self) -> SegmentConfig {
        let (segment_size, levels): (i64, &[i64]) = match self {
            Self::Time | Self::TimeFrame => (
                DAY_MILLIS,
                &[1, 1_000, 60_000, 3_600_000, DAY_MILLIS],
            ),
            Self::Long => (1_000_000, &[1, 100, 10_000, 1_000_000]),
            Self::Integer => (100_000, &[1, 100, 10_000, 100_000]),
            Self::HashGrouped => (1 << 20, &[1, 1 << 8, 1 << 14, 1 << 20]),
        };
        SegmentConfig {
            segment_size,
            rollup_levels: levels.to_vec(),
        }
    }
}

/// Configuration for opening a store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Whether to create the store if it doesn't exist.
    pub create_if_missing: bool,

    /// Key kind; selects the default segment configuration.
    pub key_kind: KeyKind,

    /// Explicit segment configuration overriding the key kind's default.
    pub segment: Option<SegmentConfig>,

    /// Whether to fsync chunk files, log entries and directories.
    pub sync_writes: bool,

    /// Delay of the first rollup level above the smallest. Level `i` waits
    /// `i * rollup_base_delay`.
    pub rollup_base_delay: Duration,

    /// How often the background scheduler looks for eligible rollups.
    pub rollup_poll_interval: Duration,

    /// Whether to run the background rollup thread.
    pub background_rollups: bool,

    /// Inactivity timeout of store iterators (`None` = never auto-close).
    pub iterator_timeout: Option<Duration>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            key_kind: KeyKind::Long,
            segment: None,
            sync_writes: true,
            rollup_base_delay: Duration::from_secs(10),
            rollup_poll_interval: Duration::from_millis(500),
            background_rollups: true,
            iterator_timeout: Some(Duration::from_secs(60)),
        }
    }
}

impl StoreConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the store if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets the key kind.
    #[must_use]
    pub const fn key_kind(mut self, kind: KeyKind) -> Self {
        self.key_kind = kind;
        self
    }

    /// Overrides the segment configuration.
    #[must_use]
    pub fn segment(mut self, segment: SegmentConfig) -> Self {
        self.segment = Some(segment);
        self
    }

    /// Sets whether writes are fsynced.
    #[must_use]
    pub const fn sync_writes(mut self, value: bool) -> Self {
        self.sync_writes = value;
        self
    }

    /// Sets the base rollup delay.
    #[must_use]
    pub const fn rollup_base_delay(mut self, delay: Duration) -> Self {
        self.rollup_base_delay = delay;
        self
    }

    /// Sets the scheduler poll interval.
    #[must_use]
    pub const fn rollup_poll_interval(mut self, interval: Duration) -> Self {
        self.rollup_poll_interval = interval;
        self
    }

    /// Sets whether the background rollup thread runs.
    #[must_use]
    pub const fn background_rollups(mut self, value: bool) -> Self {
        self.background_rollups = value;
        self
    }

    /// Sets the iterator inactivity timeout.
    #[must_use]
    pub const fn iterator_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.iterator_timeout = timeout;
        self
    }

    /// Returns the effective segment configuration.
    #[must_use]
    pub fn segment_config(&self) -> SegmentConfig {
        self.segment
            .clone()
            .unwrap_or_else(|| self.key_kind.default_segment_config())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct Unchecked {
        segment_size: i64,
        rollup_levels: Vec<i64>,
    }

    fn decode(raw: &Unchecked) -> Result<SegmentConfig, String> {
        let mut data = Vec::new();
        ciborium::into_writer(raw, &mut data).unwrap();
        ciborium::from_reader(data.as_slice()).map_err(|e| e.to_string())
    }

    #[test]
    fn decoding_validates_segment_config() {
        let good = decode(&Unchecked {
            segment_size: 6000,
            rollup_levels: vec![1, 10, 100],
        })
        .unwrap();
        assert_eq!(good, SegmentConfig::new(6000, vec![1, 10, 100]).unwrap());

        for (segment_size, rollup_levels) in [(0, vec![1]), (6000, vec![]), (6000, vec![1, 7])] {
            let err = decode(&Unchecked {
                segment_size,
                rollup_levels,
            })
            .unwrap_err();
            assert!(err.contains("invalid configuration"), "{err}");
        }
    }

    #[test]
    fn default_config() {
        let config = StoreConfig::default();
        assert!(config.create_if_missing);
        assert!(config.sync_writes);
        assert!(config.background_rollups);
        assert_eq!(config.segment_config(), KeyKind::Long.default_segment_config());
    }

    #[test]
    fn builder_pattern() {
        let segment = SegmentConfig::new(6000, vec![1, 10, 100]).unwrap();
        let config = StoreConfig::new()
            .create_if_missing(false)
            .sync_writes(false)
            .background_rollups(false)
            .segment(segment.clone());

        assert!(!config.create_if_missing);
        assert!(!config.sync_writes);
        assert_eq!(config.segment_config(), segment);
    }

    #[test]
    fn every_key_kind_default_is_valid() {
        for kind in [
            KeyKind::Time,
            KeyKind::TimeFrame,
            KeyKind::Long,
            KeyKind::Integer,
            KeyKind::HashGrouped,
        ] {
            let config = kind.default_segment_config();
            SegmentConfig::new(config.segment_size(), config.rollup_levels().to_vec())
                .unwrap_or_else(|e| panic!("{kind:?}: {e}"));
        }
    }

    #[test]
    fn rejects_non_nesting_levels() {
        assert!(SegmentConfig::new(6000, vec![1, 10, 15]).is_err());
        assert!(SegmentConfig::new(6000, vec![10, 1]).is_err());
        assert!(SegmentConfig::new(6000, vec![]).is_err());
        assert!(SegmentConfig::new(6000, vec![0, 10]).is_err());
        assert!(SegmentConfig::new(6000, vec![1, 7]).is_err());
        assert!(SegmentConfig::new(0, vec![1]).is_err());
    }

    #[test]
    fn segment_ranges_are_aligned() {
        let config = SegmentConfig::new(6000, vec![1, 10, 100]).unwrap();
        assert_eq!(config.segment_range(0), Range::new(0, 5999));
        assert_eq!(config.segment_range(6001), Range::new(6000, 11_999));
        assert_eq!(config.segment_range(-1), Range::new(-6000, -1));
        assert_eq!(config.segment_index(-1), -1);
        assert_eq!(config.segment_range(i64::MAX).end(), i64::MAX);
        assert_eq!(config.segment_range(i64::MIN).start(), i64::MIN);
    }
}
