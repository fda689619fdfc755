use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::error::{TsdbError, TsdbResult};

/// Timestamps are signed 64-bit integers, in either seconds or milliseconds
/// since the UNIX epoch. The resolution is a single process-wide decision
/// made at startup and never mixed (see [`TimeUnit`]).
pub type Timestamp = i64;

pub const MAX_TIMESTAMP: Timestamp = i64::MAX;
pub const INVALID_TIMESTAMP: Timestamp = -1;

pub const MILLIS_PER_SEC: i64 = 1_000;
pub const SECS_PER_MIN: i64 = 60;
pub const SECS_PER_HOUR: i64 = 3_600;
pub const SECS_PER_DAY: i64 = 86_400;

/// Returns the time duration since UNIX_EPOCH in milliseconds.
pub fn current_time_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Returns the time duration since UNIX_EPOCH in seconds.
pub fn current_time_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Process-wide timestamp resolution.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum TimeUnit {
    #[default]
    Seconds,
    Milliseconds,
}

impl TimeUnit {
    pub fn is_millisecond(&self) -> bool {
        matches!(self, TimeUnit::Milliseconds)
    }

    pub fn now(&self) -> Timestamp {
        match self {
            TimeUnit::Seconds => current_time_secs(),
            TimeUnit::Milliseconds => current_time_millis(),
        }
    }

    /// Converts a timestamp that may be in either resolution into this one.
    /// Heuristic: values above year-5138 in seconds are millisecond stamps.
    pub fn canonicalize(&self, tstamp: Timestamp) -> Timestamp {
        const MS_THRESHOLD: Timestamp = 99_999_999_999;
        match self {
            TimeUnit::Seconds => {
                if tstamp > MS_THRESHOLD {
                    tstamp / MILLIS_PER_SEC
                } else {
                    tstamp
                }
            }
            TimeUnit::Milliseconds => {
                if tstamp <= MS_THRESHOLD {
                    tstamp * MILLIS_PER_SEC
                } else {
                    tstamp
                }
            }
        }
    }

    /// Number of timestamp ticks in the given number of seconds.
    pub fn ticks_per(&self, secs: i64) -> i64 {
        match self {
            TimeUnit::Seconds => secs,
            TimeUnit::Milliseconds => secs * MILLIS_PER_SEC,
        }
    }

    /// This timestamp expressed in whole seconds.
    pub fn to_secs(&self, tstamp: Timestamp) -> i64 {
        match self {
            TimeUnit::Seconds => tstamp,
            TimeUnit::Milliseconds => tstamp / MILLIS_PER_SEC,
        }
    }
}

impl Display for TimeUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeUnit::Seconds => write!(f, "second"),
            TimeUnit::Milliseconds => write!(f, "millisecond"),
        }
    }
}

impl TryFrom<&str> for TimeUnit {
    type Error = TsdbError;

    fn try_from(s: &str) -> TsdbResult<Self> {
        match s {
            s if s.eq_ignore_ascii_case("second") || s.eq_ignore_ascii_case("sec") => {
                Ok(TimeUnit::Seconds)
            }
            s if s.eq_ignore_ascii_case("millisecond") || s.eq_ignore_ascii_case("ms") => {
                Ok(TimeUnit::Milliseconds)
            }
            _ => Err(TsdbError::InvalidConfiguration(format!("unknown time unit: {s}"))),
        }
    }
}

/// A half-open `[from, to)` timestamp interval. A point at exactly `to`
/// belongs to the next interval.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub from: Timestamp,
    pub to: Timestamp,
}

impl TimeRange {
    pub const MAX: TimeRange = TimeRange { from: 0, to: MAX_TIMESTAMP };

    pub fn new(from: Timestamp, to: Timestamp) -> Self {
        debug_assert!(from <= to);
        TimeRange { from, to }
    }

    pub fn duration(&self) -> i64 {
        self.to - self.from
    }

    pub fn in_range(&self, tstamp: Timestamp) -> bool {
        self.from <= tstamp && tstamp < self.to
    }

    /// True when the closed interval `[from, to]` of `other` touches us.
    /// Used for page time ranges, which are stored inclusive.
    pub fn intersects(&self, other: &TimeRange) -> bool {
        self.from < other.to && other.from < self.to
    }

    pub fn intersection(&self, other: &TimeRange) -> Option<TimeRange> {
        let from = self.from.max(other.from);
        let to = self.to.min(other.to);
        (from < to).then_some(TimeRange { from, to })
    }

    pub fn merge(&mut self, other: &TimeRange) {
        self.from = self.from.min(other.from);
        self.to = self.to.max(other.to);
    }

    /// Midpoint of the range; pages whose data starts at or past this
    /// point are reachable through the second set of index entries.
    pub fn middle(&self) -> Timestamp {
        self.from + self.duration() / 2
    }

    /// The window of length `duration` ticks containing `tstamp`,
    /// aligned on multiples of `duration`.
    pub fn round_to(tstamp: Timestamp, duration: i64) -> TimeRange {
        debug_assert!(duration > 0);
        let from = tstamp - tstamp.rem_euclid(duration);
        TimeRange { from, to: from + duration }
    }
}

impl Display for TimeRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.from, self.to)
    }
}

/// Align `tstamp` down to a multiple of `interval`.
pub fn step_down(tstamp: Timestamp, interval: i64) -> Timestamp {
    tstamp - tstamp.rem_euclid(interval)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_to() {
        let day = SECS_PER_DAY;
        let range = TimeRange::round_to(1_672_531_200 + 555, day);
        assert_eq!(range.from, 1_672_531_200);
        assert_eq!(range.to, 1_672_531_200 + day);
        assert!(range.in_range(range.from));
        assert!(!range.in_range(range.to));
    }

    #[test]
    fn test_canonicalize() {
        let sec = TimeUnit::Seconds;
        let ms = TimeUnit::Milliseconds;
        assert_eq!(sec.canonicalize(1_672_531_200), 1_672_531_200);
        assert_eq!(sec.canonicalize(1_672_531_200_000), 1_672_531_200);
        assert_eq!(ms.canonicalize(1_672_531_200), 1_672_531_200_000);
        assert_eq!(ms.canonicalize(1_672_531_200_000), 1_672_531_200_000);
    }

    #[test]
    fn test_intersection() {
        let a = TimeRange::new(0, 100);
        let b = TimeRange::new(100, 200);
        assert!(!a.intersects(&b));
        assert_eq!(a.intersection(&TimeRange::new(50, 150)), Some(TimeRange::new(50, 100)));
    }
}
