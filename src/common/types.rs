use std::cmp::Ordering;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::common::time::Timestamp;
use crate::error::{TsdbError, TsdbResult};

/// Dense identifier of a metric name, assigned monotonically and persisted
/// in the meta file so that it is stable across restarts.
pub type MetricId = u32;

/// Dense identifier of one time series (a unique `(metric, tags)` pair).
pub type TimeSeriesId = u32;

/// Zero-based index of a `(header, data)` file pair within a Tsdb metric
/// directory. `u16::MAX` terminates a page chain.
pub type FileIndex = u16;

/// Index of a page header inside one header file.
pub type HeaderIndex = u16;

/// Index of a physical page inside one data file.
pub type PageIndex = u32;

pub type PageCount = u32;
pub type PageSize = u16;
pub type RollupIndex = u32;

pub const INVALID_METRIC_ID: MetricId = u32::MAX;
pub const INVALID_TIME_SERIES_ID: TimeSeriesId = u32::MAX;
pub const INVALID_FILE_INDEX: FileIndex = u16::MAX;
pub const INVALID_HEADER_INDEX: HeaderIndex = u16::MAX;
pub const INVALID_PAGE_INDEX: PageIndex = u32::MAX;
pub const INVALID_ROLLUP_INDEX: RollupIndex = u32::MAX;

pub const MAX_TAG_LENGTH: usize = 1024;

/// A single `(timestamp, value)` observation.
#[derive(Debug, Copy, Clone, Default, Serialize, Deserialize)]
pub struct DataPoint {
    pub timestamp: Timestamp,
    pub value: f64,
}

impl DataPoint {
    pub fn new(timestamp: Timestamp, value: f64) -> Self {
        DataPoint { timestamp, value }
    }
}

impl PartialEq for DataPoint {
    #[inline]
    fn eq(&self, other: &DataPoint) -> bool {
        if self.timestamp == other.timestamp {
            return if self.value.is_nan() {
                other.value.is_nan()
            } else {
                self.value == other.value
            };
        }
        false
    }
}

impl Eq for DataPoint {}

impl Ord for DataPoint {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp.cmp(&other.timestamp)
    }
}

impl PartialOrd for DataPoint {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A `key=value` pair attached to a time series. Keys and values are UTF-8
/// with bounded length.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> TsdbResult<Self> {
        let key = key.into();
        let value = value.into();
        if key.is_empty() || value.is_empty() {
            return Err(TsdbError::BadRequest("empty tag key or value".into()));
        }
        if key.len() > MAX_TAG_LENGTH || value.len() > MAX_TAG_LENGTH {
            return Err(TsdbError::BadRequest("tag key or value too long".into()));
        }
        Ok(Tag { key, value })
    }
}

/// Tag lists are small in practice; keep them inline.
pub type TagList = SmallVec<Tag, 8>;

/// Sorts tags lexicographically by key and serializes them as
/// `k1=v1,k2=v2,…`. This string is the stable identity of a series.
pub fn canonical_tags(tags: &[Tag]) -> String {
    let mut sorted: SmallVec<&Tag, 8> = tags.iter().collect();
    sorted.sort_by(|a, b| a.key.cmp(&b.key));
    let mut out = String::with_capacity(tags.iter().map(|t| t.key.len() + t.value.len() + 2).sum());
    for (i, tag) in sorted.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        let _ = write!(out, "{}={}", tag.key, tag.value);
    }
    out
}

/// Parses a canonical tag string back into an ordered tag list.
pub fn parse_canonical_tags(raw: &str) -> TsdbResult<TagList> {
    let mut tags = TagList::new();
    if raw.is_empty() {
        return Ok(tags);
    }
    for part in raw.split(',') {
        let (key, value) = part
            .split_once('=')
            .ok_or_else(|| TsdbError::Corrupted(format!("malformed tag pair: {part}")))?;
        tags.push(Tag::new(key, value)?);
    }
    Ok(tags)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_tags_sorted() {
        let tags = vec![
            Tag::new("host", "web1").unwrap(),
            Tag::new("dc", "us-east").unwrap(),
        ];
        assert_eq!(canonical_tags(&tags), "dc=us-east,host=web1");
    }

    #[test]
    fn test_parse_canonical_round_trip() {
        let raw = "dc=us-east,host=web1";
        let tags = parse_canonical_tags(raw).unwrap();
        assert_eq!(canonical_tags(&tags), raw);
    }

    #[test]
    fn test_nan_equality() {
        let a = DataPoint::new(5, f64::NAN);
        let b = DataPoint::new(5, f64::NAN);
        assert_eq!(a, b);
    }
}
