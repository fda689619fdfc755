//! Cross-series aggregation: folds the per-series (already downsampled)
//! streams into one, bucketing by exact timestamp.

use std::collections::BTreeMap;

use crate::common::time::Timestamp;
use crate::common::types::DataPoint;
use crate::error::{TsdbError, TsdbResult};
use crate::query::downsample::percentile;

#[derive(Debug, Copy, Clone, Default, PartialEq)]
pub enum Aggregator {
    Avg,
    Count,
    Dev,
    Max,
    Min,
    #[default]
    None,
    Sum,
    Percentile(u8),
}

impl Aggregator {
    pub fn parse(s: &str) -> TsdbResult<Self> {
        match s {
            "avg" => Ok(Aggregator::Avg),
            "count" => Ok(Aggregator::Count),
            "dev" => Ok(Aggregator::Dev),
            "max" => Ok(Aggregator::Max),
            "min" => Ok(Aggregator::Min),
            "none" => Ok(Aggregator::None),
            "sum" => Ok(Aggregator::Sum),
            _ => {
                if let Some(n) = s.strip_prefix('p').and_then(|n| n.parse::<u8>().ok()) {
                    if n <= 100 {
                        return Ok(Aggregator::Percentile(n));
                    }
                }
                Err(TsdbError::BadRequest(format!("unknown aggregator {s}")))
            }
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Aggregator::None)
    }

    fn apply(&self, values: &mut [f64]) -> f64 {
        match self {
            Aggregator::Avg => values.iter().sum::<f64>() / values.len() as f64,
            Aggregator::Count => values.len() as f64,
            Aggregator::Dev => {
                let n = values.len() as f64;
                let mean = values.iter().sum::<f64>() / n;
                (values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n).sqrt()
            }
            Aggregator::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            Aggregator::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
            Aggregator::Sum => values.iter().sum(),
            Aggregator::Percentile(p) => percentile(values, *p),
            Aggregator::None => unreachable!("none aggregator never folds"),
        }
    }
}

/// Folds several timestamp-ordered series into one. NaN fills are kept
/// out of the fold so a fill in one series does not poison the bucket.
pub fn aggregate(aggregator: Aggregator, series: &[Vec<DataPoint>]) -> Vec<DataPoint> {
    debug_assert!(!aggregator.is_none());
    let mut buckets: BTreeMap<Timestamp, Vec<f64>> = BTreeMap::new();
    for dps in series {
        for dp in dps {
            if dp.value.is_nan() {
                continue;
            }
            buckets.entry(dp.timestamp).or_default().push(dp.value);
        }
    }
    buckets
        .into_iter()
        .map(|(tstamp, mut values)| DataPoint::new(tstamp, aggregator.apply(&mut values)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dps(points: &[(i64, f64)]) -> Vec<DataPoint> {
        points.iter().map(|(t, v)| DataPoint::new(*t, *v)).collect()
    }

    #[test]
    fn test_sum_across_series() {
        let a = dps(&[(0, 1.0), (60, 2.0)]);
        let b = dps(&[(0, 10.0), (120, 5.0)]);
        let out = aggregate(Aggregator::Sum, &[a, b]);
        assert_eq!(out, dps(&[(0, 11.0), (60, 2.0), (120, 5.0)]));
    }

    #[test]
    fn test_avg_skips_nan_fills() {
        let a = dps(&[(0, 4.0)]);
        let b = dps(&[(0, f64::NAN)]);
        let out = aggregate(Aggregator::Avg, &[a, b]);
        assert_eq!(out, dps(&[(0, 4.0)]));
    }

    #[test]
    fn test_percentile() {
        let series: Vec<Vec<DataPoint>> =
            (1..=100).map(|i| dps(&[(0, i as f64)])).collect();
        let out = aggregate(Aggregator::Percentile(90), &series);
        assert_eq!(out[0].value, 90.0);
    }

    #[test]
    fn test_parse() {
        assert_eq!(Aggregator::parse("sum").unwrap(), Aggregator::Sum);
        assert_eq!(Aggregator::parse("p99").unwrap(), Aggregator::Percentile(99));
        assert!(Aggregator::parse("median").is_err());
    }
}
