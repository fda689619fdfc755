//! Per-series downsampling: time-bucketed reduction of a raw point
//! stream, with a fill policy for empty buckets.
//!
//! A downsample spec reads `<interval>-<func>[-<fill>]`, e.g. `1h-avg`
//! or `10m-max-zero`. An interval of `all` collapses the whole query
//! range into one bucket.

use crate::common::time::{step_down, TimeRange, TimeUnit, Timestamp};
use crate::common::types::DataPoint;
use crate::compress::rollup::RollupEntry;
use crate::error::{TsdbError, TsdbResult};

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum DownsampleFunc {
    Avg,
    Count,
    Dev,
    First,
    Last,
    Max,
    Min,
    Percentile(u8),
    Sum,
}

impl DownsampleFunc {
    pub fn parse(s: &str) -> TsdbResult<Self> {
        match s {
            "avg" => Ok(DownsampleFunc::Avg),
            "count" => Ok(DownsampleFunc::Count),
            "dev" => Ok(DownsampleFunc::Dev),
            "first" => Ok(DownsampleFunc::First),
            "last" => Ok(DownsampleFunc::Last),
            "max" => Ok(DownsampleFunc::Max),
            "min" => Ok(DownsampleFunc::Min),
            "sum" => Ok(DownsampleFunc::Sum),
            _ => {
                if let Some(n) = s.strip_prefix('p').and_then(|n| n.parse::<u8>().ok()) {
                    if n <= 100 {
                        return Ok(DownsampleFunc::Percentile(n));
                    }
                }
                Err(TsdbError::BadRequest(format!("unknown downsample function {s}")))
            }
        }
    }

    /// Whether this reduction can be answered from `(cnt,min,max,sum)`
    /// rollup entries.
    pub fn supported_by_rollup(&self) -> bool {
        matches!(
            self,
            DownsampleFunc::Avg
                | DownsampleFunc::Count
                | DownsampleFunc::Max
                | DownsampleFunc::Min
                | DownsampleFunc::Sum
        )
    }

    pub fn from_rollup(&self, entry: &RollupEntry) -> f64 {
        match self {
            DownsampleFunc::Avg => entry.sum / entry.cnt as f64,
            DownsampleFunc::Count => entry.cnt as f64,
            DownsampleFunc::Max => entry.max,
            DownsampleFunc::Min => entry.min,
            DownsampleFunc::Sum => entry.sum,
            _ => f64::NAN,
        }
    }
}

#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub enum FillPolicy {
    #[default]
    None,
    Nan,
    Null,
    Zero,
}

impl FillPolicy {
    pub fn parse(s: &str) -> TsdbResult<Self> {
        match s {
            "none" => Ok(FillPolicy::None),
            "nan" => Ok(FillPolicy::Nan),
            "null" => Ok(FillPolicy::Null),
            "zero" => Ok(FillPolicy::Zero),
            _ => Err(TsdbError::BadRequest(format!("unknown fill policy {s}"))),
        }
    }

    fn fill_value(&self) -> Option<f64> {
        match self {
            FillPolicy::None => None,
            FillPolicy::Nan | FillPolicy::Null => Some(f64::NAN),
            FillPolicy::Zero => Some(0.0),
        }
    }
}

/// Parsed `<interval>-<func>[-<fill>]` spec.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct DownsampleSpec {
    /// bucket width in timestamp ticks; `i64::MAX` means `all`
    pub interval: i64,
    pub func: DownsampleFunc,
    pub fill: FillPolicy,
}

impl DownsampleSpec {
    pub fn parse(spec: &str, unit: TimeUnit) -> TsdbResult<Self> {
        let mut parts = spec.splitn(3, '-');
        let interval_str = parts
            .next()
            .ok_or_else(|| TsdbError::BadRequest(format!("bad downsample spec {spec}")))?;
        let func_str = parts
            .next()
            .ok_or_else(|| TsdbError::BadRequest(format!("bad downsample spec {spec}")))?;
        let func = DownsampleFunc::parse(func_str)?;
        let fill = match parts.next() {
            Some(f) => FillPolicy::parse(f)?,
            None => FillPolicy::None,
        };
        let interval = if interval_str == "all" || interval_str == "0all" {
            i64::MAX
        } else {
            parse_interval(interval_str, unit)?
        };
        Ok(DownsampleSpec { interval, func, fill })
    }

    /// True when the buckets are whole hours, so hourly rollups apply.
    pub fn is_hour_multiple(&self, unit: TimeUnit) -> bool {
        let hour = unit.ticks_per(3600);
        self.interval != i64::MAX && self.interval > 0 && self.interval % hour == 0
    }
}

fn parse_interval(s: &str, unit: TimeUnit) -> TsdbResult<i64> {
    let split = s.find(|c: char| !c.is_ascii_digit()).ok_or_else(|| {
        TsdbError::BadRequest(format!("downsample interval {s} is missing a unit"))
    })?;
    let (digits, suffix) = s.split_at(split);
    let n: i64 = digits
        .parse()
        .map_err(|_| TsdbError::BadRequest(format!("bad downsample interval {s}")))?;
    let secs = match suffix {
        "ms" => {
            return match unit {
                TimeUnit::Milliseconds => Ok(n),
                TimeUnit::Seconds => Ok((n / 1000).max(1)),
            }
        }
        "s" => n,
        "m" => n * 60,
        "h" => n * 3600,
        "d" => n * 86_400,
        "w" => n * 7 * 86_400,
        _ => return Err(TsdbError::BadRequest(format!("bad downsample unit {suffix}"))),
    };
    Ok(unit.ticks_per(secs))
}

/// Streaming bucket reducer over timestamp-ordered points.
#[derive(Debug)]
pub struct Downsampler {
    spec: DownsampleSpec,
    /// aligned start of the query, where `all` buckets anchor
    origin: Timestamp,
    range: TimeRange,
    bucket_ts: Timestamp,
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
    first: f64,
    last: f64,
    mean: f64,
    m2: f64,
    values: Vec<f64>,
}

impl Downsampler {
    pub fn new(spec: DownsampleSpec, range: TimeRange) -> Self {
        Downsampler {
            spec,
            origin: range.from,
            range,
            bucket_ts: Timestamp::MIN,
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            first: 0.0,
            last: 0.0,
            mean: 0.0,
            m2: 0.0,
            values: Vec::new(),
        }
    }

    fn step_down(&self, tstamp: Timestamp) -> Timestamp {
        if self.spec.interval == i64::MAX {
            self.origin
        } else {
            step_down(tstamp, self.spec.interval)
        }
    }

    pub fn add_data_point(&mut self, dp: &DataPoint, out: &mut Vec<DataPoint>) {
        let bucket = self.step_down(dp.timestamp);
        if self.bucket_ts == Timestamp::MIN {
            self.open_bucket(bucket);
        } else if bucket != self.bucket_ts {
            self.emit(out);
            self.fill_between(self.bucket_ts + self.spec.interval, bucket, out);
            self.open_bucket(bucket);
        }
        self.accumulate(dp.value);
    }

    /// Emits the final bucket.
    pub fn finish(&mut self, out: &mut Vec<DataPoint>) {
        if self.bucket_ts != Timestamp::MIN && self.count > 0 {
            self.emit(out);
            self.count = 0;
        }
    }

    fn open_bucket(&mut self, bucket: Timestamp) {
        self.bucket_ts = bucket;
        self.count = 0;
        self.sum = 0.0;
        self.min = f64::INFINITY;
        self.max = f64::NEG_INFINITY;
        self.mean = 0.0;
        self.m2 = 0.0;
        self.values.clear();
    }

    fn accumulate(&mut self, value: f64) {
        if self.count == 0 {
            self.first = value;
        }
        self.last = value;
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
        if matches!(self.spec.func, DownsampleFunc::Percentile(_)) {
            self.values.push(value);
        }
    }

    fn finalize(&mut self) -> f64 {
        match self.spec.func {
            DownsampleFunc::Avg => self.sum / self.count as f64,
            DownsampleFunc::Count => self.count as f64,
            DownsampleFunc::Dev => (self.m2 / self.count as f64).sqrt(),
            DownsampleFunc::First => self.first,
            DownsampleFunc::Last => self.last,
            DownsampleFunc::Max => self.max,
            DownsampleFunc::Min => self.min,
            DownsampleFunc::Sum => self.sum,
            DownsampleFunc::Percentile(p) => percentile(&mut self.values, p),
        }
    }

    fn emit(&mut self, out: &mut Vec<DataPoint>) {
        let value = self.finalize();
        out.push(DataPoint::new(self.bucket_ts, value));
    }

    fn fill_between(&self, from: Timestamp, to: Timestamp, out: &mut Vec<DataPoint>) {
        let Some(fill) = self.spec.fill.fill_value() else { return };
        if self.spec.interval == i64::MAX || self.spec.interval <= 0 {
            return;
        }
        let mut bucket = from;
        while bucket < to && self.range.in_range(bucket) {
            out.push(DataPoint::new(bucket, fill));
            bucket += self.spec.interval;
        }
    }
}

/// Nearest-rank percentile; reorders `values`.
pub fn percentile(values: &mut [f64], p: u8) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    if p == 0 {
        return values[0];
    }
    let rank = ((p as f64 / 100.0) * values.len() as f64).ceil() as usize;
    values[rank.clamp(1, values.len()) - 1]
}

/// Reduces hourly rollup entries into downsample buckets. Exact for any
/// whole-hour interval because partial aggregates merge losslessly.
pub fn downsample_rollups(
    entries: &[(Timestamp, RollupEntry)],
    spec: &DownsampleSpec,
    range: &TimeRange,
) -> Vec<DataPoint> {
    let mut out = Vec::new();
    let mut current: Option<(Timestamp, RollupEntry)> = None;
    for (tstamp, entry) in entries {
        if !range.in_range(*tstamp) {
            continue;
        }
        let bucket = step_down(*tstamp, spec.interval);
        match &mut current {
            Some((open, acc)) if *open == bucket => acc.merge(entry),
            Some((open, acc)) => {
                out.push(DataPoint::new(*open, spec.func.from_rollup(acc)));
                if let Some(fill) = spec.fill.fill_value() {
                    let mut b = *open + spec.interval;
                    while b < bucket && range.in_range(b) {
                        out.push(DataPoint::new(b, fill));
                        b += spec.interval;
                    }
                }
                current = Some((bucket, *entry));
            }
            None => current = Some((bucket, *entry)),
        }
    }
    if let Some((open, acc)) = current {
        out.push(DataPoint::new(open, spec.func.from_rollup(&acc)));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(s: &str) -> DownsampleSpec {
        DownsampleSpec::parse(s, TimeUnit::Seconds).unwrap()
    }

    fn run(spec: DownsampleSpec, range: TimeRange, dps: &[(i64, f64)]) -> Vec<DataPoint> {
        let mut ds = Downsampler::new(spec, range);
        let mut out = Vec::new();
        for (t, v) in dps {
            ds.add_data_point(&DataPoint::new(*t, *v), &mut out);
        }
        ds.finish(&mut out);
        out
    }

    #[test]
    fn test_parse_specs() {
        assert_eq!(spec("1h-avg").interval, 3600);
        assert_eq!(spec("10m-max-zero").fill, FillPolicy::Zero);
        assert_eq!(spec("all-sum").interval, i64::MAX);
        assert_eq!(spec("5m-p95").func, DownsampleFunc::Percentile(95));
        assert!(DownsampleSpec::parse("nope", TimeUnit::Seconds).is_err());
    }

    #[test]
    fn test_avg_buckets() {
        let out = run(
            spec("60s-avg"),
            TimeRange::new(0, 300),
            &[(0, 1.0), (30, 3.0), (60, 10.0), (150, 5.0)],
        );
        assert_eq!(out, vec![
            DataPoint::new(0, 2.0),
            DataPoint::new(60, 10.0),
            DataPoint::new(120, 5.0),
        ]);
    }

    #[test]
    fn test_fill_policies() {
        let out = run(
            spec("60s-sum-zero"),
            TimeRange::new(0, 300),
            &[(0, 1.0), (240, 2.0)],
        );
        assert_eq!(out, vec![
            DataPoint::new(0, 1.0),
            DataPoint::new(60, 0.0),
            DataPoint::new(120, 0.0),
            DataPoint::new(180, 0.0),
            DataPoint::new(240, 2.0),
        ]);
    }

    #[test]
    fn test_all_bucket() {
        let out = run(spec("all-count"), TimeRange::new(100, 1000), &[(150, 1.0), (900, 2.0)]);
        assert_eq!(out, vec![DataPoint::new(100, 2.0)]);
    }

    #[test]
    fn test_dev() {
        // population stddev of this set is exactly 2
        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        let dps: Vec<(i64, f64)> =
            values.iter().enumerate().map(|(i, v)| (i as i64 * 10, *v)).collect();
        let out = run(spec("2m-dev"), TimeRange::new(0, 120), &dps);
        assert_eq!(out.len(), 1);
        assert!((out[0].value - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_rollup_downsample_exact() {
        let entries: Vec<(Timestamp, RollupEntry)> = (0..4)
            .map(|h| {
                (
                    h * 3600,
                    RollupEntry { cnt: 2, min: h as f64, max: h as f64 + 1.0, sum: 2.0 * h as f64 + 1.0 },
                )
            })
            .collect();
        let out = downsample_rollups(&entries, &spec("2h-avg"), &TimeRange::new(0, 4 * 3600));
        // two 2h buckets, each averaging 4 raw points
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].timestamp, 0);
        assert_eq!(out[0].value, (1.0 + 3.0) / 4.0);
        assert_eq!(out[1].timestamp, 2 * 3600);
        assert_eq!(out[1].value, (5.0 + 7.0) / 4.0);
    }
}
