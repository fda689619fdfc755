//! The query engine: resolves a metric + tag matcher to series, fans out
//! over the intersecting partitions, decodes (or reads rollups), then
//! runs the per-series downsampler and the cross-series aggregator.

pub mod aggregate;
pub mod downsample;
pub mod matcher;

use std::collections::BTreeMap;
use std::sync::Arc;

use rayon::prelude::*;
use serde::Serialize;

use crate::common::time::{TimeRange, Timestamp};
use crate::common::types::DataPoint;
use crate::error::{TsdbError, TsdbResult};
use crate::series::TimeSeries;
use crate::tsdb::database::{Database, ShutdownMode};
use crate::tsdb::rollup::rollup_entries;
use crate::tsdb::Tsdb;

pub use aggregate::Aggregator;
pub use downsample::{DownsampleFunc, DownsampleSpec, Downsampler, FillPolicy};
pub use matcher::{TagFilter, TagMatcher};

/// One parsed query against a single metric.
#[derive(Debug, Clone)]
pub struct Query {
    pub metric: String,
    pub range: TimeRange,
    pub matcher: TagMatcher,
    pub downsample: Option<DownsampleSpec>,
    pub aggregator: Aggregator,
}

impl Query {
    pub fn new(metric: impl Into<String>, range: TimeRange) -> Self {
        Query {
            metric: metric.into(),
            range,
            matcher: TagMatcher::default(),
            downsample: None,
            aggregator: Aggregator::None,
        }
    }

    pub fn with_matcher(mut self, matcher: TagMatcher) -> Self {
        self.matcher = matcher;
        self
    }

    pub fn with_downsample(mut self, spec: DownsampleSpec) -> Self {
        self.downsample = Some(spec);
        self
    }

    pub fn with_aggregator(mut self, aggregator: Aggregator) -> Self {
        self.aggregator = aggregator;
        self
    }
}

/// One output row: a series (or an aggregation of several) with its
/// resolved tag set and data points.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct QueryRow {
    pub metric: String,
    pub tags: BTreeMap<String, String>,
    pub dps: Vec<(Timestamp, f64)>,
}

/// Serializes result rows the way the HTTP layer emits them.
pub fn rows_to_json(rows: &[QueryRow]) -> TsdbResult<String> {
    serde_json::to_string(rows).map_err(|e| TsdbError::Internal(e.to_string()))
}

/// Runs one query to completion. Cancellation is observed at series
/// boundaries via the database shutdown flag.
pub fn execute(db: &Database, query: &Query) -> TsdbResult<Vec<QueryRow>> {
    let Some(mapping) = db.get_mapping(&query.metric) else {
        return Ok(Vec::new());
    };
    if query.matcher.explicit_tags() {
        // prune the whole metric when every series has a different count
        if let Some(count) = mapping.common_tag_count() {
            if count != query.matcher.filter_count() {
                return Ok(Vec::new());
            }
        }
    }

    let series: Vec<Arc<TimeSeries>> = mapping
        .all_series()
        .into_iter()
        .filter(|s| query.matcher.matches(s))
        .collect();
    if series.is_empty() {
        return Ok(Vec::new());
    }
    let tsdbs = db.insts(&query.range);

    let scanned: Vec<(Arc<TimeSeries>, Vec<DataPoint>)> = series
        .par_iter()
        .map(|s| scan_series(db, s, &tsdbs, query).map(|dps| (s.clone(), dps)))
        .collect::<TsdbResult<_>>()?;

    if query.aggregator.is_none() {
        return Ok(scanned
            .into_iter()
            .filter(|(_, dps)| !dps.is_empty())
            .map(|(s, dps)| QueryRow {
                metric: query.metric.clone(),
                tags: tag_map(&s),
                dps: dps.into_iter().map(|dp| (dp.timestamp, dp.value)).collect(),
            })
            .collect());
    }

    let per_series: Vec<Vec<DataPoint>> = scanned.iter().map(|(_, dps)| dps.clone()).collect();
    let folded = aggregate::aggregate(query.aggregator, &per_series);
    let tags = common_tags(&scanned);
    Ok(vec![QueryRow {
        metric: query.metric.clone(),
        tags,
        dps: folded.into_iter().map(|dp| (dp.timestamp, dp.value)).collect(),
    }])
}

/// Collects one series' points across the given partitions, downsampled
/// when the query asks for it.
fn scan_series(
    db: &Database,
    series: &Arc<TimeSeries>,
    tsdbs: &[Arc<Tsdb>],
    query: &Query,
) -> TsdbResult<Vec<DataPoint>> {
    if db.shutdown_requested() == ShutdownMode::Now {
        return Err(TsdbError::Cancelled);
    }

    let unit = db.settings().time_unit;
    if let Some(spec) = &query.downsample {
        if spec.is_hour_multiple(unit) && spec.func.supported_by_rollup() {
            if let Some(dps) = try_rollup_scan(series, tsdbs, query, spec, unit.ticks_per(3600))? {
                return Ok(dps);
            }
        }
    }

    let mut all = Vec::new();
    for tsdb in tsdbs {
        let mut snapshot = series.buffered_snapshot(tsdb.range());
        let mut containers = tsdb.query_for_data(
            series.metric_id(),
            series.id(),
            &query.range,
            &snapshot.exclude,
        )?;
        let mut mem_in = std::mem::take(&mut snapshot.in_order);
        let mut mem_ooo = std::mem::take(&mut snapshot.out_of_order);
        mem_in.retain(|dp| query.range.in_range(dp.timestamp));
        mem_ooo.retain(|dp| query.range.in_range(dp.timestamp));

        let needs_sort =
            containers.iter().any(|c| c.out_of_order) || !mem_ooo.is_empty();
        let mut segment: Vec<DataPoint> = Vec::new();
        for container in containers.drain(..) {
            segment.extend(container.dps);
        }
        segment.append(&mut mem_in);
        segment.append(&mut mem_ooo);
        if needs_sort {
            // late points live on separate pages; one stable sort merges
            segment.sort_by_key(|dp| dp.timestamp);
        }
        all.append(&mut segment);
    }

    match &query.downsample {
        Some(spec) => {
            let mut downsampler = Downsampler::new(*spec, query.range);
            let mut out = Vec::new();
            for dp in &all {
                downsampler.add_data_point(dp, &mut out);
            }
            downsampler.finish(&mut out);
            Ok(out)
        }
        None => Ok(all),
    }
}

/// The rollup fast path: valid only when every intersecting partition
/// has a trusted rollup for this series and nothing for those windows is
/// still buffered in memory.
fn try_rollup_scan(
    series: &Arc<TimeSeries>,
    tsdbs: &[Arc<Tsdb>],
    query: &Query,
    spec: &DownsampleSpec,
    bucket_ticks: i64,
) -> TsdbResult<Option<Vec<DataPoint>>> {
    let mut entries = Vec::new();
    for tsdb in tsdbs {
        let snapshot = series.buffered_snapshot(tsdb.range());
        if !snapshot.in_order.is_empty() || !snapshot.out_of_order.is_empty() {
            return Ok(None);
        }
        match rollup_entries(tsdb, series.metric_id(), series.id(), bucket_ticks)? {
            Some(mut e) => entries.append(&mut e),
            None => return Ok(None),
        }
    }
    Ok(Some(downsample::downsample_rollups(&entries, spec, &query.range)))
}

fn tag_map(series: &TimeSeries) -> BTreeMap<String, String> {
    series
        .tags()
        .iter()
        .map(|t| (t.key.clone(), t.value.clone()))
        .collect()
}

/// Tags shared (same key and value) by every aggregated series.
fn common_tags(scanned: &[(Arc<TimeSeries>, Vec<DataPoint>)]) -> BTreeMap<String, String> {
    let mut iter = scanned.iter().map(|(s, _)| tag_map(s));
    let Some(mut common) = iter.next() else {
        return BTreeMap::new();
    };
    for tags in iter {
        common.retain(|k, v| tags.get(k) == Some(v));
    }
    common
}
