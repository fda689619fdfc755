//! Series registry per metric: the `Mapping` from canonical tag strings
//! to time series, and line-protocol `Measurement` families whose fields
//! each become one series.

pub mod time_series;

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::RwLock;

use crate::common::types::{MetricId, TagList, TimeSeriesId};
use crate::error::{TsdbError, TsdbResult};

pub use time_series::{BufferSnapshot, PersistedPage, SeriesState, TimeSeries, WindowLink};

/// Sentinel for "series under this metric have differing tag counts".
const TAG_COUNT_MIXED: i32 = -2;
const TAG_COUNT_UNSET: i32 = -1;

/// A line-protocol family: one tag set with several numeric fields, each
/// field a separate series, kept in field order.
#[derive(Debug)]
pub struct Measurement {
    fields: Vec<(String, Arc<TimeSeries>)>,
}

impl Measurement {
    pub fn get_field(&self, name: &str) -> Option<&Arc<TimeSeries>> {
        self.fields.iter().find(|(f, _)| f == name).map(|(_, ts)| ts)
    }

    pub fn fields(&self) -> &[(String, Arc<TimeSeries>)] {
        &self.fields
    }
}

#[derive(Debug)]
enum MapEntry {
    Series(Arc<TimeSeries>),
    Measurement(Arc<Measurement>),
}

#[derive(Debug, Default)]
struct MappingInner {
    /// canonical tag string → series or measurement
    map: AHashMap<String, MapEntry>,
    /// dense arena of every series under this metric, in creation order;
    /// iteration is a range walk instead of a linked-list chase
    arena: Vec<Arc<TimeSeries>>,
}

/// All time series under one metric name.
#[derive(Debug)]
pub struct Mapping {
    metric: String,
    metric_id: MetricId,
    inner: RwLock<MappingInner>,
    /// cached common tag count, `-2` when mixed
    tag_count: AtomicI32,
}

impl Mapping {
    pub fn new(metric: impl Into<String>, metric_id: MetricId) -> Self {
        Mapping {
            metric: metric.into(),
            metric_id,
            inner: RwLock::new(MappingInner::default()),
            tag_count: AtomicI32::new(TAG_COUNT_UNSET),
        }
    }

    pub fn metric(&self) -> &str {
        &self.metric
    }

    pub fn metric_id(&self) -> MetricId {
        self.metric_id
    }

    pub fn series_count(&self) -> usize {
        self.inner.read().arena.len()
    }

    /// The cached tag count, or `None` when series disagree.
    pub fn common_tag_count(&self) -> Option<usize> {
        match self.tag_count.load(Ordering::Relaxed) {
            TAG_COUNT_MIXED | TAG_COUNT_UNSET => None,
            n => Some(n as usize),
        }
    }

    fn note_tag_count(&self, count: usize) {
        let count = count as i32;
        let _ = self.tag_count.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
            match current {
                TAG_COUNT_UNSET => Some(count),
                c if c == count => None,
                _ => Some(TAG_COUNT_MIXED),
            }
        });
    }

    /// Looks up the series for `tags`, creating it through `create` under
    /// the write lock on first touch. `create` assigns the id and writes
    /// the meta record.
    pub fn get_or_create_series(
        &self,
        canonical: &str,
        tags: &TagList,
        create: impl FnOnce() -> TsdbResult<Arc<TimeSeries>>,
    ) -> TsdbResult<Arc<TimeSeries>> {
        {
            let inner = self.inner.read();
            match inner.map.get(canonical) {
                Some(MapEntry::Series(ts)) => return Ok(ts.clone()),
                Some(MapEntry::Measurement(_)) => {
                    return Err(TsdbError::BadRequest(format!(
                        "{}: tag set {canonical} already names a measurement",
                        self.metric
                    )))
                }
                None => {}
            }
        }

        let mut inner = self.inner.write();
        match inner.map.get(canonical) {
            Some(MapEntry::Series(ts)) => Ok(ts.clone()),
            Some(MapEntry::Measurement(_)) => Err(TsdbError::BadRequest(format!(
                "{}: tag set {canonical} already names a measurement",
                self.metric
            ))),
            None => {
                let ts = create()?;
                inner.map.insert(canonical.to_string(), MapEntry::Series(ts.clone()));
                inner.arena.push(ts.clone());
                self.note_tag_count(tags.len());
                Ok(ts)
            }
        }
    }

    /// Measurement lookup; `create` builds every field series at once so
    /// ids stay in field order. The field set is fixed on first write:
    /// later writes with unknown fields have those fields dropped by the
    /// caller, which keeps the meta file single-record per family.
    pub fn get_or_create_measurement(
        &self,
        canonical: &str,
        tags: &TagList,
        create: impl FnOnce() -> TsdbResult<Vec<(String, Arc<TimeSeries>)>>,
    ) -> TsdbResult<Arc<Measurement>> {
        {
            let inner = self.inner.read();
            match inner.map.get(canonical) {
                Some(MapEntry::Measurement(m)) => return Ok(m.clone()),
                Some(MapEntry::Series(_)) => {
                    return Err(TsdbError::BadRequest(format!(
                        "{}: tag set {canonical} already names a plain series",
                        self.metric
                    )))
                }
                None => {}
            }
        }

        let mut inner = self.inner.write();
        match inner.map.get(canonical) {
            Some(MapEntry::Measurement(m)) => Ok(m.clone()),
            Some(MapEntry::Series(_)) => Err(TsdbError::BadRequest(format!(
                "{}: tag set {canonical} already names a plain series",
                self.metric
            ))),
            None => {
                let fields = create()?;
                for (_, ts) in &fields {
                    inner.arena.push(ts.clone());
                }
                let measurement = Arc::new(Measurement { fields });
                inner
                    .map
                    .insert(canonical.to_string(), MapEntry::Measurement(measurement.clone()));
                self.note_tag_count(tags.len());
                Ok(measurement)
            }
        }
    }

    /// Restores a series replayed from the meta file.
    pub fn restore_series(&self, canonical: String, ts: Arc<TimeSeries>) -> TsdbResult<()> {
        let mut inner = self.inner.write();
        if inner.map.contains_key(&canonical) {
            return Err(TsdbError::Corrupted(format!(
                "duplicate series {}[{canonical}] in meta file",
                self.metric
            )));
        }
        self.note_tag_count(ts.tag_count());
        inner.map.insert(canonical, MapEntry::Series(ts.clone()));
        inner.arena.push(ts);
        Ok(())
    }

    /// Restores a measurement family replayed from the meta file.
    pub fn restore_measurement(
        &self,
        canonical: String,
        fields: Vec<(String, Arc<TimeSeries>)>,
    ) -> TsdbResult<()> {
        let mut inner = self.inner.write();
        if inner.map.contains_key(&canonical) {
            return Err(TsdbError::Corrupted(format!(
                "duplicate measurement {}[{canonical}] in meta file",
                self.metric
            )));
        }
        if let Some((_, first)) = fields.first() {
            self.note_tag_count(first.tag_count());
        }
        for (_, ts) in &fields {
            inner.arena.push(ts.clone());
        }
        inner.map.insert(canonical, MapEntry::Measurement(Arc::new(Measurement { fields })));
        Ok(())
    }

    /// Calls `f` on every series under this metric.
    pub fn for_each_series(&self, mut f: impl FnMut(&Arc<TimeSeries>)) {
        let inner = self.inner.read();
        for ts in &inner.arena {
            f(ts);
        }
    }

    /// All series snapshot, for parallel query fan-out.
    pub fn all_series(&self) -> Vec<Arc<TimeSeries>> {
        self.inner.read().arena.clone()
    }
}

/// Resolves a series id to its series, across every mapping. Backed by a
/// dense arena indexed by `TimeSeriesId`.
#[derive(Debug, Default)]
pub struct SeriesRegistry {
    by_id: RwLock<Vec<Option<Arc<TimeSeries>>>>,
}

impl SeriesRegistry {
    pub fn register(&self, ts: Arc<TimeSeries>) {
        let mut by_id = self.by_id.write();
        let idx = ts.id() as usize;
        if idx >= by_id.len() {
            by_id.resize(idx + 1, None);
        }
        by_id[idx] = Some(ts);
    }

    pub fn get(&self, id: TimeSeriesId) -> Option<Arc<TimeSeries>> {
        self.by_id.read().get(id as usize).and_then(|ts| ts.clone())
    }

    pub fn len(&self) -> usize {
        self.by_id.read().iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every registered series.
    pub fn all(&self) -> Vec<Arc<TimeSeries>> {
        self.by_id.read().iter().flatten().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use crate::common::types::{canonical_tags, Tag};

    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> TagList {
        pairs.iter().map(|(k, v)| Tag::new(*k, *v).unwrap()).collect()
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let mapping = Mapping::new("cpu", 0);
        let t = tags(&[("host", "a")]);
        let canonical = canonical_tags(&t);

        let first = mapping
            .get_or_create_series(&canonical, &t, || {
                Ok(Arc::new(TimeSeries::new(0, 0, t.clone())))
            })
            .unwrap();
        let second = mapping
            .get_or_create_series(&canonical, &t, || panic!("must not create twice"))
            .unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(mapping.series_count(), 1);
        assert_eq!(mapping.common_tag_count(), Some(1));
    }

    #[test]
    fn test_mixed_tag_counts() {
        let mapping = Mapping::new("cpu", 0);
        for (i, t) in [tags(&[("host", "a")]), tags(&[("host", "b"), ("dc", "east")])]
            .into_iter()
            .enumerate()
        {
            let canonical = canonical_tags(&t);
            mapping
                .get_or_create_series(&canonical, &t, || {
                    Ok(Arc::new(TimeSeries::new(i as TimeSeriesId, 0, t.clone())))
                })
                .unwrap();
        }
        assert_eq!(mapping.common_tag_count(), None);
    }

    #[test]
    fn test_duplicate_restore_is_corrupted() {
        let mapping = Mapping::new("cpu", 0);
        let t = tags(&[("host", "a")]);
        let canonical = canonical_tags(&t);
        mapping
            .restore_series(canonical.clone(), Arc::new(TimeSeries::new(0, 0, t.clone())))
            .unwrap();
        let err = mapping
            .restore_series(canonical, Arc::new(TimeSeries::new(1, 0, t)))
            .unwrap_err();
        assert!(matches!(err, TsdbError::Corrupted(_)));
    }
}
