//! One time series: a unique `(metric, tags)` pair with a stable dense
//! id, plus its in-memory write buffers.
//!
//! A series holds up to two buffered pages: the in-order page for the
//! window currently being written, and an out-of-order page (raw codec)
//! for late points. Both may be partially persisted; the slot they were
//! persisted to is remembered so later flushes rewrite in place.

use parking_lot::{Mutex, MutexGuard};

use crate::common::time::{TimeRange, Timestamp, INVALID_TIMESTAMP};
use crate::common::types::{
    canonical_tags, FileIndex, HeaderIndex, MetricId, TagList, TimeSeriesId,
};
use crate::storage::data_file::PageSlot;
use crate::storage::page::PageInMemory;

/// On-disk location of a partially flushed in-memory page.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PersistedPage {
    pub file: FileIndex,
    pub header: HeaderIndex,
    pub slot: PageSlot,
    pub capacity: u16,
}

/// Chain bookkeeping of one series within one window: where the next
/// page links, and whether the midpoint index entry was set. A missing
/// link is rebuilt by walking the chain, so this is purely a cache.
#[derive(Debug, Copy, Clone)]
pub struct WindowLink {
    pub window_from: Timestamp,
    pub chain_tail: Option<(FileIndex, HeaderIndex)>,
    pub second_set: bool,
}

impl WindowLink {
    pub fn new(window_from: Timestamp) -> Self {
        WindowLink { window_from, chain_tail: None, second_set: false }
    }
}

/// Mutable per-series state, guarded by one mutex. Writers are serialized
/// per series by the ingest path; queries take the lock briefly to
/// snapshot the buffers.
#[derive(Debug, Default)]
pub struct SeriesState {
    /// in-order write buffer
    pub page: Option<PageInMemory>,
    /// out-of-order buffer, always the raw codec; may belong to an older
    /// window than `page`
    pub ooo_page: Option<PageInMemory>,
    /// where `page` lives on disk, when partially flushed
    pub page_slot: Option<PersistedPage>,
    pub ooo_slot: Option<PersistedPage>,
    /// chain state for the windows the two buffers write into
    pub links: smallvec::SmallVec<WindowLink, 2>,
    /// highest in-order timestamp ever accepted; later points below this
    /// go to the out-of-order buffer
    pub last_tstamp: Timestamp,
}

impl SeriesState {
    pub fn link_for(&mut self, window_from: Timestamp) -> Option<&mut WindowLink> {
        self.links.iter_mut().find(|l| l.window_from == window_from)
    }

    /// Inserts `link`, evicting stale entries no buffer refers to.
    pub fn put_link(&mut self, link: WindowLink) -> &mut WindowLink {
        let keep_page = self.page.as_ref().map(|p| p.tsdb_range.from);
        let keep_ooo = self.ooo_page.as_ref().map(|p| p.tsdb_range.from);
        self.links.retain(|l| {
            l.window_from == link.window_from
                || Some(l.window_from) == keep_page
                || Some(l.window_from) == keep_ooo
        });
        if let Some(at) = self.links.iter().position(|l| l.window_from == link.window_from) {
            self.links[at] = link;
            &mut self.links[at]
        } else {
            self.links.push(link);
            self.links.last_mut().unwrap()
        }
    }
}

#[derive(Debug)]
pub struct TimeSeries {
    id: TimeSeriesId,
    metric_id: MetricId,
    tags: TagList,
    canonical: String,
    state: Mutex<SeriesState>,
}

impl TimeSeries {
    pub fn new(id: TimeSeriesId, metric_id: MetricId, tags: TagList) -> Self {
        let canonical = canonical_tags(&tags);
        TimeSeries {
            id,
            metric_id,
            tags,
            canonical,
            state: Mutex::new(SeriesState {
                last_tstamp: INVALID_TIMESTAMP,
                ..Default::default()
            }),
        }
    }

    pub fn id(&self) -> TimeSeriesId {
        self.id
    }

    pub fn metric_id(&self) -> MetricId {
        self.metric_id
    }

    pub fn tags(&self) -> &[crate::common::types::Tag] {
        &self.tags
    }

    pub fn tag_count(&self) -> usize {
        self.tags.len()
    }

    /// The canonical `k1=v1,k2=v2` identity of this series.
    pub fn key(&self) -> &str {
        &self.canonical
    }

    pub fn state(&self) -> MutexGuard<'_, SeriesState> {
        self.state.lock()
    }

    /// Consistent snapshot of the buffers bound to `range`: the in-order
    /// and out-of-order points, plus the on-disk pages those buffers have
    /// already been partially flushed to. A query must read the buffer
    /// *instead of* those pages or it would see every point twice.
    pub fn buffered_snapshot(&self, range: &TimeRange) -> BufferSnapshot {
        let state = self.state.lock();
        let mut snapshot = BufferSnapshot::default();
        if let Some(page) = &state.page {
            if page.tsdb_range == *range && !page.is_empty() {
                let _ = page.get_all_data_points(&mut snapshot.in_order);
                if let Some(slot) = &state.page_slot {
                    snapshot.exclude.push((slot.file, slot.header));
                }
            }
        }
        if let Some(page) = &state.ooo_page {
            if page.tsdb_range == *range && !page.is_empty() {
                let _ = page.get_all_data_points(&mut snapshot.out_of_order);
                if let Some(slot) = &state.ooo_slot {
                    snapshot.exclude.push((slot.file, slot.header));
                }
            }
        }
        snapshot
    }
}

/// See [`TimeSeries::buffered_snapshot`].
#[derive(Debug, Default)]
pub struct BufferSnapshot {
    pub in_order: Vec<crate::common::types::DataPoint>,
    pub out_of_order: Vec<crate::common::types::DataPoint>,
    /// pages superseded by the buffers above
    pub exclude: smallvec::SmallVec<(FileIndex, HeaderIndex), 2>,
}

#[cfg(test)]
mod tests {
    use crate::common::types::Tag;

    use super::*;

    #[test]
    fn test_key_is_canonical() {
        let tags: TagList = [
            Tag::new("host", "a").unwrap(),
            Tag::new("dc", "east").unwrap(),
        ]
        .into_iter()
        .collect();
        let series = TimeSeries::new(0, 0, tags);
        assert_eq!(series.key(), "dc=east,host=a");
        assert_eq!(series.tag_count(), 2);
    }
}
