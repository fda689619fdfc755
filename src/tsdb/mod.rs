//! One Tsdb: a fixed time-range partition of the database.
//!
//! A partition owns, per metric, a directory of `(header, data)` file
//! pairs, plus one index file mapping every series to the head of its
//! page chain. All page allocation within the partition is serialized
//! under one mutex; a reader may miss a just-linked page but never
//! observes a broken chain.

pub mod database;
pub mod rollup;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use min_max_heap::MinMaxHeap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::common::time::{current_time_secs, TimeRange, TimeUnit, Timestamp};
use crate::common::types::{
    DataPoint, FileIndex, HeaderIndex, MetricId, INVALID_FILE_INDEX,
};
use crate::compress::{uncompress_page, CompressorVersion};
use crate::config::Settings;
use crate::error::{TsdbError, TsdbResult};
use crate::series::time_series::WindowLink;
use crate::series::{PersistedPage, TimeSeries};
use crate::storage::data_file::{DataFile, PageSlot};
use crate::storage::header_file::HeaderFile;
use crate::storage::index_file::IndexFile;
use crate::storage::page::PageInMemory;

pub const MODE_NONE: u32 = 0x00;
pub const MODE_READ: u32 = 0x01;
pub const MODE_WRITE: u32 = 0x02;
pub const MODE_COMPACTED: u32 = 0x04;
pub const MODE_ROLLED_UP: u32 = 0x08;
pub const MODE_CRASHED: u32 = 0x10;
pub const MODE_READ_WRITE: u32 = MODE_READ | MODE_WRITE;

const INDEX_FILE_NAME: &str = "index";
const CONFIG_FILE_NAME: &str = "config";

/// Decoded points of one page, as returned by the chain walk.
#[derive(Debug)]
pub struct DataPointContainer {
    pub dps: Vec<DataPoint>,
    pub out_of_order: bool,
}

/// One `(header, data)` pair of a metric directory.
#[derive(Debug)]
pub struct FilePair {
    pub header: HeaderFile,
    pub data: DataFile,
    pub version: CompressorVersion,
}

/// All file pairs of one metric within one Tsdb.
#[derive(Debug)]
pub struct MetricFiles {
    dir: PathBuf,
    pairs: RwLock<Vec<Arc<FilePair>>>,
}

impl MetricFiles {
    pub fn pair(&self, file_idx: FileIndex) -> TsdbResult<Arc<FilePair>> {
        self.pairs
            .read()
            .get(file_idx as usize)
            .cloned()
            .ok_or_else(|| {
                TsdbError::Corrupted(format!(
                    "file index {} missing under {:?}",
                    file_idx, self.dir
                ))
            })
    }

    pub fn pair_count(&self) -> usize {
        self.pairs.read().len()
    }

    pub fn last_pair(&self) -> Option<(FileIndex, Arc<FilePair>)> {
        let pairs = self.pairs.read();
        pairs
            .last()
            .map(|pair| ((pairs.len() - 1) as FileIndex, pair.clone()))
    }
}

pub struct Tsdb {
    range: TimeRange,
    dir: PathBuf,
    time_unit: TimeUnit,
    page_size: u16,
    page_count: u32,
    compressor: CompressorVersion,
    index: IndexFile,
    metrics: RwLock<AHashMap<MetricId, Arc<MetricFiles>>>,
    /// serializes `append_page` and file-pair creation
    append_lock: Mutex<()>,
    mode: AtomicU32,
    /// epoch seconds of the last read or write through this partition
    last_access: AtomicI64,
}

fn metric_dir_name(metric_id: MetricId) -> String {
    format!("m{metric_id:010}")
}

fn header_file_name(file_idx: FileIndex) -> String {
    format!("header.{file_idx:05}")
}

fn data_file_name(file_idx: FileIndex) -> String {
    format!("data.{file_idx:05}")
}

impl Tsdb {
    /// Directory of the partition containing `range`:
    /// `<data_dir>/<YYYY>/<MM>/<from_sec>.<to_sec>`.
    pub fn dir_for(data_dir: &Path, range: &TimeRange, unit: TimeUnit) -> PathBuf {
        let from_sec = unit.to_secs(range.from);
        let to_sec = unit.to_secs(range.to);
        let date = chrono::DateTime::from_timestamp(from_sec, 0).unwrap_or_default();
        use chrono::Datelike;
        data_dir
            .join(format!("{:04}", date.year()))
            .join(format!("{:02}", date.month()))
            .join(format!("{from_sec}.{to_sec}"))
    }

    pub fn create(data_dir: &Path, range: TimeRange, settings: &Settings) -> TsdbResult<Self> {
        let dir = Self::dir_for(data_dir, &range, settings.time_unit);
        Self::create_at(&dir, range, settings)
    }

    /// Creates a partition in an explicit directory; compaction uses this
    /// for its `.temp` sibling.
    pub fn create_at(dir: &Path, range: TimeRange, settings: &Settings) -> TsdbResult<Self> {
        let dir = dir.to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let config_text = format!(
            "tsdb.from = {}\ntsdb.to = {}\ntsdb.page.size = {}\ntsdb.page.count = {}\ntsdb.compressor.version = {}\ntsdb.timestamp.ms = {}\n",
            range.from,
            range.to,
            settings.page_size,
            settings.page_count,
            settings.compressor_version.as_u8(),
            settings.time_unit.is_millisecond(),
        );
        std::fs::write(dir.join(CONFIG_FILE_NAME), config_text)?;

        let index = IndexFile::create(&dir.join(INDEX_FILE_NAME))?;
        debug!(dir = %dir.display(), %range, "created tsdb partition");
        Ok(Tsdb {
            range,
            dir,
            time_unit: settings.time_unit,
            page_size: settings.page_size,
            page_count: settings.page_count,
            compressor: settings.compressor_version,
            index,
            metrics: RwLock::new(AHashMap::new()),
            append_lock: Mutex::new(()),
            mode: AtomicU32::new(MODE_READ_WRITE),
            last_access: AtomicI64::new(current_time_secs()),
        })
    }

    /// Opens an existing partition directory. A timestamp-resolution
    /// mismatch against the running configuration is fatal.
    pub fn open_existing(dir: &Path, settings: &Settings) -> TsdbResult<Self> {
        let config_text = std::fs::read_to_string(dir.join(CONFIG_FILE_NAME))?;
        let mut from = None;
        let mut to = None;
        let mut page_size = settings.page_size;
        let mut page_count = settings.page_count;
        let mut compressor = settings.compressor_version;
        let mut millisecond = false;
        for line in config_text.lines() {
            let Some((key, value)) = line.split_once('=') else { continue };
            let (key, value) = (key.trim(), value.trim());
            match key {
                "tsdb.from" => from = value.parse::<Timestamp>().ok(),
                "tsdb.to" => to = value.parse::<Timestamp>().ok(),
                "tsdb.page.size" => page_size = value.parse().unwrap_or(page_size),
                "tsdb.page.count" => page_count = value.parse().unwrap_or(page_count),
                "tsdb.compressor.version" => {
                    compressor = value
                        .parse::<u8>()
                        .ok()
                        .and_then(|v| CompressorVersion::try_from(v).ok())
                        .unwrap_or(compressor)
                }
                "tsdb.timestamp.ms" => millisecond = value == "true",
                _ => {}
            }
        }
        let (Some(from), Some(to)) = (from, to) else {
            return Err(TsdbError::Corrupted(format!(
                "partition config in {dir:?} is missing its time range"
            )));
        };
        if millisecond != settings.time_unit.is_millisecond() {
            return Err(TsdbError::InvalidConfiguration(format!(
                "partition {dir:?} uses {} resolution but the process is configured for {}",
                if millisecond { "millisecond" } else { "second" },
                settings.time_unit,
            )));
        }

        Ok(Tsdb {
            range: TimeRange::new(from, to),
            dir: dir.to_path_buf(),
            time_unit: settings.time_unit,
            page_size,
            page_count,
            compressor,
            index: IndexFile::closed(&dir.join(INDEX_FILE_NAME)),
            metrics: RwLock::new(AHashMap::new()),
            append_lock: Mutex::new(()),
            mode: AtomicU32::new(MODE_READ),
            last_access: AtomicI64::new(0),
        })
    }

    pub fn range(&self) -> &TimeRange {
        &self.range
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn page_size(&self) -> u16 {
        self.page_size
    }

    pub fn page_count(&self) -> u32 {
        self.page_count
    }

    pub fn compressor_version(&self) -> CompressorVersion {
        self.compressor
    }

    pub fn index(&self) -> &IndexFile {
        &self.index
    }

    pub fn in_range(&self, tstamp: Timestamp) -> bool {
        self.range.in_range(tstamp)
    }

    pub fn mode(&self) -> u32 {
        self.mode.load(Ordering::Relaxed)
    }

    pub fn set_mode_bits(&self, bits: u32) {
        self.mode.fetch_or(bits, Ordering::Relaxed);
    }

    pub fn clear_mode_bits(&self, bits: u32) {
        self.mode.fetch_and(!bits, Ordering::Relaxed);
    }

    pub fn is_read_only(&self) -> bool {
        self.mode() & MODE_WRITE == 0
    }

    pub fn is_archived(&self) -> bool {
        self.mode() & MODE_READ_WRITE == 0
    }

    pub fn is_compacted(&self) -> bool {
        self.mode() & MODE_COMPACTED != 0
    }

    pub fn is_rolled_up(&self) -> bool {
        self.mode() & MODE_ROLLED_UP != 0
    }

    pub fn last_access(&self) -> Timestamp {
        self.last_access.load(Ordering::Relaxed)
    }

    fn touch(&self) {
        self.last_access.store(current_time_secs(), Ordering::Relaxed);
    }

    /// Recomputes the READ/WRITE bits from the partition's age.
    pub fn mode_of(&self, settings: &Settings) -> u32 {
        let now = self.time_unit.now();
        let age_ticks = now - self.range.to;
        let age_secs = self.time_unit.to_secs(age_ticks.max(0));
        let sticky = self.mode() & (MODE_COMPACTED | MODE_ROLLED_UP | MODE_CRASHED);
        if age_secs >= settings.archive_threshold.as_secs() as i64 {
            sticky
        } else if age_secs >= settings.read_only_threshold.as_secs() as i64 {
            sticky | MODE_READ
        } else {
            sticky | MODE_READ_WRITE
        }
    }

    /// Metric ids that have data in this partition (from the directory
    /// listing, so it works on cold partitions too).
    pub fn metric_ids(&self) -> TsdbResult<Vec<MetricId>> {
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else { continue };
            if let Some(rest) = name.strip_prefix('m') {
                if let Ok(id) = rest.parse::<MetricId>() {
                    ids.push(id);
                }
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    /// Looks up the metric's file pairs without creating the directory.
    pub fn get_metric(&self, metric_id: MetricId) -> TsdbResult<Option<Arc<MetricFiles>>> {
        if let Some(metric) = self.metrics.read().get(&metric_id) {
            return Ok(Some(metric.clone()));
        }
        let dir = self.dir.join(metric_dir_name(metric_id));
        if !dir.exists() {
            return Ok(None);
        }
        Ok(Some(self.load_metric(metric_id, dir)?))
    }

    pub fn get_or_create_metric(&self, metric_id: MetricId) -> TsdbResult<Arc<MetricFiles>> {
        if let Some(metric) = self.metrics.read().get(&metric_id) {
            return Ok(metric.clone());
        }
        let dir = self.dir.join(metric_dir_name(metric_id));
        std::fs::create_dir_all(&dir)?;
        self.load_metric(metric_id, dir)
    }

    fn load_metric(&self, metric_id: MetricId, dir: PathBuf) -> TsdbResult<Arc<MetricFiles>> {
        let mut metrics = self.metrics.write();
        if let Some(metric) = metrics.get(&metric_id) {
            return Ok(metric.clone());
        }

        let read_only = self.is_read_only();
        let mut pairs = Vec::new();
        loop {
            let file_idx = pairs.len() as FileIndex;
            let header_path = dir.join(header_file_name(file_idx));
            if !header_path.exists() {
                break;
            }
            let header = HeaderFile::open_existing(&header_path, file_idx, read_only)?;
            let tsdb_header = header.get_tsdb_header()?;
            let data = DataFile::open_existing(
                &dir.join(data_file_name(file_idx)),
                file_idx,
                tsdb_header.page_size,
                tsdb_header.page_count,
                tsdb_header.page_index,
                read_only,
            )?;
            let version = tsdb_header.compressor_version();
            if tsdb_header.is_compacted() {
                self.set_mode_bits(MODE_COMPACTED);
            }
            pairs.push(Arc::new(FilePair { header, data, version }));
        }

        let metric = Arc::new(MetricFiles { dir, pairs: RwLock::new(pairs) });
        metrics.insert(metric_id, metric.clone());
        Ok(metric)
    }

    /// Appends a new file pair to the metric. Caller holds the append
    /// lock.
    fn new_pair(&self, metric: &MetricFiles) -> TsdbResult<(FileIndex, Arc<FilePair>)> {
        let mut pairs = metric.pairs.write();
        if pairs.len() >= INVALID_FILE_INDEX as usize {
            return Err(TsdbError::Full(pairs.len()));
        }
        let file_idx = pairs.len() as FileIndex;
        let header = HeaderFile::create(
            &metric.dir.join(header_file_name(file_idx)),
            file_idx,
            self.page_count,
            self.page_size,
            self.compressor,
            self.time_unit.is_millisecond(),
            &self.range,
        )?;
        let data = DataFile::create(
            &metric.dir.join(data_file_name(file_idx)),
            file_idx,
            self.page_size,
            self.page_count,
        )?;
        let pair = Arc::new(FilePair { header, data, version: self.compressor });
        pairs.push(pair.clone());
        debug!(dir = %metric.dir.display(), file_idx, "created file pair");
        Ok((file_idx, pair))
    }

    fn writable_pair(&self, metric: &MetricFiles) -> TsdbResult<(FileIndex, Arc<FilePair>)> {
        if let Some((file_idx, pair)) = metric.last_pair() {
            pair.header.ensure_open(false)?;
            pair.data.ensure_open(false)?;
            // a full data file is caught by append and retried on a new pair
            if !pair.header.is_full()? && !pair.data.is_full() {
                return Ok((file_idx, pair));
            }
        }
        self.new_pair(metric)
    }

    /// The write path: persists one in-memory page of `series` and links
    /// it into the chain. Returns the capacity the next in-memory page
    /// should be created with.
    ///
    /// The caller holds the series state lock; `slot` carries any
    /// previously assigned on-disk location and `link` the chain tail of
    /// this window.
    pub fn append_page(
        &self,
        series: &TimeSeries,
        page: &PageInMemory,
        slot: &mut Option<PersistedPage>,
        link: &mut WindowLink,
        is_ooo: bool,
    ) -> TsdbResult<usize> {
        let _guard = self.append_lock.lock();
        self.touch();

        // a reopened partition starts read-only; the first append upgrades
        // it (and its files, lazily) back to read-write
        self.set_mode_bits(MODE_READ_WRITE);
        self.index.ensure_open(false)?;

        let metric = self.get_or_create_metric(series.metric_id())?;
        if page.is_empty() {
            return Ok(self.page_size as usize);
        }
        debug_assert_eq!(page.tsdb_range, self.range);
        debug_assert_eq!(link.window_from, self.range.from);

        let pos = page.compressor.save();
        let mut bytes = vec![0u8; pos.size_in_bytes()];
        page.compressor.copy_to(&mut bytes);

        let rel_from = (page.first_tstamp() - self.range.from) as u32;
        let rel_to = (page.max_tstamp() - self.range.from) as u32;

        let next_capacity = match *slot {
            Some(persisted) => {
                // the page is already on disk and keeps filling in place
                let pair = metric.pair(persisted.file)?;
                pair.header.ensure_open(false)?;
                pair.data.ensure_open(false)?;
                pair.data.write_at(persisted.slot, &bytes)?;
                let mut header = pair.header.get_page_header(persisted.header)?;
                header.cursor = pos.offset;
                header.start = pos.start;
                header.tstamp_from = rel_from;
                header.tstamp_to = rel_to;
                header.set_full(page.is_full());
                pair.header.set_page_header(persisted.header, &header)?;
                self.update_bounds(&pair, page)?;

                if page.is_full() {
                    *slot = None;
                    pair.data.next_page_capacity()
                } else {
                    persisted.capacity as usize
                }
            }
            None => {
                let capacity = page.compressor.capacity().min(self.page_size as usize);
                let (file_idx, pair) = self.writable_pair(&metric)?;
                let (file_idx, pair, page_slot_on_disk) =
                    match pair.data.append(&bytes, capacity) {
                        Ok(s) => (file_idx, pair, s),
                        Err(TsdbError::Full(_)) => {
                            let (file_idx, pair) = self.new_pair(&metric)?;
                            let s = pair.data.append(&bytes, capacity)?;
                            (file_idx, pair, s)
                        }
                        Err(e) => return Err(e),
                    };

                let header_idx = pair.header.new_header_index()?;
                debug_assert_ne!(header_idx, crate::common::types::INVALID_HEADER_INDEX);

                let mut header = page.fill_header(capacity as u16);
                header.offset = page_slot_on_disk.offset;
                header.page_index = page_slot_on_disk.page_index;
                pair.header.set_page_header(header_idx, &header)?;
                self.update_bounds(&pair, page)?;

                // link only after the new page and header are in place
                match link.chain_tail {
                    None => self.index.set_indices(series.id(), file_idx, header_idx)?,
                    Some((prev_file, prev_header)) => {
                        let prev_pair = metric.pair(prev_file)?;
                        prev_pair.header.ensure_open(false)?;
                        prev_pair.header.update_next(prev_header, file_idx, header_idx)?;
                    }
                }
                if is_ooo {
                    self.index.set_out_of_order(series.id(), true)?;
                } else if !link.second_set && page.max_tstamp() >= self.range.middle() {
                    self.index.set_indices2(series.id(), file_idx, header_idx)?;
                    link.second_set = true;
                }
                link.chain_tail = Some((file_idx, header_idx));

                if page.is_full() {
                    *slot = None;
                } else {
                    *slot = Some(PersistedPage {
                        file: file_idx,
                        header: header_idx,
                        slot: page_slot_on_disk,
                        capacity: capacity as u16,
                    });
                }
                pair.data.next_page_capacity()
            }
        };

        Ok(next_capacity)
    }

    fn update_bounds(&self, pair: &FilePair, page: &PageInMemory) -> TsdbResult<()> {
        let first = page.first_tstamp() as u64;
        let last = page.max_tstamp() as u64;
        pair.header.update_tsdb_header(|h| {
            h.page_index = pair.data.next_page_index();
            if h.start_tstamp == self.range.from as u64 || first < h.start_tstamp {
                h.start_tstamp = first;
            }
            if h.end_tstamp == self.range.to as u64 || last > h.end_tstamp {
                h.end_tstamp = last;
            }
        })
    }

    /// The read path: walks the page chain of one series, decoding every
    /// page intersecting `query`. Pages in `exclude` are skipped (their
    /// contents are superseded by an in-memory buffer) but their chain
    /// links are still followed.
    pub fn query_for_data(
        &self,
        metric_id: MetricId,
        series_id: crate::common::types::TimeSeriesId,
        query: &TimeRange,
        exclude: &[(FileIndex, HeaderIndex)],
    ) -> TsdbResult<Vec<DataPointContainer>> {
        self.index.ensure_open(true)?;
        self.touch();

        let entry = self.index.get_entry(series_id)?;
        if !entry.has_first() {
            return Ok(Vec::new());
        }
        let Some(metric) = self.get_metric(metric_id)? else {
            return Ok(Vec::new());
        };
        let out_of_order = entry.is_out_of_order();

        let start = if !out_of_order && query.from >= self.range.middle() && entry.has_second() {
            (entry.file_index2, entry.header_index2)
        } else {
            (entry.file_index, entry.header_index)
        };

        let mut heap: MinMaxHeap<(FileIndex, HeaderIndex)> = MinMaxHeap::new();
        heap.push(start);
        let mut containers = Vec::new();
        // an acyclic chain can never outgrow the headers that exist
        let mut budget = metric.pair_count().max(1) * self.page_count as usize;

        while let Some((file_idx, header_idx)) = heap.pop_min() {
            if budget == 0 {
                return Err(TsdbError::Corrupted(format!(
                    "page chain of series {series_id} does not terminate"
                )));
            }
            budget -= 1;

            let pair = metric.pair(file_idx)?;
            pair.header.ensure_open(true)?;
            let header = pair.header.get_page_header(header_idx)?;
            if header.is_empty() {
                continue;
            }
            if header.has_next() {
                heap.push((header.next_file, header.next_header));
            }
            if exclude.contains(&(file_idx, header_idx)) {
                continue;
            }

            let page_from = self.range.from + header.tstamp_from as i64;
            let page_to = self.range.from + header.tstamp_to as i64;
            if page_from >= query.to && !out_of_order {
                // in-order chains only grow to the right
                break;
            }
            if page_to < query.from || page_from >= query.to {
                continue;
            }

            let version = if header.is_out_of_order() {
                CompressorVersion::V0
            } else {
                pair.version
            };
            let bytes = pair.data.read_page(
                PageSlot { page_index: header.page_index, offset: header.offset },
                header.position().size_in_bytes(),
            )?;
            let mut dps = Vec::new();
            uncompress_page(version, self.range.from, &bytes, header.position(), &mut dps)?;
            dps.retain(|dp| query.in_range(dp.timestamp));
            if !dps.is_empty() {
                containers.push(DataPointContainer {
                    dps,
                    out_of_order: header.is_out_of_order(),
                });
            }
        }

        Ok(containers)
    }

    /// Re-attaches a restarted series to its existing chain in this
    /// window: finds the chain tail, restores a non-full in-order tail
    /// page into memory, and recovers the in-order high-water mark.
    ///
    /// Returns the rebuilt link, the restored tail page with its slot
    /// (when there is one worth resuming), and the highest persisted
    /// in-order timestamp.
    pub fn attach_series(
        &self,
        series: &TimeSeries,
    ) -> TsdbResult<(WindowLink, Option<(PageInMemory, PersistedPage)>, Option<Timestamp>)> {
        self.index.ensure_open(true)?;
        let entry = self.index.get_entry(series.id())?;
        let mut link = WindowLink::new(self.range.from);
        link.second_set = entry.has_second();
        if !entry.has_first() {
            return Ok((link, None, None));
        }
        let Some(metric) = self.get_metric(series.metric_id())? else {
            return Ok((link, None, None));
        };

        let mut cursor = (entry.file_index, entry.header_index);
        let mut last_in_order: Option<(FileIndex, HeaderIndex, crate::storage::page::PageHeader)> =
            None;
        let mut budget = metric.pair_count().max(1) * self.page_count as usize;
        loop {
            if budget == 0 {
                return Err(TsdbError::Corrupted(format!(
                    "page chain of series {} does not terminate",
                    series.id()
                )));
            }
            budget -= 1;
            let pair = metric.pair(cursor.0)?;
            pair.header.ensure_open(true)?;
            let header = pair.header.get_page_header(cursor.1)?;
            if !header.is_out_of_order() {
                last_in_order = Some((cursor.0, cursor.1, header));
            }
            link.chain_tail = Some(cursor);
            if !header.has_next() {
                break;
            }
            cursor = (header.next_file, header.next_header);
        }

        let mut restored_page = None;
        let mut last_tstamp = None;
        if let Some((file_idx, header_idx, header)) = last_in_order {
            last_tstamp = Some(self.range.from + header.tstamp_to as i64);
            if !header.is_full() && !self.is_read_only() {
                let pair = metric.pair(file_idx)?;
                let bytes = pair.data.read_page(
                    PageSlot { page_index: header.page_index, offset: header.offset },
                    header.position().size_in_bytes(),
                )?;
                match PageInMemory::restore(
                    self.range,
                    pair.version,
                    header.size as usize,
                    header.position(),
                    &bytes,
                ) {
                    Ok((page, _restored)) => {
                        restored_page = Some((
                            page,
                            PersistedPage {
                                file: file_idx,
                                header: header_idx,
                                slot: PageSlot {
                                    page_index: header.page_index,
                                    offset: header.offset,
                                },
                                capacity: header.size,
                            },
                        ));
                    }
                    Err(e) => {
                        warn!(series = series.id(), error = %e, "tail page restore failed");
                        self.set_mode_bits(MODE_CRASHED);
                    }
                }
            }
        }
        Ok((link, restored_page, last_tstamp))
    }

    /// Number of data points a given on-disk page holds right now; used
    /// by WAL replay to skip the already persisted prefix of a snapshot.
    pub fn persisted_dp_count(
        &self,
        metric_id: MetricId,
        file_idx: FileIndex,
        header_idx: HeaderIndex,
    ) -> TsdbResult<usize> {
        let Some(metric) = self.get_metric(metric_id)? else {
            return Ok(0);
        };
        let pair = metric.pair(file_idx)?;
        pair.header.ensure_open(true)?;
        let header = pair.header.get_page_header(header_idx)?;
        if header.is_empty() {
            return Ok(0);
        }
        let version = if header.is_out_of_order() { CompressorVersion::V0 } else { pair.version };
        let bytes = pair.data.read_page(
            PageSlot { page_index: header.page_index, offset: header.offset },
            header.position().size_in_bytes(),
        )?;
        let mut dps = Vec::new();
        uncompress_page(version, self.range.from, &bytes, header.position(), &mut dps)?;
        Ok(dps.len())
    }

    pub fn flush(&self, sync: bool) -> TsdbResult<()> {
        let metrics: Vec<Arc<MetricFiles>> = self.metrics.read().values().cloned().collect();
        for metric in metrics {
            for pair in metric.pairs.read().iter() {
                if pair.header.is_open() {
                    pair.header.flush(sync)?;
                }
                if pair.data.is_open() {
                    pair.data.flush(sync)?;
                }
            }
        }
        self.index.flush(sync)?;
        Ok(())
    }

    /// Closes every open file; the partition stays queryable through
    /// lazy re-open.
    pub fn close_files(&self) -> TsdbResult<()> {
        let metrics: Vec<Arc<MetricFiles>> = self.metrics.read().values().cloned().collect();
        for metric in metrics {
            for pair in metric.pairs.read().iter() {
                pair.header.close()?;
                pair.data.close()?;
            }
        }
        self.index.close()?;
        Ok(())
    }

    /// Closes data files untouched since `idle_threshold_secs` ago.
    pub fn close_idle_files(&self, idle_threshold_secs: i64) -> TsdbResult<usize> {
        let now = current_time_secs();
        let mut closed = 0;
        let metrics: Vec<Arc<MetricFiles>> = self.metrics.read().values().cloned().collect();
        for metric in metrics {
            for pair in metric.pairs.read().iter() {
                if !pair.data.is_open() {
                    continue;
                }
                let last = pair.data.last_read().max(pair.data.last_write());
                if now - last >= idle_threshold_secs {
                    pair.data.flush(true)?;
                    pair.data.close()?;
                    pair.header.flush(true)?;
                    pair.header.close()?;
                    closed += 1;
                }
            }
        }
        Ok(closed)
    }

    /// Truncates every data file to its used pages and records the new
    /// actual page counts. Only safe once the allocation is final.
    pub fn shrink_to_fit(&self) -> TsdbResult<()> {
        let metrics: Vec<Arc<MetricFiles>> = self.metrics.read().values().cloned().collect();
        for metric in metrics {
            for pair in metric.pairs.read().iter() {
                let used = pair.data.shrink_to_fit()?;
                pair.header.update_tsdb_header(|h| h.actual_page_count = used)?;
            }
        }
        Ok(())
    }

    /// Marks every header file compacted and flips the mode bit.
    pub fn mark_compacted(&self) -> TsdbResult<()> {
        let metrics: Vec<Arc<MetricFiles>> = self.metrics.read().values().cloned().collect();
        for metric in metrics {
            for pair in metric.pairs.read().iter() {
                pair.header.ensure_open(false)?;
                pair.header.update_tsdb_header(|h| h.set_compacted(true))?;
            }
        }
        self.set_mode_bits(MODE_COMPACTED);
        Ok(())
    }
}

impl std::fmt::Debug for Tsdb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tsdb")
            .field("range", &self.range)
            .field("dir", &self.dir)
            .field("mode", &self.mode.load(Ordering::Relaxed))
            .finish()
    }
}
