//! The process-wide database handle: partition registry, metric and
//! series registries, the ingest entry points, crash recovery, and the
//! periodic maintenance hooks the external scheduler drives.
//!
//! What the original kept in global singletons lives here as one owned
//! context object; initialization is explicit in `open` and teardown in
//! `shutdown`, in reverse dependency order.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::common::time::{TimeRange, Timestamp, INVALID_TIMESTAMP};
use crate::common::types::{canonical_tags, MetricId, Tag, TagList};
use crate::compress::{uncompress_page, CompressorVersion};
use crate::config::Settings;
use crate::error::{TsdbError, TsdbResult};
use crate::series::{Mapping, SeriesRegistry, SeriesState, TimeSeries};
use crate::storage::meta_file::{MetaFile, MetaRecord};
use crate::storage::page::PageInMemory;
use crate::storage::wal::{AppendLog, WalRecord};
use crate::tsdb::{Tsdb, MODE_READ, MODE_READ_WRITE, MODE_WRITE};

/// Cooperative shutdown request levels: `Asap` drains, `Now` discards.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum ShutdownMode {
    None = 0,
    Asap = 1,
    Now = 2,
}

/// In-process counters, exposed for the stats surface.
#[derive(Debug, Default)]
pub struct Stats {
    pub data_points: AtomicU64,
    pub failed: AtomicU64,
    pub pages_flushed: AtomicU64,
    pub wal_replayed: AtomicU64,
    pub wal_duplicates: AtomicU64,
}

/// Result of a batch put: per-point failures never abort the batch.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, serde::Serialize)]
pub struct BatchResult {
    pub success: usize,
    pub failed: usize,
}

pub struct Database {
    settings: Settings,
    meta: MetaFile,
    wal: AppendLog,
    /// sorted by range start
    partitions: RwLock<Vec<Arc<Tsdb>>>,
    mappings: RwLock<AHashMap<String, Arc<Mapping>>>,
    registry: SeriesRegistry,
    next_metric_id: AtomicU32,
    next_series_id: AtomicU32,
    shutdown: AtomicU8,
    stats: Stats,
}

impl Database {
    /// Opens (or initializes) the data directory: replays the meta file,
    /// discovers existing partitions, then replays the append log.
    pub fn open(settings: Settings) -> TsdbResult<Self> {
        settings.validate()?;
        std::fs::create_dir_all(&settings.data_dir)?;

        let meta = MetaFile::open(&settings.data_dir)?;
        let wal = AppendLog::open(&settings.data_dir)?;

        let db = Database {
            meta,
            wal,
            partitions: RwLock::new(Vec::new()),
            mappings: RwLock::new(AHashMap::new()),
            registry: SeriesRegistry::default(),
            next_metric_id: AtomicU32::new(0),
            next_series_id: AtomicU32::new(0),
            shutdown: AtomicU8::new(ShutdownMode::None as u8),
            stats: Stats::default(),
            settings,
        };

        db.restore_meta()?;
        db.discover_partitions()?;
        if AppendLog::restore_needed(&db.settings.data_dir) {
            db.replay_wal()?;
        }
        db.wal.begin_new()?;
        info!(
            metrics = db.mappings.read().len(),
            series = db.registry.len(),
            partitions = db.partitions.read().len(),
            "database open"
        );
        Ok(db)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn registry(&self) -> &SeriesRegistry {
        &self.registry
    }

    pub fn series_count(&self) -> usize {
        self.registry.len()
    }

    pub fn metrics_count(&self) -> usize {
        self.mappings.read().len()
    }

    // ---- shutdown flag ----------------------------------------------

    pub fn request_shutdown(&self, mode: ShutdownMode) {
        self.shutdown.store(mode as u8, Ordering::SeqCst);
    }

    pub fn shutdown_requested(&self) -> ShutdownMode {
        match self.shutdown.load(Ordering::SeqCst) {
            1 => ShutdownMode::Asap,
            2 => ShutdownMode::Now,
            _ => ShutdownMode::None,
        }
    }

    fn check_cancelled(&self) -> TsdbResult<()> {
        if self.shutdown_requested() == ShutdownMode::Now {
            return Err(TsdbError::Cancelled);
        }
        Ok(())
    }

    // ---- startup restore --------------------------------------------

    fn restore_meta(&self) -> TsdbResult<()> {
        MetaFile::replay(&self.settings.data_dir, |record| match record {
            MetaRecord::Metric { id, name } => {
                let mut mappings = self.mappings.write();
                if mappings.contains_key(&name) {
                    return Err(TsdbError::Corrupted(format!(
                        "duplicate metric {name} in meta file"
                    )));
                }
                mappings.insert(name.clone(), Arc::new(Mapping::new(name, id)));
                self.next_metric_id.fetch_max(id + 1, Ordering::Relaxed);
                Ok(())
            }
            MetaRecord::TimeSeries { metric, tags, id } => {
                let mapping = self.mapping_for_restore(&metric)?;
                let tag_list = crate::common::types::parse_canonical_tags(&tags)?;
                let ts = Arc::new(TimeSeries::new(id, mapping.metric_id(), tag_list));
                self.registry.register(ts.clone());
                self.next_series_id.fetch_max(id + 1, Ordering::Relaxed);
                mapping.restore_series(tags, ts)
            }
            MetaRecord::Measurement { metric, tags, fields } => {
                let mapping = self.mapping_for_restore(&metric)?;
                let tag_list = crate::common::types::parse_canonical_tags(&tags)?;
                let mut restored = Vec::with_capacity(fields.len());
                for (field, id) in fields {
                    let ts = Arc::new(TimeSeries::new(id, mapping.metric_id(), tag_list.clone()));
                    self.registry.register(ts.clone());
                    self.next_series_id.fetch_max(id + 1, Ordering::Relaxed);
                    restored.push((field, ts));
                }
                mapping.restore_measurement(tags, restored)
            }
        })?;
        Ok(())
    }

    fn mapping_for_restore(&self, metric: &str) -> TsdbResult<Arc<Mapping>> {
        self.mappings.read().get(metric).cloned().ok_or_else(|| {
            TsdbError::Corrupted(format!(
                "meta file references metric {metric} before its metric record"
            ))
        })
    }

    fn discover_partitions(&self) -> TsdbResult<()> {
        let root = &self.settings.data_dir;
        let mut partitions = Vec::new();
        for year in read_dirs(root)? {
            for month in read_dirs(&year)? {
                for partition in read_dirs(&month)? {
                    let Some(name) = partition.file_name().and_then(|n| n.to_str()) else {
                        continue;
                    };
                    if !name.contains('.') {
                        continue;
                    }
                    let mut partition = partition.clone();
                    if name.ends_with(".temp") {
                        // an incomplete compaction copy; the original still
                        // holds the data
                        warn!(dir = %partition.display(), "removing unfinished compaction copy");
                        std::fs::remove_dir_all(&partition)?;
                        continue;
                    }
                    if let Some(base) = name.strip_suffix(".back") {
                        let original = partition.with_file_name(base);
                        if original.exists() {
                            // the swap completed before the crash
                            warn!(dir = %partition.display(), "removing stale compaction backup");
                            std::fs::remove_dir_all(&partition)?;
                            continue;
                        }
                        // crashed between the two renames; the backup is the
                        // only copy, put it back
                        warn!(dir = %partition.display(), "restoring partition from compaction backup");
                        std::fs::rename(&partition, &original)?;
                        partition = original;
                    }
                    match Tsdb::open_existing(&partition, &self.settings) {
                        Ok(tsdb) => partitions.push(Arc::new(tsdb)),
                        Err(e) if e.is_fatal() => return Err(e),
                        Err(e) => {
                            warn!(dir = %partition.display(), error = %e, "skipping unreadable partition")
                        }
                    }
                }
            }
        }
        partitions.sort_by_key(|t| t.range().from);
        *self.partitions.write() = partitions;
        Ok(())
    }

    // ---- partitions -------------------------------------------------

    fn window_of(&self, tstamp: Timestamp) -> TimeRange {
        TimeRange::round_to(tstamp, self.settings.rotation_ticks())
    }

    /// The partition containing `tstamp`, creating it when asked.
    pub fn inst(&self, tstamp: Timestamp, create: bool) -> TsdbResult<Option<Arc<Tsdb>>> {
        {
            let partitions = self.partitions.read();
            if let Some(tsdb) = find_partition(&partitions, tstamp) {
                return Ok(Some(tsdb));
            }
        }
        if !create {
            return Ok(None);
        }
        let mut partitions = self.partitions.write();
        if let Some(tsdb) = find_partition(&partitions, tstamp) {
            return Ok(Some(tsdb));
        }
        let range = self.window_of(tstamp);
        let tsdb = Arc::new(Tsdb::create(&self.settings.data_dir, range, &self.settings)?);
        let at = partitions.partition_point(|t| t.range().from < range.from);
        partitions.insert(at, tsdb.clone());
        Ok(Some(tsdb))
    }

    /// Every partition overlapping `range`, oldest first.
    pub fn insts(&self, range: &TimeRange) -> Vec<Arc<Tsdb>> {
        self.partitions
            .read()
            .iter()
            .filter(|t| t.range().intersects(range))
            .cloned()
            .collect()
    }

    pub fn partitions(&self) -> Vec<Arc<Tsdb>> {
        self.partitions.read().clone()
    }

    /// Every registered series under one metric id, ordered by series id.
    pub(crate) fn series_for_metric(&self, metric_id: MetricId) -> Vec<Arc<TimeSeries>> {
        let mut series: Vec<Arc<TimeSeries>> = self
            .registry
            .all()
            .into_iter()
            .filter(|s| s.metric_id() == metric_id)
            .collect();
        series.sort_by_key(|s| s.id());
        series
    }

    /// Persists and detaches every buffer bound to the window starting at
    /// `window_from`, and drops cached chain links into it. Compaction
    /// and rollup call this so the partition's files become the single
    /// source of truth before they are scanned (or swapped out).
    pub(crate) fn flush_window_buffers(&self, window_from: Timestamp) -> TsdbResult<()> {
        for series in self.registry.all() {
            let mut state = series.state();
            if state
                .page
                .as_ref()
                .is_some_and(|p| p.tsdb_range.from == window_from)
            {
                self.flush_page(&series, &mut state, false, false)?;
                state.page = None;
                state.page_slot = None;
            }
            if state
                .ooo_page
                .as_ref()
                .is_some_and(|p| p.tsdb_range.from == window_from)
            {
                self.flush_page(&series, &mut state, true, false)?;
                state.ooo_page = None;
                state.ooo_slot = None;
            }
            state.links.retain(|l| l.window_from != window_from);
        }
        Ok(())
    }

    /// Swaps a partition instance after compaction rebuilt its directory.
    pub(crate) fn replace_partition(&self, old: &Arc<Tsdb>, new: Arc<Tsdb>) {
        let mut partitions = self.partitions.write();
        if let Some(at) = partitions.iter().position(|t| Arc::ptr_eq(t, old)) {
            partitions[at] = new;
        }
    }

    fn partition_at(&self, window_from: Timestamp) -> TsdbResult<Arc<Tsdb>> {
        self.partitions
            .read()
            .iter()
            .find(|t| t.range().from == window_from)
            .cloned()
            .ok_or_else(|| {
                TsdbError::Internal(format!("no partition starting at {window_from}"))
            })
    }

    // ---- registries -------------------------------------------------

    pub fn get_mapping(&self, metric: &str) -> Option<Arc<Mapping>> {
        self.mappings.read().get(metric).cloned()
    }

    pub fn get_or_add_mapping(&self, metric: &str) -> TsdbResult<Arc<Mapping>> {
        if let Some(mapping) = self.mappings.read().get(metric) {
            return Ok(mapping.clone());
        }
        let mut mappings = self.mappings.write();
        if let Some(mapping) = mappings.get(metric) {
            return Ok(mapping.clone());
        }
        let id = self.next_metric_id.fetch_add(1, Ordering::SeqCst);
        self.meta.add_metric(id, metric)?;
        let mapping = Arc::new(Mapping::new(metric, id));
        mappings.insert(metric.to_string(), mapping.clone());
        Ok(mapping)
    }

    pub fn get_or_create_series(
        &self,
        metric: &str,
        tags: &[Tag],
    ) -> TsdbResult<Arc<TimeSeries>> {
        let mapping = self.get_or_add_mapping(metric)?;
        let tag_list: TagList = tags.iter().cloned().collect();
        let canonical = canonical_tags(&tag_list);
        mapping.get_or_create_series(&canonical, &tag_list, || {
            let id = self.next_series_id.fetch_add(1, Ordering::SeqCst);
            self.meta.add_ts(metric, &canonical, id)?;
            let ts = Arc::new(TimeSeries::new(id, mapping.metric_id(), tag_list.clone()));
            self.registry.register(ts.clone());
            Ok(ts)
        })
    }

    // ---- ingest -----------------------------------------------------

    /// Ingests one point. Resolution of `tstamp` is canonicalized to the
    /// configured time unit.
    pub fn add_data_point(
        &self,
        metric: &str,
        tags: &[Tag],
        tstamp: Timestamp,
        value: f64,
    ) -> TsdbResult<()> {
        self.check_cancelled()?;
        let tstamp = self.validate_timestamp(tstamp)?;
        let series = self.get_or_create_series(metric, tags)?;
        self.insert(&series, tstamp, value)?;
        self.stats.data_points.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Batch ingest; bad points are counted, never abort the batch.
    pub fn add_batch(
        &self,
        points: impl IntoIterator<Item = (String, Vec<Tag>, Timestamp, f64)>,
    ) -> BatchResult {
        let mut result = BatchResult::default();
        for (metric, tags, tstamp, value) in points {
            match self.add_data_point(&metric, &tags, tstamp, value) {
                Ok(()) => result.success += 1,
                Err(e) => {
                    debug!(metric = %metric, error = %e, "dropping bad data point");
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    result.failed += 1;
                }
            }
        }
        result
    }

    /// Ingests one line-protocol family: every numeric field becomes its
    /// own series under the measurement's mapping.
    pub fn add_measurement(
        &self,
        measurement: &str,
        tags: &[Tag],
        fields: &[(&str, f64)],
        tstamp: Timestamp,
    ) -> TsdbResult<()> {
        self.check_cancelled()?;
        if fields.is_empty() {
            return Err(TsdbError::BadRequest("measurement without fields".into()));
        }
        let tstamp = self.validate_timestamp(tstamp)?;
        let mapping = self.get_or_add_mapping(measurement)?;
        let tag_list: TagList = tags.iter().cloned().collect();
        let canonical = canonical_tags(&tag_list);
        let family = mapping.get_or_create_measurement(&canonical, &tag_list, || {
            let mut created = Vec::with_capacity(fields.len());
            for (field, _) in fields {
                let id = self.next_series_id.fetch_add(1, Ordering::SeqCst);
                let ts = Arc::new(TimeSeries::new(id, mapping.metric_id(), tag_list.clone()));
                self.registry.register(ts.clone());
                created.push((field.to_string(), ts));
            }
            self.meta.add_measurement(
                measurement,
                &canonical,
                &created.iter().map(|(f, ts)| (f.clone(), ts.id())).collect::<Vec<_>>(),
            )?;
            Ok(created)
        })?;

        for (field, value) in fields {
            let Some(ts) = family.get_field(field) else {
                // the family's field set was fixed on first write
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                continue;
            };
            self.insert(ts, tstamp, *value)?;
            self.stats.data_points.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn validate_timestamp(&self, tstamp: Timestamp) -> TsdbResult<Timestamp> {
        if tstamp < 0 {
            return Err(TsdbError::InvalidTimestamp(tstamp.to_string()));
        }
        let tstamp = self.settings.time_unit.canonicalize(tstamp);
        let retention = self.settings.retention_threshold.as_secs() as i64;
        if retention > 0 {
            let floor = self.settings.time_unit.now() - self.settings.time_unit.ticks_per(retention);
            if tstamp < floor {
                return Err(TsdbError::SampleTooOld);
            }
        }
        Ok(tstamp)
    }

    /// Routes one point into the series' buffers, flushing full pages.
    fn insert(&self, series: &Arc<TimeSeries>, tstamp: Timestamp, value: f64) -> TsdbResult<()> {
        let mut state = series.state();
        let window = self.window_of(tstamp);

        let in_order = state.last_tstamp == INVALID_TIMESTAMP || tstamp >= state.last_tstamp;
        if in_order {
            self.ensure_in_order_window(series, &mut state, &window)?;
            // attaching may have recovered a higher persisted watermark
            if state.last_tstamp != INVALID_TIMESTAMP && tstamp < state.last_tstamp {
                return self.insert_ooo(series, &mut state, &window, tstamp, value);
            }
            loop {
                let page = state.page.as_mut().expect("in-order page ensured");
                if page.add_data_point(tstamp, value) {
                    break;
                }
                self.flush_page(series, &mut state, false, true)?;
            }
            state.last_tstamp = tstamp;
            Ok(())
        } else {
            self.insert_ooo(series, &mut state, &window, tstamp, value)
        }
    }

    fn insert_ooo(
        &self,
        series: &Arc<TimeSeries>,
        state: &mut SeriesState,
        window: &TimeRange,
        tstamp: Timestamp,
        value: f64,
    ) -> TsdbResult<()> {
        let needs_switch = state.ooo_page.as_ref().map_or(true, |p| p.tsdb_range != *window);
        if needs_switch {
            if state.ooo_page.as_ref().is_some_and(|p| !p.is_empty()) {
                self.flush_page(series, state, true, false)?;
            }
            state.ooo_page = None;
            state.ooo_slot = None;

            let tsdb = self.inst(tstamp, true)?.expect("created partition");
            self.ensure_link(series, state, &tsdb, false)?;
            state.ooo_page = Some(PageInMemory::new(
                *window,
                CompressorVersion::V0,
                tsdb.page_size() as usize,
                true,
            ));
        }
        loop {
            let page = state.ooo_page.as_mut().expect("ooo page ensured");
            if page.add_data_point(tstamp, value) {
                break;
            }
            self.flush_page(series, state, true, true)?;
        }
        Ok(())
    }

    /// Makes sure the in-order buffer targets `window`, flushing any page
    /// bound to a previous window first.
    fn ensure_in_order_window(
        &self,
        series: &Arc<TimeSeries>,
        state: &mut SeriesState,
        window: &TimeRange,
    ) -> TsdbResult<()> {
        if state.page.as_ref().is_some_and(|p| p.tsdb_range == *window) {
            return Ok(());
        }
        if state.page.as_ref().is_some_and(|p| !p.is_empty()) {
            self.flush_page(series, state, false, false)?;
        }
        state.page = None;
        state.page_slot = None;

        let tsdb = self.inst(window.from, true)?.expect("created partition");
        self.ensure_link(series, state, &tsdb, true)?;
        if state.page.is_none() {
            state.page = Some(PageInMemory::new(
                *window,
                tsdb.compressor_version(),
                tsdb.page_size() as usize,
                false,
            ));
        }
        Ok(())
    }

    /// Ensures chain bookkeeping for the partition's window exists in
    /// `state`, walking the on-disk chain on first touch. When
    /// `adopt_tail` is set, a restorable non-full tail page becomes the
    /// in-order buffer.
    fn ensure_link(
        &self,
        series: &Arc<TimeSeries>,
        state: &mut SeriesState,
        tsdb: &Arc<Tsdb>,
        adopt_tail: bool,
    ) -> TsdbResult<()> {
        let window_from = tsdb.range().from;
        if state.link_for(window_from).is_some() {
            return Ok(());
        }
        let (link, restored, last_persisted) = tsdb.attach_series(series)?;
        if let Some(last) = last_persisted {
            if state.last_tstamp == INVALID_TIMESTAMP || last > state.last_tstamp {
                state.last_tstamp = last;
            }
        }
        if adopt_tail && state.page.is_none() {
            if let Some((page, slot)) = restored {
                state.page = Some(page);
                state.page_slot = Some(slot);
            }
        }
        state.put_link(link);
        Ok(())
    }

    /// Persists one of the two buffers to its partition. `reinit` keeps
    /// the buffer alive for the same window with the returned capacity;
    /// otherwise the buffer is left as-is for the caller to retire.
    fn flush_page(
        &self,
        series: &Arc<TimeSeries>,
        state: &mut SeriesState,
        is_ooo: bool,
        reinit: bool,
    ) -> TsdbResult<()> {
        let SeriesState { page, ooo_page, page_slot, ooo_slot, links, .. } = state;
        let (buffer, slot) = if is_ooo { (ooo_page, ooo_slot) } else { (page, page_slot) };
        let Some(buffer) = buffer.as_mut() else {
            return Ok(());
        };
        if buffer.is_empty() {
            return Ok(());
        }
        let window_from = buffer.tsdb_range.from;
        let tsdb = self.partition_at(window_from)?;
        let link = links
            .iter_mut()
            .find(|l| l.window_from == window_from)
            .ok_or_else(|| {
                TsdbError::Internal(format!("missing chain link for window {window_from}"))
            })?;
        let next_capacity = tsdb.append_page(series, buffer, slot, link, is_ooo)?;
        self.stats.pages_flushed.fetch_add(1, Ordering::Relaxed);
        if reinit && buffer.is_full() {
            debug_assert!(slot.is_none());
            buffer.reinit(buffer.tsdb_range, next_capacity);
        }
        Ok(())
    }

    // ---- WAL --------------------------------------------------------

    /// Snapshots every non-empty in-memory page into a fresh append log.
    /// Scheduled at `append.log.flush.frequency`.
    pub fn wal_flush(&self) -> TsdbResult<()> {
        self.wal.begin_new()?;
        for series in self.registry.all() {
            let state = series.state();
            for (buffer, slot, is_ooo) in [
                (&state.page, &state.page_slot, false),
                (&state.ooo_page, &state.ooo_slot, true),
            ] {
                let Some(page) = buffer else { continue };
                if page.is_empty() {
                    continue;
                }
                let pos = page.compressor.save();
                let mut bytes = vec![0u8; pos.size_in_bytes()];
                page.compressor.copy_to(&mut bytes);
                let record = WalRecord {
                    metric_id: series.metric_id(),
                    series_id: series.id(),
                    version: page.compressor.version(),
                    window_start: page.tsdb_range.from,
                    is_ooo,
                    slot_file: slot
                        .as_ref()
                        .map_or(crate::common::types::INVALID_FILE_INDEX, |s| s.file),
                    slot_header: slot
                        .as_ref()
                        .map_or(crate::common::types::INVALID_HEADER_INDEX, |s| s.header),
                    position: pos,
                    bytes,
                };
                self.wal.append(&record)?;
            }
        }
        Ok(())
    }

    /// Scheduled at `append.log.rotation.frequency`.
    pub fn wal_rotate(&self) -> TsdbResult<()> {
        self.wal.rotate(self.settings.wal_retention_count)
    }

    /// Replays surviving append logs through the normal ingest path. The
    /// prefix of a snapshot that already reached a data file is skipped
    /// and counted as duplicates.
    fn replay_wal(&self) -> TsdbResult<()> {
        let mut replayed = 0u64;
        let mut duplicates = 0u64;
        AppendLog::replay(&self.settings.data_dir, |record| {
            let Some(series) = self.registry.get(record.series_id) else {
                warn!(series = record.series_id, "append log names an unknown series");
                return Ok(());
            };
            let mut dps = Vec::new();
            if let Err(e) = uncompress_page(
                record.version,
                record.window_start,
                &record.bytes,
                record.position,
                &mut dps,
            ) {
                warn!(series = record.series_id, error = %e, "undecodable append log record");
                return Ok(());
            }

            let mut skip = 0usize;
            if record.slot_file != crate::common::types::INVALID_FILE_INDEX {
                if let Some(tsdb) = self.inst(record.window_start, false)? {
                    skip = tsdb
                        .persisted_dp_count(series.metric_id(), record.slot_file, record.slot_header)
                        .unwrap_or(0);
                }
            } else if !record.is_ooo {
                // the page may have been flushed after the snapshot; skip
                // everything at or below the persisted high-water mark
                let persisted = {
                    let mut state = series.state();
                    if let Some(tsdb) = self.inst(record.window_start, false)? {
                        self.ensure_link(&series, &mut state, &tsdb, true)?;
                    }
                    state.last_tstamp
                };
                if persisted != INVALID_TIMESTAMP {
                    skip = dps.partition_point(|dp| dp.timestamp <= persisted);
                }
            }

            duplicates += skip as u64;
            for dp in &dps[skip.min(dps.len())..] {
                match self.insert(&series, dp.timestamp, dp.value) {
                    Ok(()) => replayed += 1,
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        warn!(series = record.series_id, error = %e, "dropping replayed point");
                        self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            Ok(())
        })?;
        self.stats.wal_replayed.store(replayed, Ordering::Relaxed);
        self.stats.wal_duplicates.store(duplicates, Ordering::Relaxed);
        if replayed > 0 || duplicates > 0 {
            info!(replayed, duplicates, "append log recovery complete");
        }
        Ok(())
    }

    // ---- scheduled maintenance --------------------------------------

    /// Persists every dirty buffer and msyncs all files. `sync` is used
    /// at rotation boundaries.
    pub fn flush(&self, sync: bool) -> TsdbResult<()> {
        for series in self.registry.all() {
            let mut state = series.state();
            if state.page.as_ref().is_some_and(|p| !p.is_empty()) {
                self.flush_page(&series, &mut state, false, true)?;
            }
            if state.ooo_page.as_ref().is_some_and(|p| !p.is_empty()) {
                self.flush_page(&series, &mut state, true, true)?;
            }
        }
        for tsdb in self.partitions() {
            tsdb.flush(sync)?;
        }
        self.meta.flush(sync)?;
        Ok(())
    }

    /// Rotation: flush synchronously, recompute partition modes, close
    /// files of archived partitions and idle data files.
    pub fn rotate(&self) -> TsdbResult<()> {
        self.flush(true)?;
        let thrashing = self.settings.thrashing_threshold.as_secs() as i64;
        for tsdb in self.partitions() {
            let mode = tsdb.mode_of(&self.settings);
            if mode & MODE_READ_WRITE == 0 {
                tsdb.clear_mode_bits(MODE_READ | MODE_WRITE);
                tsdb.close_files()?;
                debug!(?tsdb, "archived partition");
            } else if mode & MODE_WRITE == 0 {
                tsdb.clear_mode_bits(MODE_WRITE);
                tsdb.close_idle_files(thrashing)?;
            } else {
                tsdb.close_idle_files(thrashing)?;
            }
        }
        Ok(())
    }

    /// Deletes partitions older than the retention threshold. Returns the
    /// number purged.
    pub fn apply_retention(&self) -> TsdbResult<usize> {
        let retention = self.settings.retention_threshold.as_secs() as i64;
        if retention <= 0 {
            return Ok(0);
        }
        let cutoff = self.settings.time_unit.now() - self.settings.time_unit.ticks_per(retention);
        let purged: Vec<Arc<Tsdb>> = {
            let mut partitions = self.partitions.write();
            let (old, keep): (Vec<_>, Vec<_>) =
                partitions.drain(..).partition(|t| t.range().to <= cutoff);
            *partitions = keep;
            old
        };
        for tsdb in &purged {
            tsdb.close_files()?;
            std::fs::remove_dir_all(tsdb.dir())?;
            info!(?tsdb, "purged partition past retention");
        }
        Ok(purged.len())
    }

    /// Clean shutdown: drain buffers to disk, sync everything, and drop
    /// the append logs (nothing is left to replay).
    pub fn shutdown(&self) -> TsdbResult<()> {
        self.request_shutdown(ShutdownMode::Asap);
        self.flush(true)?;
        for tsdb in self.partitions() {
            tsdb.close_files()?;
        }
        self.meta.flush(true)?;
        self.wal.remove_all()?;
        info!("database shut down");
        Ok(())
    }
}

fn read_dirs(path: &std::path::Path) -> TsdbResult<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    if !path.exists() {
        return Ok(dirs);
    }
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn find_partition(partitions: &[Arc<Tsdb>], tstamp: Timestamp) -> Option<Arc<Tsdb>> {
    let at = partitions.partition_point(|t| t.range().to <= tstamp);
    partitions
        .get(at)
        .filter(|t| t.in_range(tstamp))
        .cloned()
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("data_dir", &self.settings.data_dir)
            .field("partitions", &self.partitions.read().len())
            .field("series", &self.registry.len())
            .finish()
    }
}

/// Exposes the compaction and rollup hooks implemented in their own
/// modules; kept here so the scheduler sees one surface.
impl Database {
    /// Compacts eligible read-only partitions when inside the configured
    /// off-hours window. Returns the number compacted.
    pub fn compact(&self) -> TsdbResult<usize> {
        crate::storage::compact::compact_eligible(self)
    }

    /// Builds hourly rollups for partitions older than the rollup
    /// threshold. Returns the number of partitions rolled up.
    pub fn rollup(&self) -> TsdbResult<usize> {
        crate::tsdb::rollup::rollup_eligible(self)
    }
}
