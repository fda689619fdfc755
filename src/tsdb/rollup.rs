//! Hourly rollups: per-series `(cnt, min, max, sum)` buckets built for
//! partitions past the rollup threshold, stored per metric directory as
//! `rollup.header` + `rollup.data` (built through `rollup.header.tmp`).
//!
//! A rollup is only trusted for a series whose out-of-order index bit is
//! clear; queries fall back to raw pages otherwise.

use std::fs::{self, File};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use crate::common::time::Timestamp;
use crate::common::types::{MetricId, RollupIndex, TimeSeriesId, INVALID_ROLLUP_INDEX};
use crate::compress::rollup::{uncompress_rollup, RollupCompressor, RollupEntry};
use crate::error::{TsdbError, TsdbResult};
use crate::tsdb::database::{Database, ShutdownMode};
use crate::tsdb::{Tsdb, MODE_ROLLED_UP};

const ROLLUP_HEADER: &str = "rollup.header";
const ROLLUP_HEADER_TMP: &str = "rollup.header.tmp";
const ROLLUP_DATA: &str = "rollup.data";
const HEADER_ENTRY_SIZE: u64 = 12;

fn metric_dir(tsdb: &Tsdb, metric_id: MetricId) -> PathBuf {
    tsdb.dir().join(format!("m{metric_id:010}"))
}

/// Rolls up every eligible partition. Returns how many were processed.
pub fn rollup_eligible(db: &Database) -> TsdbResult<usize> {
    let settings = db.settings();
    let threshold = settings.rollup_threshold.as_secs() as i64;
    let cutoff = settings.time_unit.now() - settings.time_unit.ticks_per(threshold);

    let mut count = 0;
    for tsdb in db.partitions() {
        if db.shutdown_requested() != ShutdownMode::None {
            break;
        }
        if tsdb.range().to > cutoff {
            continue;
        }
        if tsdb.is_rolled_up() || is_rolled_up_on_disk(&tsdb)? {
            tsdb.set_mode_bits(MODE_ROLLED_UP);
            continue;
        }
        rollup_tsdb(db, &tsdb)?;
        count += 1;
    }
    Ok(count)
}

/// Whether rollup files already exist from a previous process life.
fn is_rolled_up_on_disk(tsdb: &Tsdb) -> TsdbResult<bool> {
    for mid in tsdb.metric_ids()? {
        if metric_dir(tsdb, mid).join(ROLLUP_HEADER).exists() {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Builds hourly rollups for one partition by scanning every series'
/// pages in chain order.
pub fn rollup_tsdb(db: &Database, tsdb: &Arc<Tsdb>) -> TsdbResult<()> {
    let unit = db.settings().time_unit;
    let bucket_ticks = unit.ticks_per(3600);
    let precision = db.settings().rollup_precision;
    let range = *tsdb.range();
    let duration = range.duration();
    let bucket_count = ((duration + bucket_ticks - 1) / bucket_ticks) as usize;

    db.flush_window_buffers(range.from)?;
    tsdb.index().ensure_open(false)?;

    for mid in tsdb.metric_ids()? {
        let dir = metric_dir(tsdb, mid);
        let tmp_path = dir.join(ROLLUP_HEADER_TMP);
        let data_path = dir.join(ROLLUP_DATA);
        let mut header_out = BufWriter::new(File::create(&tmp_path)?);
        let mut data_out = BufWriter::new(File::create(&data_path)?);
        let mut data_offset: u32 = 0;
        let mut assignments: Vec<(TimeSeriesId, RollupIndex)> = Vec::new();

        for series in db.series_for_metric(mid) {
            let entry = tsdb.index().get_entry(series.id())?;
            if !entry.has_first() {
                continue;
            }
            if entry.is_out_of_order() {
                // raw pages stay authoritative for this series
                tsdb.index().set_rollup_out_of_order(series.id(), true)?;
                continue;
            }

            let containers = tsdb.query_for_data(mid, series.id(), &range, &[])?;
            let mut buckets: Vec<RollupEntry> =
                vec![RollupEntry { cnt: 0, min: 0.0, max: 0.0, sum: 0.0 }; bucket_count];
            let mut any = false;
            for container in &containers {
                for dp in &container.dps {
                    let at = ((dp.timestamp - range.from) / bucket_ticks) as usize;
                    let bucket = &mut buckets[at];
                    if bucket.cnt == 0 {
                        *bucket = RollupEntry { cnt: 1, min: dp.value, max: dp.value, sum: dp.value };
                    } else {
                        bucket.cnt += 1;
                        bucket.min = bucket.min.min(dp.value);
                        bucket.max = bucket.max.max(dp.value);
                        bucket.sum += dp.value;
                    }
                    any = true;
                }
            }
            if !any {
                continue;
            }

            let mut compressor = RollupCompressor::new(precision, bucket_count);
            for bucket in &buckets {
                if bucket.cnt == 0 {
                    compressor.append_empty();
                } else {
                    compressor.append(bucket);
                }
            }
            let blob = compressor.finish();

            header_out.write_all(&series.id().to_le_bytes())?;
            header_out.write_all(&data_offset.to_le_bytes())?;
            header_out.write_all(&(blob.len() as u32).to_le_bytes())?;
            data_out.write_all(&blob)?;
            assignments.push((series.id(), assignments.len() as RollupIndex));
            data_offset += blob.len() as u32;
        }

        data_out.flush()?;
        data_out.get_ref().sync_all()?;
        header_out.flush()?;
        header_out.get_ref().sync_all()?;
        drop(header_out);
        fs::rename(&tmp_path, dir.join(ROLLUP_HEADER))?;

        for (tid, ordinal) in assignments {
            tsdb.index().set_rollup_index(tid, ordinal)?;
        }
        debug!(dir = %dir.display(), "metric rollup built");
    }

    tsdb.set_mode_bits(MODE_ROLLED_UP);
    info!(?tsdb, "partition rolled up");
    Ok(())
}

/// Reads the hourly rollup entries of one series, as `(bucket start,
/// entry)` pairs. `None` means the caller must fall back to raw pages.
pub fn rollup_entries(
    tsdb: &Tsdb,
    metric_id: MetricId,
    series_id: TimeSeriesId,
    bucket_ticks: i64,
) -> TsdbResult<Option<Vec<(Timestamp, RollupEntry)>>> {
    let dir = metric_dir(tsdb, metric_id);
    let header_path = dir.join(ROLLUP_HEADER);
    if !header_path.exists() {
        return Ok(None);
    }
    tsdb.set_mode_bits(MODE_ROLLED_UP);
    tsdb.index().ensure_open(true)?;
    let entry = tsdb.index().get_entry(series_id)?;
    if entry.is_out_of_order() {
        return Ok(None);
    }
    if !entry.has_first() {
        return Ok(Some(Vec::new()));
    }
    if entry.rollup_index == INVALID_ROLLUP_INDEX {
        // pages exist but no rollup was built for this series
        return Ok(None);
    }

    let (tid, offset, len) = read_header_entry(&header_path, entry.rollup_index)?;
    if tid != series_id {
        return Err(TsdbError::Corrupted(format!(
            "rollup header entry {} names series {tid}, expected {series_id}",
            entry.rollup_index
        )));
    }
    let mut blob = vec![0u8; len as usize];
    let mut data = File::open(dir.join(ROLLUP_DATA))?;
    data.seek(SeekFrom::Start(offset as u64))?;
    data.read_exact(&mut blob)?;

    let decoded = uncompress_rollup(&blob)?;
    let from = tsdb.range().from;
    Ok(Some(
        decoded
            .into_iter()
            .enumerate()
            .filter_map(|(i, e)| e.map(|e| (from + i as i64 * bucket_ticks, e)))
            .collect(),
    ))
}

fn read_header_entry(path: &Path, index: RollupIndex) -> TsdbResult<(TimeSeriesId, u32, u32)> {
    let mut file = File::open(path)?;
    let total = file.metadata()?.len();
    let at = index as u64 * HEADER_ENTRY_SIZE;
    if at + HEADER_ENTRY_SIZE > total {
        return Err(TsdbError::Corrupted(format!(
            "rollup index {index} beyond header file {path:?}"
        )));
    }
    file.seek(SeekFrom::Start(at))?;
    let mut buf = [0u8; HEADER_ENTRY_SIZE as usize];
    file.read_exact(&mut buf)?;
    Ok((
        u32::from_le_bytes(buf[0..4].try_into().unwrap()),
        u32::from_le_bytes(buf[4..8].try_into().unwrap()),
        u32::from_le_bytes(buf[8..12].try_into().unwrap()),
    ))
}
