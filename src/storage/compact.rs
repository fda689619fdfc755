//! Background compaction: copies a read-only partition into packed page
//! files, merging out-of-order pages into sorted order and letting short
//! slices of different series share physical pages.
//!
//! The directory swap is `<t>` → `<t>.back`, `<t>.temp` → `<t>`, with
//! the parent directory fsynced between the steps so a crash never
//! leaves both names claimed; `.back` is removed last.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Timelike;
use tracing::{info, warn};

use crate::common::types::DataPoint;
use crate::config::Settings;
use crate::error::{TsdbError, TsdbResult};
use crate::series::WindowLink;
use crate::storage::page::PageInMemory;
use crate::tsdb::database::{Database, ShutdownMode};
use crate::tsdb::{Tsdb, MODE_COMPACTED, MODE_WRITE};

fn sibling(dir: &Path, suffix: &str) -> TsdbResult<PathBuf> {
    let name = dir
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| TsdbError::Internal(format!("unnamed partition dir {dir:?}")))?;
    Ok(dir.with_file_name(format!("{name}{suffix}")))
}

fn fsync_dir(dir: &Path) -> TsdbResult<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

/// Compacts read-only partitions, honoring the off-hours window. Returns
/// how many were compacted.
pub fn compact_eligible(db: &Database) -> TsdbResult<usize> {
    let settings = db.settings();
    let hour = chrono::Local::now().hour() as u8;
    if !(settings.compact_begin_hour..settings.compact_end_hour).contains(&hour) {
        return Ok(0);
    }

    let mut count = 0;
    for tsdb in db.partitions() {
        if db.shutdown_requested() != ShutdownMode::None {
            break;
        }
        if tsdb.is_compacted() {
            continue;
        }
        if tsdb.mode_of(settings) & MODE_WRITE != 0 {
            continue;
        }
        match compact_tsdb(db, &tsdb) {
            Ok(()) => count += 1,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => warn!(?tsdb, error = %e, "compaction failed; partition left as-is"),
        }
    }
    Ok(count)
}

/// Rewrites one partition into `<dir>.temp` and swaps it in.
pub fn compact_tsdb(db: &Database, tsdb: &Arc<Tsdb>) -> TsdbResult<()> {
    let dir = tsdb.dir().to_path_buf();
    let temp_dir = sibling(&dir, ".temp")?;
    let back_dir = sibling(&dir, ".back")?;
    if temp_dir.exists() {
        // leftovers of an interrupted attempt
        fs::remove_dir_all(&temp_dir)?;
    }

    let range = *tsdb.range();
    db.flush_window_buffers(range.from)?;
    let temp_settings = Settings {
        page_size: tsdb.page_size(),
        page_count: tsdb.page_count(),
        compressor_version: tsdb.compressor_version(),
        ..db.settings().clone()
    };
    let temp = Tsdb::create_at(&temp_dir, range, &temp_settings)?;

    for mid in tsdb.metric_ids()? {
        for series in db.series_for_metric(mid) {
            let containers = tsdb.query_for_data(mid, series.id(), &range, &[])?;
            if containers.is_empty() {
                continue;
            }
            let had_ooo = containers.iter().any(|c| c.out_of_order);
            let mut dps: Vec<DataPoint> =
                containers.into_iter().flat_map(|c| c.dps).collect();
            if had_ooo {
                // compaction folds late points back into sorted order
                dps.sort_by_key(|dp| dp.timestamp);
            }

            let mut link = WindowLink::new(range.from);
            let mut slot = None;
            let mut page = PageInMemory::new(
                range,
                temp.compressor_version(),
                temp.page_size() as usize,
                false,
            );
            for dp in &dps {
                while !page.add_data_point(dp.timestamp, dp.value) {
                    let capacity =
                        temp.append_page(&series, &page, &mut slot, &mut link, false)?;
                    page.reinit(range, capacity);
                }
            }
            if !page.is_empty() {
                temp.append_page(&series, &page, &mut slot, &mut link, false)?;
            }
        }
    }

    temp.shrink_to_fit()?;
    temp.mark_compacted()?;
    temp.flush(true)?;
    temp.close_files()?;
    tsdb.close_files()?;

    let parent = dir
        .parent()
        .ok_or_else(|| TsdbError::Internal(format!("partition {dir:?} has no parent")))?;
    fs::rename(&dir, &back_dir)?;
    fsync_dir(parent)?;
    fs::rename(&temp_dir, &dir)?;
    fsync_dir(parent)?;
    fs::remove_dir_all(&back_dir)?;

    let reopened = Arc::new(Tsdb::open_existing(&dir, db.settings())?);
    reopened.set_mode_bits(MODE_COMPACTED);
    db.replace_partition(tsdb, reopened);
    info!(dir = %dir.display(), "partition compacted");
    Ok(())
}
