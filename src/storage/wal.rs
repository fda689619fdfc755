//! The append log: zlib-compressed snapshots of unflushed in-memory
//! pages, replayed after a crash. Each record is one page snapshot plus
//! the context needed to tell which of its points already reached a data
//! file.
//!
//! Log files are named `append.<epoch>.<writer>.log.zip`; the writer
//! segment is a small dense id of the thread that started the log, so a
//! future move to one stream per writer thread needs no format change.
//! Records are sync-flushed so every complete record survives an abrupt
//! termination; a torn trailing record is detected by its checksum (or a
//! short read) and dropped.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use integer_encoding::{VarIntReader, VarIntWriter};
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use xxhash_rust::xxh3::xxh3_64;

use crate::common::time::{current_time_millis, Timestamp};
use crate::common::types::{FileIndex, HeaderIndex, MetricId, TimeSeriesId};
use crate::compress::{CompressorVersion, Position};
use crate::error::{TsdbError, TsdbResult};

const WAL_DIR: &str = "wal";
const RECORD_MARKER: u8 = 0xA5;

static NEXT_WRITER_ID: AtomicU32 = AtomicU32::new(0);

thread_local! {
    /// Dense per-thread id embedded in log file names.
    static WRITER_ID: u32 = NEXT_WRITER_ID.fetch_add(1, Ordering::Relaxed);
}

/// Snapshot of one in-memory page.
#[derive(Debug, Clone, PartialEq)]
pub struct WalRecord {
    pub metric_id: MetricId,
    pub series_id: TimeSeriesId,
    pub version: CompressorVersion,
    /// start of the owning Tsdb window; identifies the partition and is
    /// the codec base timestamp
    pub window_start: Timestamp,
    pub is_ooo: bool,
    /// on-disk location of this page, invalid when it was never flushed
    pub slot_file: FileIndex,
    pub slot_header: HeaderIndex,
    pub position: Position,
    pub bytes: Vec<u8>,
}

pub struct AppendLog {
    dir: PathBuf,
    writer: Mutex<Option<(PathBuf, ZlibEncoder<File>)>>,
}

impl AppendLog {
    pub fn dir_in(data_dir: &Path) -> PathBuf {
        data_dir.join(WAL_DIR)
    }

    pub fn open(data_dir: &Path) -> TsdbResult<Self> {
        let dir = Self::dir_in(data_dir);
        fs::create_dir_all(&dir)?;
        Ok(AppendLog { dir, writer: Mutex::new(None) })
    }

    fn log_path(&self, epoch: i64) -> PathBuf {
        let writer = WRITER_ID.with(|id| *id);
        self.dir.join(format!("append.{epoch}.{writer}.log.zip"))
    }

    /// Starts a fresh log file; subsequent `append`s go there.
    pub fn begin_new(&self) -> TsdbResult<()> {
        let path = self.log_path(current_time_millis());
        let file = File::create(&path)?;
        let encoder = ZlibEncoder::new(file, Compression::fast());
        debug!(path = %path.display(), "started append log");
        *self.writer.lock() = Some((path, encoder));
        Ok(())
    }

    pub fn append(&self, record: &WalRecord) -> TsdbResult<()> {
        let mut guard = self.writer.lock();
        let (_, encoder) = guard
            .as_mut()
            .ok_or_else(|| TsdbError::Internal("append log not started".into()))?;

        encoder.write_all(&[RECORD_MARKER])?;
        encoder.write_varint(record.metric_id)?;
        encoder.write_varint(record.series_id)?;
        encoder.write_all(&[record.version.as_u8()])?;
        encoder.write_varint(record.window_start as u64)?;
        encoder.write_all(&[record.is_ooo as u8])?;
        encoder.write_varint(record.slot_file as u32)?;
        encoder.write_varint(record.slot_header as u32)?;
        encoder.write_varint(record.position.offset as u32)?;
        encoder.write_all(&[record.position.start])?;
        encoder.write_varint(record.bytes.len() as u64)?;
        encoder.write_all(&record.bytes)?;
        encoder.write_all(&xxh3_64(&record.bytes).to_le_bytes())?;
        // sync flush: the record is byte-complete in the file
        encoder.flush()?;
        Ok(())
    }

    /// Finishes the current log (if any) and deletes rotated logs beyond
    /// the retention count.
    pub fn rotate(&self, retention_count: usize) -> TsdbResult<()> {
        {
            let mut guard = self.writer.lock();
            if let Some((path, encoder)) = guard.take() {
                let file = encoder.finish()?;
                file.sync_all()?;
                debug!(path = %path.display(), "finished append log");
            }
        }
        let mut logs = Self::list_logs(&self.dir)?;
        while logs.len() > retention_count {
            let old = logs.remove(0);
            debug!(path = %old.display(), "removing old append log");
            fs::remove_file(old)?;
        }
        Ok(())
    }

    /// Deletes every log; called after a clean shutdown has persisted all
    /// page tails, and after a completed replay.
    pub fn remove_all(&self) -> TsdbResult<()> {
        let _ = self.writer.lock().take();
        for log in Self::list_logs(&self.dir)? {
            fs::remove_file(log)?;
        }
        Ok(())
    }

    fn list_logs(dir: &Path) -> TsdbResult<Vec<PathBuf>> {
        let mut logs: Vec<(i64, PathBuf)> = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let mut parts = name.split('.');
            if parts.next() != Some("append") {
                continue;
            }
            if let Some(epoch) = parts.next().and_then(|e| e.parse::<i64>().ok()) {
                logs.push((epoch, path));
            }
        }
        logs.sort();
        Ok(logs.into_iter().map(|(_, p)| p).collect())
    }

    pub fn restore_needed(data_dir: &Path) -> bool {
        let dir = Self::dir_in(data_dir);
        Self::list_logs(&dir).map(|logs| !logs.is_empty()).unwrap_or(false)
    }

    /// Replays every surviving record, oldest log first. Torn tails stop
    /// the affected log with a warning; corruption in the middle of a log
    /// is fatal.
    pub fn replay(
        data_dir: &Path,
        mut on_record: impl FnMut(WalRecord) -> TsdbResult<()>,
    ) -> TsdbResult<usize> {
        let dir = Self::dir_in(data_dir);
        if !dir.exists() {
            return Ok(0);
        }
        let mut count = 0usize;
        for log in Self::list_logs(&dir)? {
            let mut decoder = ZlibDecoder::new(File::open(&log)?);
            loop {
                match read_record(&mut decoder) {
                    Ok(Some(record)) => {
                        on_record(record)?;
                        count += 1;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(log = %log.display(), error = %e, "torn append log tail dropped");
                        break;
                    }
                }
            }
        }
        info!(records = count, "append log replayed");
        Ok(count)
    }
}

fn read_record(reader: &mut impl Read) -> TsdbResult<Option<WalRecord>> {
    let mut marker = [0u8; 1];
    match reader.read_exact(&mut marker) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    if marker[0] != RECORD_MARKER {
        return Err(TsdbError::Corrupted(format!(
            "bad append log record marker {:#x}",
            marker[0]
        )));
    }

    let metric_id: MetricId = reader.read_varint()?;
    let series_id: TimeSeriesId = reader.read_varint()?;
    let mut byte = [0u8; 1];
    reader.read_exact(&mut byte)?;
    let version = CompressorVersion::try_from(byte[0])?;
    let window_start: u64 = reader.read_varint()?;
    reader.read_exact(&mut byte)?;
    let is_ooo = byte[0] != 0;
    let slot_file: u32 = reader.read_varint()?;
    let slot_header: u32 = reader.read_varint()?;
    let offset: u32 = reader.read_varint()?;
    reader.read_exact(&mut byte)?;
    let start = byte[0];
    let len: u64 = reader.read_varint()?;
    if len > u16::MAX as u64 {
        return Err(TsdbError::Corrupted(format!("append log record of {len} bytes")));
    }
    let mut bytes = vec![0u8; len as usize];
    reader.read_exact(&mut bytes)?;
    let mut checksum = [0u8; 8];
    reader.read_exact(&mut checksum)?;
    if u64::from_le_bytes(checksum) != xxh3_64(&bytes) {
        return Err(TsdbError::Corrupted("append log record checksum mismatch".into()));
    }

    Ok(Some(WalRecord {
        metric_id,
        series_id,
        version,
        window_start: window_start as Timestamp,
        is_ooo,
        slot_file: slot_file as FileIndex,
        slot_header: slot_header as HeaderIndex,
        position: Position { offset: offset as u16, start },
        bytes,
    }))
}

#[cfg(test)]
mod tests {
    use crate::common::types::{INVALID_FILE_INDEX, INVALID_HEADER_INDEX};

    use super::*;

    fn sample_record(series_id: TimeSeriesId) -> WalRecord {
        WalRecord {
            metric_id: 1,
            series_id,
            version: CompressorVersion::V2,
            window_start: 86_400,
            is_ooo: false,
            slot_file: INVALID_FILE_INDEX,
            slot_header: INVALID_HEADER_INDEX,
            position: Position { offset: 100, start: 3 },
            bytes: (0..100u8).collect(),
        }
    }

    #[test]
    fn test_append_replay_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let wal = AppendLog::open(dir.path()).unwrap();
        wal.begin_new().unwrap();
        wal.append(&sample_record(7)).unwrap();
        wal.append(&sample_record(8)).unwrap();
        wal.rotate(10).unwrap();

        assert!(AppendLog::restore_needed(dir.path()));
        let mut records = Vec::new();
        let count = AppendLog::replay(dir.path(), |r| {
            records.push(r);
            Ok(())
        })
        .unwrap();
        assert_eq!(count, 2);
        assert_eq!(records[0], sample_record(7));
        assert_eq!(records[1], sample_record(8));
    }

    #[test]
    fn test_sync_flush_survives_unfinished_stream() {
        let dir = tempfile::tempdir().unwrap();
        let wal = AppendLog::open(dir.path()).unwrap();
        wal.begin_new().unwrap();
        wal.append(&sample_record(1)).unwrap();
        // drop without finish(), as a crash would
        drop(wal);

        let count = AppendLog::replay(dir.path(), |r| {
            assert_eq!(r.series_id, 1);
            Ok(())
        })
        .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_rotation_retention() {
        let dir = tempfile::tempdir().unwrap();
        let wal = AppendLog::open(dir.path()).unwrap();
        for _ in 0..4 {
            wal.begin_new().unwrap();
            wal.append(&sample_record(1)).unwrap();
            wal.rotate(2).unwrap();
            // distinct epoch per file name
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        let logs = AppendLog::list_logs(&AppendLog::dir_in(dir.path())).unwrap();
        assert_eq!(logs.len(), 2);

        wal.remove_all().unwrap();
        assert!(!AppendLog::restore_needed(dir.path()));
    }
}
