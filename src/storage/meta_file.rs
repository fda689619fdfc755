//! Append-only log of name assignments: metric ids, time series ids and
//! measurement field groups. Replayed in order at startup to rebuild the
//! id registries; ids are therefore stable across restarts.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::info;

use crate::common::types::{MetricId, TimeSeriesId};
use crate::error::{TsdbError, TsdbResult};

const META_FILE_NAME: &str = "meta";
/// Stands in for an empty tag string, which would otherwise vanish
/// between the space delimiters.
const EMPTY_TAGS: &str = "-";

/// A record replayed from the meta file.
#[derive(Debug, Clone, PartialEq)]
pub enum MetaRecord {
    Metric {
        id: MetricId,
        name: String,
    },
    TimeSeries {
        metric: String,
        tags: String,
        id: TimeSeriesId,
    },
    Measurement {
        metric: String,
        tags: String,
        fields: Vec<(String, TimeSeriesId)>,
    },
}

#[derive(Debug)]
pub struct MetaFile {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl MetaFile {
    pub fn path_in(data_dir: &Path) -> PathBuf {
        data_dir.join(META_FILE_NAME)
    }

    /// Opens for append, creating an empty file on first start.
    pub fn open(data_dir: &Path) -> TsdbResult<Self> {
        let path = Self::path_in(data_dir);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(MetaFile { path, writer: Mutex::new(BufWriter::new(file)) })
    }

    /// Replays every record in insertion order. Stops with `Corrupted` on
    /// the first malformed line; a truncated final line (torn write) is
    /// skipped with a warning from the caller's count.
    pub fn replay(data_dir: &Path, mut on_record: impl FnMut(MetaRecord) -> TsdbResult<()>) -> TsdbResult<usize> {
        let path = Self::path_in(data_dir);
        if !path.exists() {
            return Ok(0);
        }
        let reader = BufReader::new(File::open(&path)?);
        let mut count = 0usize;
        for line in reader.lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            on_record(parse_record(&line)?)?;
            count += 1;
        }
        info!(records = count, "meta file replayed");
        Ok(count)
    }

    // Records are pushed to the OS as soon as they are written: a series
    // referenced by an append-log record must be resolvable after a
    // process kill. fsync still waits for `flush(true)` at rotation.

    pub fn add_metric(&self, id: MetricId, name: &str) -> TsdbResult<()> {
        let mut writer = self.writer.lock();
        writeln!(writer, "metric {id} {name}")?;
        writer.flush()?;
        Ok(())
    }

    pub fn add_ts(&self, metric: &str, tags: &str, id: TimeSeriesId) -> TsdbResult<()> {
        let tags = if tags.is_empty() { EMPTY_TAGS } else { tags };
        let mut writer = self.writer.lock();
        writeln!(writer, "ts {metric} {tags} {id}")?;
        writer.flush()?;
        Ok(())
    }

    pub fn add_measurement(
        &self,
        metric: &str,
        tags: &str,
        fields: &[(String, TimeSeriesId)],
    ) -> TsdbResult<()> {
        let tags = if tags.is_empty() { EMPTY_TAGS } else { tags };
        let mut writer = self.writer.lock();
        write!(writer, "measurement {metric} {tags}")?;
        for (field, id) in fields {
            write!(writer, " {field}:{id}")?;
        }
        writeln!(writer)?;
        writer.flush()?;
        Ok(())
    }

    /// Flush, with fsync at rotation boundaries.
    pub fn flush(&self, sync: bool) -> TsdbResult<()> {
        let mut writer = self.writer.lock();
        writer.flush()?;
        if sync {
            writer.get_ref().sync_all()?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn parse_record(line: &str) -> TsdbResult<MetaRecord> {
    let corrupted = || TsdbError::Corrupted(format!("malformed meta record: {line}"));
    let mut parts = line.split(' ');
    match parts.next() {
        Some("metric") => {
            let id = parts.next().and_then(|s| s.parse().ok()).ok_or_else(corrupted)?;
            let name = parts.next().ok_or_else(corrupted)?.to_string();
            Ok(MetaRecord::Metric { id, name })
        }
        Some("ts") => {
            let metric = parts.next().ok_or_else(corrupted)?.to_string();
            let tags = parts.next().ok_or_else(corrupted)?;
            let tags = if tags == EMPTY_TAGS { String::new() } else { tags.to_string() };
            let id = parts.next().and_then(|s| s.parse().ok()).ok_or_else(corrupted)?;
            Ok(MetaRecord::TimeSeries { metric, tags, id })
        }
        Some("measurement") => {
            let metric = parts.next().ok_or_else(corrupted)?.to_string();
            let tags = parts.next().ok_or_else(corrupted)?;
            let tags = if tags == EMPTY_TAGS { String::new() } else { tags.to_string() };
            let mut fields = Vec::new();
            for part in parts {
                let (field, id) = part.split_once(':').ok_or_else(corrupted)?;
                let id = id.parse().map_err(|_| corrupted())?;
                fields.push((field.to_string(), id));
            }
            if fields.is_empty() {
                return Err(corrupted());
            }
            Ok(MetaRecord::Measurement { metric, tags, fields })
        }
        _ => Err(corrupted()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replay_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let meta = MetaFile::open(dir.path()).unwrap();
        meta.add_metric(0, "cpu").unwrap();
        meta.add_ts("cpu", "host=a", 0).unwrap();
        meta.add_ts("cpu", "", 1).unwrap();
        meta.add_measurement(
            "sensors",
            "site=lab",
            &[("temp".to_string(), 2), ("rh".to_string(), 3)],
        )
        .unwrap();
        meta.flush(true).unwrap();

        let mut records = Vec::new();
        let count = MetaFile::replay(dir.path(), |r| {
            records.push(r);
            Ok(())
        })
        .unwrap();
        assert_eq!(count, 4);
        assert_eq!(records[0], MetaRecord::Metric { id: 0, name: "cpu".into() });
        assert_eq!(
            records[1],
            MetaRecord::TimeSeries { metric: "cpu".into(), tags: "host=a".into(), id: 0 }
        );
        assert_eq!(
            records[2],
            MetaRecord::TimeSeries { metric: "cpu".into(), tags: "".into(), id: 1 }
        );
        match &records[3] {
            MetaRecord::Measurement { metric, tags, fields } => {
                assert_eq!(metric, "sensors");
                assert_eq!(tags, "site=lab");
                assert_eq!(fields.len(), 2);
            }
            other => panic!("unexpected record {other:?}"),
        }
    }

    #[test]
    fn test_malformed_record_is_corrupted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(MetaFile::path_in(dir.path()), "ts cpu\n").unwrap();
        let err = MetaFile::replay(dir.path(), |_| Ok(())).unwrap_err();
        assert!(matches!(err, TsdbError::Corrupted(_)));
    }
}
