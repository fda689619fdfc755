use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::common::time::{TimeUnit, SECS_PER_DAY};
use crate::compress::CompressorVersion;
use crate::error::{TsdbError, TsdbResult};

pub const DEFAULT_PAGE_SIZE: u16 = 4096;
pub const DEFAULT_PAGE_COUNT: u32 = 16_384;
pub const DEFAULT_ROTATION_SECS: i64 = SECS_PER_DAY;

/// Runtime configuration. Loaded from a `key = value` config file; every
/// key has a default so an empty file is a valid configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Root directory for all partitions, the meta file and the WAL.
    pub data_dir: PathBuf,

    /// Process-wide timestamp resolution. Changing this for an existing
    /// data directory is fatal at open time.
    pub time_unit: TimeUnit,

    /// Length of one Tsdb time window, in seconds.
    pub rotation_frequency: Duration,

    /// Page size in bytes. Must be a power of two.
    pub page_size: u16,

    /// Number of pages per data file (and headers per header file).
    pub page_count: u32,

    /// Codec used for new Tsdbs; embedded in each data file header.
    pub compressor_version: CompressorVersion,

    /// A Tsdb untouched for this long is closed by rotation.
    pub thrashing_threshold: Duration,

    /// A Tsdb whose end is older than this becomes read-only.
    pub read_only_threshold: Duration,

    /// A Tsdb whose end is older than this is archived (fully closed).
    pub archive_threshold: Duration,

    /// Tsdbs older than this are eligible for hourly rollup.
    pub rollup_threshold: Duration,

    /// Quantization precision (decimal digits) for rollup min/max/sum.
    pub rollup_precision: u8,

    /// Points older than this are rejected instead of routed to the
    /// out-of-order page. Zero disables the floor.
    pub retention_threshold: Duration,

    /// How often in-memory page tails are snapshotted to the WAL.
    pub wal_flush_frequency: Duration,

    /// How often a fresh WAL file is started.
    pub wal_rotation_frequency: Duration,

    /// Number of rotated WAL files kept before deletion.
    pub wal_retention_count: usize,

    /// Inclusive local hour at which compaction may begin.
    pub compact_begin_hour: u8,

    /// Exclusive local hour at which compaction must stop.
    pub compact_end_hour: u8,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            time_unit: TimeUnit::Seconds,
            rotation_frequency: Duration::from_secs(DEFAULT_ROTATION_SECS as u64),
            page_size: DEFAULT_PAGE_SIZE,
            page_count: DEFAULT_PAGE_COUNT,
            compressor_version: CompressorVersion::V2,
            thrashing_threshold: Duration::from_secs(120),
            read_only_threshold: Duration::from_secs(3600),
            archive_threshold: Duration::from_secs(2 * 3600),
            rollup_threshold: Duration::from_secs(2 * SECS_PER_DAY as u64),
            rollup_precision: 3,
            retention_threshold: Duration::ZERO,
            wal_flush_frequency: Duration::from_secs(5 * 60),
            wal_rotation_frequency: Duration::from_secs(5 * 60),
            wal_retention_count: 2,
            compact_begin_hour: 0,
            compact_end_hour: 5,
        }
    }
}

impl Settings {
    /// Parses a `tt.conf`-style config file: one `key = value` per line,
    /// `#` comments. Unknown keys warn and are ignored.
    pub fn from_file(path: &Path) -> TsdbResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut settings = Settings::default();
        settings.apply(&parse_key_values(&contents))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Re-reads the config file. On any failure the previous settings are
    /// kept and a warning is logged.
    pub fn reload(&mut self, path: &Path) -> bool {
        match Settings::from_file(path) {
            Ok(new_settings) => {
                *self = new_settings;
                true
            }
            Err(e) => {
                warn!(error = %e, "config reload failed; keeping previous settings");
                false
            }
        }
    }

    fn apply(&mut self, kv: &HashMap<String, String>) -> TsdbResult<()> {
        for (key, value) in kv {
            match key.as_str() {
                "data.dir" => self.data_dir = PathBuf::from(value),
                "tsdb.timestamp.ms" => {
                    self.time_unit = if parse_bool(key, value)? {
                        TimeUnit::Milliseconds
                    } else {
                        TimeUnit::Seconds
                    }
                }
                "tsdb.rotation.frequency.sec" => {
                    self.rotation_frequency = Duration::from_secs(parse_num(key, value)?)
                }
                "tsdb.page.size" => self.page_size = parse_num(key, value)? as u16,
                "tsdb.page.count" => self.page_count = parse_num(key, value)? as u32,
                "tsdb.compressor.version" => {
                    self.compressor_version =
                        CompressorVersion::try_from(parse_num(key, value)? as u8)?
                }
                "tsdb.thrashing.threshold.sec" => {
                    self.thrashing_threshold = Duration::from_secs(parse_num(key, value)?)
                }
                "tsdb.read_only.threshold.sec" => {
                    self.read_only_threshold = Duration::from_secs(parse_num(key, value)?)
                }
                "tsdb.archive.threshold.sec" => {
                    self.archive_threshold = Duration::from_secs(parse_num(key, value)?)
                }
                "tsdb.rollup.threshold.sec" => {
                    self.rollup_threshold = Duration::from_secs(parse_num(key, value)?)
                }
                "tsdb.rollup.precision" => self.rollup_precision = parse_num(key, value)? as u8,
                "tsdb.retention.threshold.sec" => {
                    self.retention_threshold = Duration::from_secs(parse_num(key, value)?)
                }
                "append.log.flush.frequency.sec" => {
                    self.wal_flush_frequency = Duration::from_secs(parse_num(key, value)?)
                }
                "append.log.rotation.frequency.sec" => {
                    self.wal_rotation_frequency = Duration::from_secs(parse_num(key, value)?)
                }
                "append.log.retention.count" => {
                    self.wal_retention_count = parse_num(key, value)? as usize
                }
                "tsdb.compact.begin.hour" => self.compact_begin_hour = parse_num(key, value)? as u8,
                "tsdb.compact.end.hour" => self.compact_end_hour = parse_num(key, value)? as u8,
                _ => warn!(key, "unknown config key ignored"),
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> TsdbResult<()> {
        if !self.page_size.is_power_of_two() {
            return Err(TsdbError::InvalidConfiguration(format!(
                "tsdb.page.size must be a power of two, got {}",
                self.page_size
            )));
        }
        // header indices are u16 with u16::MAX reserved
        if self.page_count == 0 || self.page_count >= u16::MAX as u32 {
            return Err(TsdbError::InvalidConfiguration(format!(
                "tsdb.page.count must be in [1, 65534], got {}",
                self.page_count
            )));
        }
        let window_ticks = self
            .time_unit
            .ticks_per(self.rotation_frequency.as_secs() as i64);
        // relative timestamps inside a window are stored as u32 and their
        // delta-of-deltas must fit the 32-bit codec bucket
        if window_ticks <= 0 || window_ticks > i32::MAX as i64 {
            return Err(TsdbError::InvalidConfiguration(format!(
                "tsdb.rotation.frequency.sec of {} does not fit 32-bit relative timestamps at {} resolution",
                self.rotation_frequency.as_secs(),
                self.time_unit
            )));
        }
        if self.compact_begin_hour > 23 || self.compact_end_hour > 24 {
            return Err(TsdbError::InvalidConfiguration(
                "compaction hours must be within a day".into(),
            ));
        }
        Ok(())
    }

    /// Window length in timestamp ticks.
    pub fn rotation_ticks(&self) -> i64 {
        self.time_unit
            .ticks_per(self.rotation_frequency.as_secs() as i64)
    }
}

fn parse_key_values(contents: &str) -> HashMap<String, String> {
    let mut kv = HashMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            kv.insert(key.trim().to_string(), value.trim().to_string());
        } else {
            warn!(line, "malformed config line ignored");
        }
    }
    kv
}

fn parse_num(key: &str, value: &str) -> TsdbResult<u64> {
    value
        .parse::<u64>()
        .map_err(|_| TsdbError::InvalidConfiguration(format!("{key}: expected a number, got {value}")))
}

fn parse_bool(key: &str, value: &str) -> TsdbResult<bool> {
    match value {
        v if v.eq_ignore_ascii_case("true") || v == "1" => Ok(true),
        v if v.eq_ignore_ascii_case("false") || v == "0" => Ok(false),
        _ => Err(TsdbError::InvalidConfiguration(format!(
            "{key}: expected a boolean, got {value}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        Settings::default().validate().unwrap();
    }

    #[test]
    fn test_parse_config_text() {
        let text = "\
# comment
data.dir = /tmp/pulse
tsdb.page.size = 8192
tsdb.compressor.version = 3
tsdb.timestamp.ms = true
bogus.key = 7
";
        let mut settings = Settings::default();
        settings.apply(&parse_key_values(text)).unwrap();
        assert_eq!(settings.data_dir, PathBuf::from("/tmp/pulse"));
        assert_eq!(settings.page_size, 8192);
        assert_eq!(settings.compressor_version, CompressorVersion::V3);
        assert_eq!(settings.time_unit, TimeUnit::Milliseconds);
        settings.validate().unwrap();
    }

    #[test]
    fn test_rotation_window_must_fit_u32() {
        let mut settings = Settings {
            time_unit: TimeUnit::Milliseconds,
            rotation_frequency: Duration::from_secs(30 * SECS_PER_DAY as u64),
            ..Default::default()
        };
        assert!(settings.validate().is_err());
        settings.rotation_frequency = Duration::from_secs(SECS_PER_DAY as u64);
        settings.validate().unwrap();
    }
}
