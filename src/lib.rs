//! pulsedb — an embedded storage and query engine for numeric time
//! series.
//!
//! Dense `(timestamp, f64)` samples, keyed by metric name plus tags, are
//! partitioned into fixed time windows ("Tsdbs") of memory-mapped page
//! files and compressed with Gorilla-family codecs to a few bytes per
//! point. A zlib append log makes unflushed page tails survive abrupt
//! termination; old partitions get hourly rollups so downsampled queries
//! stay cheap.
//!
//! The database expects an external scheduler to drive its periodic
//! hooks (`flush`, `rotate`, `compact`, `rollup`, `apply_retention`,
//! `wal_flush`, `wal_rotate`); everything else is plain library calls:
//!
//! ```no_run
//! use pulsedb::{Database, Settings, Tag};
//!
//! let db = Database::open(Settings::default())?;
//! db.add_data_point("cpu.busy", &[Tag::new("host", "web1")?], 1_700_000_000, 12.5)?;
//! # Ok::<(), pulsedb::TsdbError>(())
//! ```

pub mod common;
pub mod compress;
pub mod config;
pub mod error;
pub mod query;
pub mod series;
pub mod storage;
pub mod tsdb;

#[cfg(test)]
mod tests;

pub use common::time::{TimeRange, TimeUnit, Timestamp};
pub use common::types::{DataPoint, MetricId, Tag, TimeSeriesId};
pub use compress::CompressorVersion;
pub use config::Settings;
pub use error::{TsdbError, TsdbResult};
pub use query::{execute, rows_to_json, Aggregator, DownsampleSpec, Query, QueryRow, TagMatcher};
pub use tsdb::database::{BatchResult, Database, ShutdownMode};
pub use tsdb::Tsdb;
