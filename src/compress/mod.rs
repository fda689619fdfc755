//! Page-level compression codecs.
//!
//! Four variants, selectable per Tsdb and embedded in each data file
//! header: V0 stores raw pairs (out-of-order pages, compaction scratch),
//! V1 is byte-aligned delta-of-delta with XOR byte lanes, V2 is the
//! classic Gorilla bit packing, V3 adds an integer fast path for
//! counter-like metrics.

mod gorilla;
mod hybrid;
mod lanes;
mod raw;
pub mod rollup;

use serde::{Deserialize, Serialize};

use crate::common::time::Timestamp;
use crate::common::types::DataPoint;
use crate::error::{TsdbError, TsdbResult};

pub use gorilla::GorillaCompressor;
pub use hybrid::HybridCompressor;
pub use lanes::LaneCompressor;
pub use raw::RawCompressor;

/// Resume point of a compressed stream: `offset` full bytes plus `start`
/// bits into the next byte. Persisted in the page header; sufficient to
/// resume decoding or appending.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct Position {
    pub offset: u16,
    pub start: u8,
}

impl Position {
    pub fn total_bits(&self) -> usize {
        self.offset as usize * 8 + self.start as usize
    }

    pub fn size_in_bytes(&self) -> usize {
        self.offset as usize + (self.start > 0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.offset == 0 && self.start == 0
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[repr(u8)]
pub enum CompressorVersion {
    V0 = 0,
    V1 = 1,
    #[default]
    V2 = 2,
    V3 = 3,
}

impl CompressorVersion {
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

impl TryFrom<u8> for CompressorVersion {
    type Error = TsdbError;

    fn try_from(value: u8) -> TsdbResult<Self> {
        match value {
            0 => Ok(CompressorVersion::V0),
            1 => Ok(CompressorVersion::V1),
            2 => Ok(CompressorVersion::V2),
            3 => Ok(CompressorVersion::V3),
            _ => Err(TsdbError::InvalidCompression(value.to_string())),
        }
    }
}

/// One page compressor. All variants share the same contract: inputs are
/// `compress(tstamp, value)` calls in ingest order against absolute
/// timestamps; `compress` returns false (and latches `is_full`) when the
/// sample does not fit the remaining page capacity; decoding the saved
/// stream returns the accepted inputs exactly.
#[derive(Debug, Clone)]
pub enum Compressor {
    Raw(RawCompressor),
    Lanes(LaneCompressor),
    Gorilla(GorillaCompressor),
    Hybrid(HybridCompressor),
}

impl Compressor {
    /// `start_tstamp` is the owning Tsdb's range start; timestamps are
    /// stored relative to it. `capacity` is the page capacity in bytes.
    pub fn create(version: CompressorVersion, start_tstamp: Timestamp, capacity: usize) -> Self {
        match version {
            CompressorVersion::V0 => Compressor::Raw(RawCompressor::new(start_tstamp, capacity)),
            CompressorVersion::V1 => Compressor::Lanes(LaneCompressor::new(start_tstamp, capacity)),
            CompressorVersion::V2 => {
                Compressor::Gorilla(GorillaCompressor::new(start_tstamp, capacity))
            }
            CompressorVersion::V3 => {
                Compressor::Hybrid(HybridCompressor::new(start_tstamp, capacity))
            }
        }
    }

    pub fn version(&self) -> CompressorVersion {
        match self {
            Compressor::Raw(_) => CompressorVersion::V0,
            Compressor::Lanes(_) => CompressorVersion::V1,
            Compressor::Gorilla(_) => CompressorVersion::V2,
            Compressor::Hybrid(_) => CompressorVersion::V3,
        }
    }

    pub fn compress(&mut self, tstamp: Timestamp, value: f64) -> bool {
        match self {
            Compressor::Raw(c) => c.compress(tstamp, value),
            Compressor::Lanes(c) => c.compress(tstamp, value),
            Compressor::Gorilla(c) => c.compress(tstamp, value),
            Compressor::Hybrid(c) => c.compress(tstamp, value),
        }
    }

    /// Decodes this compressor's own buffer, appending to `dps`.
    pub fn uncompress(&self, dps: &mut Vec<DataPoint>) -> TsdbResult<()> {
        let pos = self.save();
        let mut buf = vec![0u8; pos.size_in_bytes()];
        self.copy_to(&mut buf);
        uncompress_page(self.version(), self.start_tstamp(), &buf, pos, dps)
    }

    /// The resume position to persist in the page header.
    pub fn save(&self) -> Position {
        match self {
            Compressor::Raw(c) => c.save(),
            Compressor::Lanes(c) => c.save(),
            Compressor::Gorilla(c) => c.save(),
            Compressor::Hybrid(c) => c.save(),
        }
    }

    /// Copies the encoded stream into `out` (e.g. an mmap'd page).
    /// Returns the number of bytes written.
    pub fn copy_to(&self, out: &mut [u8]) -> usize {
        match self {
            Compressor::Raw(c) => c.copy_to(out),
            Compressor::Lanes(c) => c.copy_to(out),
            Compressor::Gorilla(c) => c.copy_to(out),
            Compressor::Hybrid(c) => c.copy_to(out),
        }
    }

    /// Rebuilds the compressor from a persisted page region, appending the
    /// decoded points to `dps`. The compressor is left appendable.
    pub fn restore(
        &mut self,
        dps: &mut Vec<DataPoint>,
        pos: Position,
        data: &[u8],
    ) -> TsdbResult<()> {
        let version = self.version();
        let start = self.start_tstamp();
        let capacity = self.capacity();
        let mut decoded = Vec::new();
        uncompress_page(version, start, data, pos, &mut decoded)?;
        self.recycle(start, capacity);
        for dp in &decoded {
            if !self.compress(dp.timestamp, dp.value) {
                return Err(TsdbError::Corrupted(
                    "restored page does not fit its own capacity".into(),
                ));
            }
        }
        dps.extend_from_slice(&decoded);
        Ok(())
    }

    /// Resets for a fresh page.
    pub fn recycle(&mut self, start_tstamp: Timestamp, capacity: usize) {
        match self {
            Compressor::Raw(c) => c.recycle(start_tstamp, capacity),
            Compressor::Lanes(c) => c.recycle(start_tstamp, capacity),
            Compressor::Gorilla(c) => c.recycle(start_tstamp, capacity),
            Compressor::Hybrid(c) => c.recycle(start_tstamp, capacity),
        }
    }

    pub fn is_full(&self) -> bool {
        match self {
            Compressor::Raw(c) => c.is_full(),
            Compressor::Lanes(c) => c.is_full(),
            Compressor::Gorilla(c) => c.is_full(),
            Compressor::Hybrid(c) => c.is_full(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.dp_count() == 0
    }

    /// Number of bytes occupied by the encoded stream.
    pub fn size(&self) -> usize {
        self.save().size_in_bytes()
    }

    pub fn dp_count(&self) -> usize {
        match self {
            Compressor::Raw(c) => c.dp_count(),
            Compressor::Lanes(c) => c.dp_count(),
            Compressor::Gorilla(c) => c.dp_count(),
            Compressor::Hybrid(c) => c.dp_count(),
        }
    }

    pub fn last_tstamp(&self) -> Timestamp {
        match self {
            Compressor::Raw(c) => c.last_tstamp(),
            Compressor::Lanes(c) => c.last_tstamp(),
            Compressor::Gorilla(c) => c.last_tstamp(),
            Compressor::Hybrid(c) => c.last_tstamp(),
        }
    }

    pub fn start_tstamp(&self) -> Timestamp {
        match self {
            Compressor::Raw(c) => c.start_tstamp(),
            Compressor::Lanes(c) => c.start_tstamp(),
            Compressor::Gorilla(c) => c.start_tstamp(),
            Compressor::Hybrid(c) => c.start_tstamp(),
        }
    }

    pub fn capacity(&self) -> usize {
        match self {
            Compressor::Raw(c) => c.capacity(),
            Compressor::Lanes(c) => c.capacity(),
            Compressor::Gorilla(c) => c.capacity(),
            Compressor::Hybrid(c) => c.capacity(),
        }
    }
}

/// Decodes a persisted page region without constructing a compressor.
/// Decoding consumes exactly `pos.total_bits()` bits of `data`.
pub fn uncompress_page(
    version: CompressorVersion,
    start_tstamp: Timestamp,
    data: &[u8],
    pos: Position,
    dps: &mut Vec<DataPoint>,
) -> TsdbResult<()> {
    if pos.is_empty() {
        return Ok(());
    }
    if data.len() < pos.size_in_bytes() {
        return Err(TsdbError::DecompressionFailed(format!(
            "page region of {} bytes is shorter than its saved position {:?}",
            data.len(),
            pos
        )));
    }
    match version {
        CompressorVersion::V0 => raw::uncompress(data, pos, dps),
        CompressorVersion::V1 => lanes::uncompress(start_tstamp, data, pos, dps),
        CompressorVersion::V2 => gorilla::uncompress(start_tstamp, data, pos, dps),
        CompressorVersion::V3 => hybrid::uncompress(start_tstamp, data, pos, dps),
    }
}

#[cfg(test)]
mod tests {
    use rand::{Rng, SeedableRng};
    use test_case::test_case;

    use super::*;

    fn generate_series(seed: u64, n: usize, start: Timestamp) -> Vec<DataPoint> {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let mut tstamp = start + rng.gen_range(0..30);
        let mut value: f64 = rng.gen_range(-10_000.0..10_000.0);
        let mut dps = Vec::with_capacity(n);
        for _ in 0..n {
            dps.push(DataPoint::new(tstamp, value));
            tstamp += rng.gen_range(1..30);
            if rng.gen_bool(0.3) {
                value += 1.0;
            } else if rng.gen_bool(0.3) {
                value = rng.gen_range(-10_000.0..10_000.0);
            }
        }
        dps
    }

    fn generate_counter_series(seed: u64, n: usize, start: Timestamp) -> Vec<DataPoint> {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let mut tstamp = start;
        let mut value: i64 = rng.gen_range(0..1_000_000);
        let mut dps = Vec::with_capacity(n);
        for _ in 0..n {
            dps.push(DataPoint::new(tstamp, value as f64));
            tstamp += 10;
            value += rng.gen_range(0..100);
        }
        dps
    }

    #[test_case(CompressorVersion::V0 ; "raw")]
    #[test_case(CompressorVersion::V1 ; "byte lanes")]
    #[test_case(CompressorVersion::V2 ; "gorilla")]
    #[test_case(CompressorVersion::V3 ; "gorilla with integer path")]
    fn round_trip_accepted_prefix(version: CompressorVersion) {
        let start: Timestamp = 1_600_000_000;
        for seed in 0..8 {
            let input = generate_series(seed, 600, start);
            let mut compressor = Compressor::create(version, start, 4096);

            let mut accepted = Vec::new();
            for dp in &input {
                if compressor.compress(dp.timestamp, dp.value) {
                    accepted.push(*dp);
                } else {
                    assert!(compressor.is_full());
                    break;
                }
            }
            assert!(!accepted.is_empty());
            assert_eq!(compressor.dp_count(), accepted.len());
            assert_eq!(compressor.last_tstamp(), accepted.last().unwrap().timestamp);

            let mut decoded = Vec::new();
            compressor.uncompress(&mut decoded).unwrap();
            assert_eq!(decoded, accepted);
        }
    }

    #[test_case(CompressorVersion::V1 ; "byte lanes")]
    #[test_case(CompressorVersion::V2 ; "gorilla")]
    #[test_case(CompressorVersion::V3 ; "gorilla with integer path")]
    fn restore_then_append(version: CompressorVersion) {
        let start: Timestamp = 1_600_000_000;
        let input = generate_series(99, 64, start);
        let (head, tail) = input.split_at(32);

        let mut compressor = Compressor::create(version, start, 4096);
        for dp in head {
            assert!(compressor.compress(dp.timestamp, dp.value));
        }
        let pos = compressor.save();
        let mut page = vec![0u8; 4096];
        compressor.copy_to(&mut page);

        // a fresh compressor resumes from the persisted region
        let mut resumed = Compressor::create(version, start, 4096);
        let mut restored = Vec::new();
        resumed.restore(&mut restored, pos, &page).unwrap();
        assert_eq!(restored, head);

        for dp in tail {
            assert!(resumed.compress(dp.timestamp, dp.value));
        }
        let mut decoded = Vec::new();
        resumed.uncompress(&mut decoded).unwrap();
        assert_eq!(decoded, input);
    }

    #[test]
    fn integer_path_beats_gorilla_on_counters() {
        let start: Timestamp = 1_600_000_000;
        let input = generate_counter_series(7, 200, start);

        let mut v2 = Compressor::create(CompressorVersion::V2, start, 1 << 15);
        let mut v3 = Compressor::create(CompressorVersion::V3, start, 1 << 15);
        for dp in &input {
            assert!(v2.compress(dp.timestamp, dp.value));
            assert!(v3.compress(dp.timestamp, dp.value));
        }
        assert!(v3.size() < v2.size());

        let mut decoded = Vec::new();
        v3.uncompress(&mut decoded).unwrap();
        assert_eq!(decoded, input);
    }

    #[test]
    fn duplicate_timestamps_are_accepted() {
        let start: Timestamp = 1_600_000_000;
        for version in [
            CompressorVersion::V1,
            CompressorVersion::V2,
            CompressorVersion::V3,
        ] {
            let mut compressor = Compressor::create(version, start, 4096);
            assert!(compressor.compress(start + 60, 1.5));
            assert!(compressor.compress(start + 60, 1.5));
            assert!(compressor.compress(start + 120, 2.5));
            let mut decoded = Vec::new();
            compressor.uncompress(&mut decoded).unwrap();
            assert_eq!(decoded.len(), 3);
        }
    }
}
