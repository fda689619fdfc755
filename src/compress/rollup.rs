//! Compact codec for rollup blobs.
//!
//! A blob covers every hour bucket of one time series within one Tsdb.
//! Counts are delta-encoded; min/max/sum are quantized to a configured
//! number of decimal digits and delta-encoded when the quantization
//! round-trips exactly, falling back to raw f64 bits when it does not.
//! The codec is therefore lossless.

use nom::bits::complete::{bool as take_bool, take};

use crate::common::bitwriter::PageBitWriter;
use crate::common::encoding::{read_uvarint_bits, write_uvarint_bits, zigzag_decode, zigzag_encode};
use crate::common::NomBitInput;
use crate::error::{TsdbError, TsdbResult};

/// Pre-aggregated summary of one bucket.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct RollupEntry {
    pub cnt: u32,
    pub min: f64,
    pub max: f64,
    pub sum: f64,
}

impl RollupEntry {
    pub fn merge(&mut self, other: &RollupEntry) {
        if other.cnt == 0 {
            return;
        }
        if self.cnt == 0 {
            *self = *other;
            return;
        }
        self.cnt += other.cnt;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.sum += other.sum;
    }
}

fn quantize(value: f64, scale: f64) -> Option<i64> {
    if !value.is_finite() {
        return None;
    }
    let q = value * scale;
    if q.abs() >= (1i64 << 53) as f64 {
        return None;
    }
    let q = q.round() as i64;
    ((q as f64 / scale).to_bits() == value.to_bits()).then_some(q)
}

#[derive(Debug)]
pub struct RollupCompressor {
    writer: PageBitWriter,
    scale: f64,
    prev_cnt: i64,
    prev_q: [i64; 3],
}

impl RollupCompressor {
    pub fn new(precision: u8, bucket_count: usize) -> Self {
        // worst case is three raw f64 fields per bucket
        let capacity = 4 + bucket_count * 40;
        let mut writer = PageBitWriter::with_capacity(capacity);
        writer.write_bits(8, precision as u64);
        writer.write_bits(16, bucket_count as u64);
        RollupCompressor {
            writer,
            scale: 10f64.powi(precision as i32),
            prev_cnt: 0,
            prev_q: [0; 3],
        }
    }

    pub fn append_empty(&mut self) {
        self.writer.write_bit(false);
    }

    pub fn append(&mut self, entry: &RollupEntry) {
        self.writer.write_bit(true);
        write_uvarint_bits(zigzag_encode(entry.cnt as i64 - self.prev_cnt), &mut self.writer);
        self.prev_cnt = entry.cnt as i64;

        for (i, value) in [entry.min, entry.max, entry.sum].into_iter().enumerate() {
            match quantize(value, self.scale) {
                Some(q) => {
                    self.writer.write_bit(false);
                    write_uvarint_bits(zigzag_encode(q - self.prev_q[i]), &mut self.writer);
                    self.prev_q[i] = q;
                }
                None => {
                    self.writer.write_bit(true);
                    self.writer.write_bits(64, value.to_bits());
                }
            }
        }
    }

    pub fn finish(self) -> Vec<u8> {
        let mut out = vec![0u8; self.writer.size_in_bytes()];
        self.writer.copy_to(&mut out);
        out
    }
}

fn read_blob_header(input: NomBitInput) -> nom::IResult<NomBitInput, (u8, u16)> {
    let (remaining, precision): (NomBitInput, u8) = take(8usize)(input)?;
    let (remaining, bucket_count): (NomBitInput, u16) = take(16usize)(remaining)?;
    Ok((remaining, (precision, bucket_count)))
}

fn read_f64_bits(input: NomBitInput) -> nom::IResult<NomBitInput, u64> {
    take(64usize)(input)
}

/// Decodes a rollup blob into one `Option<RollupEntry>` per bucket.
pub fn uncompress_rollup(data: &[u8]) -> TsdbResult<Vec<Option<RollupEntry>>> {
    let decode_err = |_| TsdbError::DecompressionFailed("truncated rollup blob".into());

    let cursor: NomBitInput = (data, 0);
    let (next, (precision, bucket_count)) = read_blob_header(cursor).map_err(decode_err)?;
    let mut cursor = next;

    let scale = 10f64.powi(precision as i32);
    let mut entries = Vec::with_capacity(bucket_count as usize);
    let mut prev_cnt: i64 = 0;
    let mut prev_q: [i64; 3] = [0; 3];

    for _ in 0..bucket_count {
        let (next, present) = take_bool(cursor).map_err(decode_err)?;
        cursor = next;
        if !present {
            entries.push(None);
            continue;
        }

        let (next, cnt_delta) = read_uvarint_bits(cursor).map_err(decode_err)?;
        cursor = next;
        let cnt = prev_cnt + zigzag_decode(cnt_delta);
        if cnt < 0 || cnt > u32::MAX as i64 {
            return Err(TsdbError::DecompressionFailed(format!(
                "rollup count {cnt} out of range"
            )));
        }
        prev_cnt = cnt;

        let mut fields = [0f64; 3];
        for i in 0..3 {
            let (next, raw) = take_bool(cursor).map_err(decode_err)?;
            cursor = next;
            if raw {
                let (next, bits) = read_f64_bits(cursor).map_err(decode_err)?;
                cursor = next;
                fields[i] = f64::from_bits(bits);
            } else {
                let (next, delta) = read_uvarint_bits(cursor).map_err(decode_err)?;
                cursor = next;
                let q = prev_q[i] + zigzag_decode(delta);
                prev_q[i] = q;
                fields[i] = q as f64 / scale;
            }
        }

        entries.push(Some(RollupEntry {
            cnt: cnt as u32,
            min: fields[0],
            max: fields[1],
            sum: fields[2],
        }));
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use rand::{Rng, SeedableRng};

    use super::*;

    #[test]
    fn test_rollup_round_trip() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(11);
        let mut compressor = RollupCompressor::new(3, 24);
        let mut expected = Vec::new();

        for hour in 0..24 {
            if hour % 5 == 3 {
                compressor.append_empty();
                expected.push(None);
                continue;
            }
            let entry = RollupEntry {
                cnt: rng.gen_range(1..3600),
                min: (rng.gen_range(-500_000i64..500_000) as f64) / 1000.0,
                max: rng.gen_range(0.0..1e18),
                sum: rng.gen_range(-1e6..1e6),
            };
            compressor.append(&entry);
            expected.push(Some(entry));
        }

        let blob = compressor.finish();
        let decoded = uncompress_rollup(&blob).unwrap();
        assert_eq!(decoded.len(), expected.len());
        for (got, want) in decoded.iter().zip(expected.iter()) {
            match (got, want) {
                (None, None) => {}
                (Some(g), Some(w)) => {
                    assert_eq!(g.cnt, w.cnt);
                    assert_eq!(g.min.to_bits(), w.min.to_bits());
                    assert_eq!(g.max.to_bits(), w.max.to_bits());
                    assert_eq!(g.sum.to_bits(), w.sum.to_bits());
                }
                _ => panic!("presence mismatch"),
            }
        }
    }

    #[test]
    fn test_quantized_counts_stay_small() {
        let mut compressor = RollupCompressor::new(3, 24);
        for _ in 0..24 {
            compressor.append(&RollupEntry { cnt: 60, min: 1.5, max: 2.5, sum: 120.0 });
        }
        let blob = compressor.finish();
        // steady-state buckets cost a handful of bytes, not 28 raw ones
        assert!(blob.len() < 24 * 8);
        let decoded = uncompress_rollup(&blob).unwrap();
        assert!(decoded.iter().all(|e| e.map_or(false, |e| e.cnt == 60)));
    }
}
