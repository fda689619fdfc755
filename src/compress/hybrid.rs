//! V3: the V2 timestamp path plus an integer fast path for values.
//!
//! Counter-like metrics are overwhelmingly integral; for those a
//! zigzag-uvarint of the integer delta is much tighter than varbit-xor.
//! Every value carries one control bit: 0 = integer delta against the
//! previous (integral) value, 1 = varbit-xor against the previous value
//! bits.

use nom::bits::complete::bool as take_bool;

use crate::common::bitwriter::PageBitWriter;
use crate::common::encoding::{
    read_uvarint_bits, read_varbit_ts, read_varbit_xor, write_uvarint_bits, write_varbit_ts,
    write_varbit_xor, zigzag_decode, zigzag_encode,
};
use crate::common::time::Timestamp;
use crate::common::types::DataPoint;
use crate::common::NomBitInput;
use crate::compress::gorilla::{consumed_bits, read_first_sample};
use crate::compress::Position;
use crate::error::{TsdbError, TsdbResult};

/// The integer value an f64 maps to when the mapping is exact (including
/// its sign-of-zero bit). Bounded so deltas cannot overflow.
fn as_exact_int(value: f64) -> Option<i64> {
    const LIMIT: f64 = (1i64 << 61) as f64;
    if !value.is_finite() || value.abs() >= LIMIT {
        return None;
    }
    let int = value as i64;
    (((int as f64).to_bits()) == value.to_bits()).then_some(int)
}

#[derive(Debug, Clone)]
pub struct HybridCompressor {
    writer: PageBitWriter,
    start_tstamp: Timestamp,
    prev_tstamp: Timestamp,
    prev_delta: i64,
    prev_value: f64,
    leading: u8,
    trailing: u8,
    dp_count: usize,
    is_full: bool,
}

impl HybridCompressor {
    pub fn new(start_tstamp: Timestamp, capacity: usize) -> Self {
        HybridCompressor {
            writer: PageBitWriter::with_capacity(capacity),
            start_tstamp,
            prev_tstamp: start_tstamp,
            prev_delta: 0,
            prev_value: 0.0,
            leading: 0xff,
            trailing: 0,
            dp_count: 0,
            is_full: false,
        }
    }

    pub fn compress(&mut self, tstamp: Timestamp, value: f64) -> bool {
        if self.is_full {
            return false;
        }

        let cp = self.writer.checkpoint();
        let (leading, trailing) = if self.dp_count == 0 {
            let relative = (tstamp - self.start_tstamp) as u32;
            self.writer.write_bits(32, relative as u64);
            self.writer.write_bits(64, value.to_bits());
            (0xff, 0)
        } else {
            let delta = tstamp - self.prev_tstamp;
            let dod = delta - self.prev_delta;
            write_varbit_ts(dod, &mut self.writer);

            match (as_exact_int(value), as_exact_int(self.prev_value)) {
                (Some(int), Some(prev_int)) => {
                    self.writer.write_bit(false);
                    write_uvarint_bits(zigzag_encode(int - prev_int), &mut self.writer);
                    (self.leading, self.trailing)
                }
                _ => {
                    self.writer.write_bit(true);
                    write_varbit_xor(
                        value,
                        self.prev_value,
                        self.leading,
                        self.trailing,
                        &mut self.writer,
                    )
                }
            }
        };

        if !self.writer.fits() {
            self.writer.rollback(cp);
            self.is_full = true;
            return false;
        }

        self.prev_delta = tstamp - self.prev_tstamp;
        self.prev_tstamp = tstamp;
        self.prev_value = value;
        self.leading = leading;
        self.trailing = trailing;
        self.dp_count += 1;
        true
    }

    pub fn is_full(&self) -> bool {
        self.is_full
    }

    pub fn dp_count(&self) -> usize {
        self.dp_count
    }

    pub fn last_tstamp(&self) -> Timestamp {
        self.prev_tstamp
    }

    pub fn start_tstamp(&self) -> Timestamp {
        self.start_tstamp
    }

    pub fn capacity(&self) -> usize {
        self.writer.capacity()
    }

    pub fn save(&self) -> Position {
        self.writer.position()
    }

    pub fn copy_to(&self, out: &mut [u8]) -> usize {
        self.writer.copy_to(out)
    }

    pub fn recycle(&mut self, start_tstamp: Timestamp, capacity: usize) {
        self.writer.clear(capacity);
        self.start_tstamp = start_tstamp;
        self.prev_tstamp = start_tstamp;
        self.prev_delta = 0;
        self.prev_value = 0.0;
        self.leading = 0xff;
        self.trailing = 0;
        self.dp_count = 0;
        self.is_full = false;
    }
}

pub(super) fn uncompress(
    start_tstamp: Timestamp,
    data: &[u8],
    pos: Position,
    dps: &mut Vec<DataPoint>,
) -> TsdbResult<()> {
    let end_bits = pos.total_bits();
    let decode_err =
        |_| TsdbError::DecompressionFailed("bitstream ended inside a V3 sample".into());

    let consumed = |c: &NomBitInput| consumed_bits(data, c);

    let mut cursor: NomBitInput = (data, 0);
    let (next, (relative, value_bits)) = read_first_sample(cursor).map_err(decode_err)?;
    cursor = next;

    let mut prev_tstamp = start_tstamp + relative as i64;
    let mut prev_delta = relative as i64;
    let mut prev_value = f64::from_bits(value_bits);
    let mut leading = 0u8;
    let mut trailing = 0u8;
    dps.push(DataPoint::new(prev_tstamp, prev_value));

    while consumed(&cursor) < end_bits {
        let (next, dod) = read_varbit_ts(cursor).map_err(decode_err)?;
        let (next, float_path) = take_bool(next).map_err(decode_err)?;

        let (next, value, new_leading, new_trailing) = if float_path {
            let (next, (value, new_leading, new_trailing)) =
                read_varbit_xor(prev_value, leading, trailing)(next).map_err(decode_err)?;
            (next, value, new_leading, new_trailing)
        } else {
            let prev_int = as_exact_int(prev_value).ok_or_else(|| {
                TsdbError::DecompressionFailed(
                    "V3 integer delta against a non-integral previous value".into(),
                )
            })?;
            let (next, encoded) = read_uvarint_bits(next).map_err(decode_err)?;
            let value = (prev_int + zigzag_decode(encoded)) as f64;
            (next, value, leading, trailing)
        };
        cursor = next;

        let delta = prev_delta + dod;
        let tstamp = prev_tstamp + delta;
        dps.push(DataPoint::new(tstamp, value));

        prev_tstamp = tstamp;
        prev_delta = delta;
        prev_value = value;
        leading = new_leading;
        trailing = new_trailing;
    }

    Ok(())
}
