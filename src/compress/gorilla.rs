//! V2: Gorilla bit packing. Timestamp delta-of-deltas go into
//! `{1,7,9,12,32}`-bit buckets; values are varbit-xor encoded with
//! leading/trailing-zero window reuse.

use crate::common::bitwriter::PageBitWriter;
use crate::common::encoding::{read_varbit_ts, read_varbit_xor, write_varbit_ts, write_varbit_xor};
use crate::common::time::Timestamp;
use crate::common::types::DataPoint;
use crate::common::NomBitInput;
use crate::compress::Position;
use crate::error::{TsdbError, TsdbResult};

#[derive(Debug, Clone)]
pub struct GorillaCompressor {
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

impl GorillaCompressor {
    pub fn new(start_tstamp: Timestamp, capacity: usize) -> Self {
        GorillaCompressor {
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
            write_varbit_xor(value, self.prev_value, self.leading, self.trailing, &mut self.writer)
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

/// Reads the uncompressed first sample: 32-bit relative timestamp plus
/// the raw 64 value bits.
pub(super) fn read_first_sample(input: NomBitInput) -> nom::IResult<NomBitInput, (u32, u64)> {
    let (remaining, relative): (NomBitInput, u32) = nom::bits::complete::take(32usize)(input)?;
    let (remaining, value_bits): (NomBitInput, u64) =
        nom::bits::complete::take(64usize)(remaining)?;
    Ok((remaining, (relative, value_bits)))
}

/// Bits consumed from the start of `data` up to `cursor`.
pub(super) fn consumed_bits(data: &[u8], cursor: &NomBitInput) -> usize {
    (data.len() - cursor.0.len()) * 8 + cursor.1
}

pub(super) fn uncompress(
    start_tstamp: Timestamp,
    data: &[u8],
    pos: Position,
    dps: &mut Vec<DataPoint>,
) -> TsdbResult<()> {
    let end_bits = pos.total_bits();
    let decode_err =
        |_| TsdbError::DecompressionFailed("bitstream ended inside a V2 sample".into());

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
        let (next, (value, new_leading, new_trailing)) =
            read_varbit_xor(prev_value, leading, trailing)(next).map_err(decode_err)?;
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
