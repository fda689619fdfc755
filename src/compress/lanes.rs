//! V1: byte-aligned delta-of-delta timestamps plus XOR byte lanes for
//! values.
//!
//! The first point stores `(t1 - t0)` in a u32 followed by the raw f64.
//! Subsequent timestamps store the delta-of-delta in an i16; when it does
//! not fit, the sentinel `i16::MIN` is written followed by an i32.
//! Values XOR against the previous value; a control byte records which
//! byte lanes of the 8-byte XOR are nonzero (bit 0 = least significant
//! lane) and only those lanes follow.

use smallvec::SmallVec;

use crate::common::time::Timestamp;
use crate::common::types::DataPoint;
use crate::compress::Position;
use crate::error::{TsdbError, TsdbResult};

const DOD_SENTINEL: i16 = i16::MIN;

#[derive(Debug, Clone)]
pub struct LaneCompressor {
    buf: Vec<u8>,
    capacity: usize,
    start_tstamp: Timestamp,
    prev_tstamp: Timestamp,
    prev_delta: i64,
    prev_value: f64,
    dp_count: usize,
    is_full: bool,
}

impl LaneCompressor {
    pub fn new(start_tstamp: Timestamp, capacity: usize) -> Self {
        LaneCompressor {
            buf: Vec::with_capacity(capacity),
            capacity,
            start_tstamp,
            prev_tstamp: start_tstamp,
            prev_delta: 0,
            prev_value: 0.0,
            dp_count: 0,
            is_full: false,
        }
    }

    pub fn compress(&mut self, tstamp: Timestamp, value: f64) -> bool {
        if self.is_full {
            return false;
        }

        let mut scratch: SmallVec<u8, 16> = SmallVec::new();
        if self.dp_count == 0 {
            let relative = (tstamp - self.start_tstamp) as u32;
            scratch.extend_from_slice(&relative.to_le_bytes());
            scratch.extend_from_slice(&value.to_le_bytes());
        } else {
            let delta = tstamp - self.prev_tstamp;
            let dod = delta - self.prev_delta;
            match i16::try_from(dod) {
                Ok(dod16) if dod16 != DOD_SENTINEL => {
                    scratch.extend_from_slice(&dod16.to_le_bytes());
                }
                _ => {
                    scratch.extend_from_slice(&DOD_SENTINEL.to_le_bytes());
                    scratch.extend_from_slice(&(dod as i32).to_le_bytes());
                }
            }
            let xor = value.to_bits() ^ self.prev_value.to_bits();
            let mut control: u8 = 0;
            let lanes = xor.to_le_bytes();
            for (i, lane) in lanes.iter().enumerate() {
                if *lane != 0 {
                    control |= 1 << i;
                }
            }
            scratch.push(control);
            for (i, lane) in lanes.iter().enumerate() {
                if control & (1 << i) != 0 {
                    scratch.push(*lane);
                }
            }
        }

        if self.buf.len() + scratch.len() > self.capacity {
            self.is_full = true;
            return false;
        }

        self.buf.extend_from_slice(&scratch);
        self.prev_delta = tstamp - self.prev_tstamp;
        self.prev_tstamp = tstamp;
        self.prev_value = value;
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
        self.capacity
    }

    pub fn save(&self) -> Position {
        Position {
            offset: self.buf.len() as u16,
            start: 0,
        }
    }

    pub fn copy_to(&self, out: &mut [u8]) -> usize {
        out[..self.buf.len()].copy_from_slice(&self.buf);
        self.buf.len()
    }

    pub fn recycle(&mut self, start_tstamp: Timestamp, capacity: usize) {
        self.buf.clear();
        self.capacity = capacity;
        self.start_tstamp = start_tstamp;
        self.prev_tstamp = start_tstamp;
        self.prev_delta = 0;
        self.prev_value = 0.0;
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
    let end = pos.offset as usize;
    let mut at = 0;

    let short = |what: &str| TsdbError::DecompressionFailed(format!("truncated {what} in V1 page"));

    // first point
    if end < 12 {
        return Err(short("first point"));
    }
    let relative = u32::from_le_bytes(data[..4].try_into().unwrap()) as i64;
    let mut prev_tstamp = start_tstamp + relative;
    let mut prev_delta = relative;
    let mut prev_value = f64::from_le_bytes(data[4..12].try_into().unwrap());
    at += 12;
    dps.push(DataPoint::new(prev_tstamp, prev_value));

    while at < end {
        if at + 2 > end {
            return Err(short("delta-of-delta"));
        }
        let mut dod = i16::from_le_bytes(data[at..at + 2].try_into().unwrap()) as i64;
        at += 2;
        if dod == DOD_SENTINEL as i64 {
            if at + 4 > end {
                return Err(short("wide delta-of-delta"));
            }
            dod = i32::from_le_bytes(data[at..at + 4].try_into().unwrap()) as i64;
            at += 4;
        }
        let delta = prev_delta + dod;
        let tstamp = prev_tstamp + delta;

        if at >= end {
            return Err(short("control byte"));
        }
        let control = data[at];
        at += 1;
        let mut lanes = [0u8; 8];
        for (i, lane) in lanes.iter_mut().enumerate() {
            if control & (1 << i) != 0 {
                if at >= end {
                    return Err(short("xor lane"));
                }
                *lane = data[at];
                at += 1;
            }
        }
        let value = f64::from_bits(prev_value.to_bits() ^ u64::from_le_bytes(lanes));

        dps.push(DataPoint::new(tstamp, value));
        prev_tstamp = tstamp;
        prev_delta = delta;
        prev_value = value;
    }

    Ok(())
}
