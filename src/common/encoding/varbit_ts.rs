use nom::bits::complete::{bool, take};
use nom::IResult;

use crate::common::bitwriter::PageBitWriter;
use crate::common::NomBitInput;

/// Writes a timestamp delta-of-delta with variable bit width.
///
/// Buckets: `0` for zero, then 7, 9, 12 and 32 value bits behind the
/// prefixes `10`, `110`, `1110` and `1111`.
///
/// The caller guarantees the dod fits 32 bits; Tsdb windows are bounded
/// so relative timestamps never exceed u32.
pub fn write_varbit_ts(value: i64, writer: &mut PageBitWriter) {
    match value {
        0 => writer.write_bit(false),
        -63..=64 => {
            writer.write_bits(2, 0b10);
            writer.write_bits(7, value as u64 & 0x7F);
        }
        -255..=256 => {
            writer.write_bits(3, 0b110);
            writer.write_bits(9, value as u64 & 0x1FF);
        }
        -2047..=2048 => {
            writer.write_bits(4, 0b1110);
            writer.write_bits(12, value as u64 & 0xFFF);
        }
        _ => {
            debug_assert!((-((1i64 << 31) - 1)..=(1i64 << 31)).contains(&value));
            writer.write_bits(4, 0b1111);
            writer.write_bits(32, value as u64 & 0xFFFF_FFFF);
        }
    }
}

fn read_varbit_ts_bucket(input: NomBitInput) -> IResult<NomBitInput, u8> {
    let mut remaining = input;
    for i in 0..4 {
        let (new_remaining, bit) = bool(remaining)?;
        remaining = new_remaining;
        // a 0 terminates the bucket prefix
        if !bit {
            return Ok((remaining, i));
        }
    }
    Ok((remaining, 4))
}

#[inline]
fn varbit_ts_bucket_to_num_bits(bucket: u8) -> u8 {
    match bucket {
        0 => 0,
        1 => 7,
        2 => 9,
        3 => 12,
        4 => 32,
        _ => unreachable!("invalid bucket value"),
    }
}

/// Reads a delta-of-delta written by [`write_varbit_ts`].
pub fn read_varbit_ts(input: NomBitInput) -> IResult<NomBitInput, i64> {
    let (remaining, bucket) = read_varbit_ts_bucket(input)?;
    let num_bits = varbit_ts_bucket_to_num_bits(bucket);

    if bucket == 0 {
        return Ok((remaining, 0));
    }

    let (remaining, mut value): (_, i64) = take(num_bits)(remaining)?;
    if value > (1 << (num_bits - 1)) {
        value -= 1 << num_bits;
    }

    Ok((remaining, value))
}

#[cfg(test)]
mod tests {
    use rand::{Rng, SeedableRng};

    use super::*;

    fn generate_random_test_data(seed: u64) -> Vec<Vec<i64>> {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);

        let mut test_cases = Vec::with_capacity(128);
        for _ in 0..128 {
            let vec_size = rng.gen_range(1..129);
            let mut vec = Vec::with_capacity(vec_size);

            let mut value: i64 = if rng.gen_bool(0.5) {
                rng.gen_range(-100_000_000..1_000_000)
            } else {
                rng.gen_range(-10_000..10_000)
            };
            vec.push(value);

            for _ in 1..vec_size {
                if rng.gen_bool(0.33) {
                    value += 1;
                } else if rng.gen_bool(0.33) {
                    value = rng.gen_range(-2_000_000_000..2_000_000_000);
                }
                vec.push(value);
            }
            test_cases.push(vec);
        }
        test_cases
    }

    #[test]
    fn test_write_varbit_ts() {
        let mut test_cases = generate_random_test_data(42);
        test_cases.push(vec![0, 64, -63, 65, -64, 256, -255, 2048, -2047, 2049, 1 << 31]);

        for test_case in test_cases {
            let mut writer = PageBitWriter::with_capacity(1 << 16);
            for number in &test_case {
                write_varbit_ts(*number, &mut writer);
            }

            let mut buf = vec![0u8; writer.size_in_bytes()];
            writer.copy_to(&mut buf);

            let mut cursor: NomBitInput = (&buf, 0);
            for number in test_case {
                let (new_cursor, value) = read_varbit_ts(cursor).unwrap();
                cursor = new_cursor;
                assert_eq!(value, number);
            }
        }
    }
}
