use nom::bits::complete::{bool, take};
use nom::IResult;

use crate::common::bitwriter::PageBitWriter;
use crate::common::NomBitInput;

/// Writes an f64 as a varbit-xor encoded number against the previous value.
///
/// The first time it is called, use 0xff for the leading bits count and 0
/// for the trailing bits count. Returns the new `(leading, trailing)` pair.
pub fn write_varbit_xor(
    value: f64,
    previous_value: f64,
    previous_leading_bits_count: u8,
    previous_trailing_bits_count: u8,
    writer: &mut PageBitWriter,
) -> (u8, u8) {
    let delta = value.to_bits() ^ previous_value.to_bits();

    if delta == 0 {
        writer.write_bit(false);
        return (previous_leading_bits_count, previous_trailing_bits_count);
    }
    writer.write_bit(true);

    let mut new_leading = delta.leading_zeros() as u8;
    let new_trailing = delta.trailing_zeros() as u8;

    // only 5 bits are available to store the leading count
    if new_leading >= 32 {
        new_leading = 31;
    }

    // reuse the previous window when the new one fits inside it
    if previous_leading_bits_count != 0xff
        && new_leading >= previous_leading_bits_count
        && new_trailing >= previous_trailing_bits_count
    {
        writer.write_bit(false);
        writer.write_bits(
            64 - (previous_leading_bits_count as u32) - previous_trailing_bits_count as u32,
            delta >> previous_trailing_bits_count,
        );
        return (previous_leading_bits_count, previous_trailing_bits_count);
    }

    writer.write_bit(true);
    writer.write_bits(5, new_leading as u64);
    let sigbits = (64 - new_leading as u32) - new_trailing as u32;
    // 6 bits max out at 63; a 64-bit window overflows to 0, which is
    // unambiguous because a zero-length window means "same value" and is
    // handled by the first control bit.
    let encoded_sigbits = if sigbits > 63 { 0 } else { sigbits };
    writer.write_bits(6, encoded_sigbits as u64);
    writer.write_bits(sigbits, delta >> new_trailing);

    (new_leading, new_trailing)
}

fn read_leading_bits_count(input: NomBitInput) -> IResult<NomBitInput, u8> {
    take(5usize)(input)
}

fn read_middle_bits_count(input: NomBitInput) -> IResult<NomBitInput, u8> {
    let (remaining, middle_bits_count): (NomBitInput, u8) = take(6usize)(input)?;
    // 0 means a full 64-bit window, see the writer
    if middle_bits_count == 0 {
        return Ok((remaining, 64));
    }
    Ok((remaining, middle_bits_count))
}

/// Reads a varbit-xor encoded number from the input.
///
/// Returns the new value plus the new leading and trailing bits counts.
pub fn read_varbit_xor<'a>(
    previous_value: f64,
    previous_leading_bits_count: u8,
    previous_trailing_bits_count: u8,
) -> impl Fn(NomBitInput<'a>) -> IResult<NomBitInput<'a>, (f64, u8, u8)> {
    move |input: NomBitInput<'a>| {
        let (remaining, different_value_bit) = bool(input)?;
        if !different_value_bit {
            return Ok((
                remaining,
                (
                    previous_value,
                    previous_leading_bits_count,
                    previous_trailing_bits_count,
                ),
            ));
        }

        let leading_bits_count: u8;
        let middle_bits_count: u8;
        let trailing_bits_count: u8;

        let (remaining, new_window_bit) = bool(remaining)?;
        let mut remaining = remaining;
        if new_window_bit {
            let (tmp_remaining, tmp_leading) = read_leading_bits_count(remaining)?;
            let (tmp_remaining, tmp_middle) = read_middle_bits_count(tmp_remaining)?;
            remaining = tmp_remaining;
            leading_bits_count = tmp_leading;
            middle_bits_count = tmp_middle;
            trailing_bits_count = 64 - leading_bits_count - middle_bits_count;
        } else {
            leading_bits_count = previous_leading_bits_count;
            trailing_bits_count = previous_trailing_bits_count;
            middle_bits_count = 64 - leading_bits_count - trailing_bits_count;
        }

        let (remaining, value_bits): (NomBitInput, u64) = take(middle_bits_count)(remaining)?;

        let new_value =
            f64::from_bits(previous_value.to_bits() ^ (value_bits << trailing_bits_count));

        Ok((
            remaining,
            (new_value, leading_bits_count, trailing_bits_count),
        ))
    }
}

#[cfg(test)]
mod tests {
    use core::f64;

    use rand::{Rng, SeedableRng};

    use super::*;

    fn generate_random_test_data(seed: u64) -> Vec<Vec<f64>> {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);

        let mut test_cases = Vec::with_capacity(128);
        for _ in 0..128 {
            let vec_size = rng.gen_range(1..129);
            let mut vec = Vec::with_capacity(vec_size);

            let mut value: f64 = rng.gen();
            vec.push(value);

            for _ in 1..vec_size {
                if rng.gen_bool(0.33) {
                    value += 1.0;
                } else if rng.gen_bool(0.33) {
                    value = rng.gen();
                }
                vec.push(value);
            }
            test_cases.push(vec);
        }
        test_cases
    }

    #[test]
    fn test_write_varbit_xor() {
        let mut test_cases = generate_random_test_data(42);
        // exercise the leading-count clamping
        test_cases.push(vec![f64::MAX, 0.0, f64::MIN, f64::MAX, f64::MIN]);

        for test_case in test_cases {
            let mut writer = PageBitWriter::with_capacity(1 << 16);

            let mut value = 0.0;
            let mut leading = 0xff;
            let mut trailing = 0;

            for number in &test_case {
                let (new_leading, new_trailing) =
                    write_varbit_xor(*number, value, leading, trailing, &mut writer);
                value = *number;
                leading = new_leading;
                trailing = new_trailing;
            }

            let mut buf = vec![0u8; writer.size_in_bytes()];
            writer.copy_to(&mut buf);

            value = 0.0;
            leading = 0;
            trailing = 0;

            let mut cursor: NomBitInput = (&buf, 0);
            for number in test_case {
                let (new_cursor, (new_value, new_leading, new_trailing)) =
                    read_varbit_xor(value, leading, trailing)(cursor).unwrap();
                cursor = new_cursor;
                assert_eq!(new_value, number);
                value = new_value;
                leading = new_leading;
                trailing = new_trailing;
            }
        }
    }
}
