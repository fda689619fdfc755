use nom::bits::complete::take;
use nom::IResult;

use crate::common::bitwriter::PageBitWriter;
use crate::common::NomBitInput;

/// Writes a u64 as a Golang uvarint into the bit stream. The groups are
/// byte-sized but need not be byte-aligned.
pub fn write_uvarint_bits(value: u64, writer: &mut PageBitWriter) {
    let mut x = value;
    while x >= 0x80 {
        writer.write_bits(8, 0x80 | (x & 0x7F));
        x >>= 7;
    }
    writer.write_bits(8, x);
}

/// Parses a Golang uvarint from a bit-level cursor.
pub fn read_uvarint_bits(input: NomBitInput) -> IResult<NomBitInput, u64> {
    let mut remaining = input;
    let mut x: u64 = 0;
    let mut s: usize = 0;

    for i in 0..10 {
        let (new_remaining, byte): (NomBitInput, u8) = take(8usize)(remaining)?;
        remaining = new_remaining;

        if byte < 0x80 {
            if i == 9 && byte > 1 {
                return Err(nom::Err::Error(nom::error::Error::new(
                    input,
                    nom::error::ErrorKind::TooLarge,
                )));
            }
            return Ok((remaining, x | (byte as u64) << s));
        }

        x |= ((byte & 0x7F) as u64) << s;
        s += 7;
    }

    Err(nom::Err::Error(nom::error::Error::new(
        input,
        nom::error::ErrorKind::TooLarge,
    )))
}

/// Maps a signed value onto the uvarint-friendly zigzag encoding.
#[inline]
pub fn zigzag_encode(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

#[inline]
pub fn zigzag_decode(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

#[cfg(test)]
mod tests {
    use rand::{Rng, SeedableRng};

    use super::*;

    #[test]
    fn test_uvarint_round_trip() {
        let mut numbers = vec![
            0,
            1,
            127,
            128,
            300,
            16384,
            72_057_594_037_927_936,
            u64::MAX,
        ];
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        for _ in 0..100 {
            numbers.push(rng.gen());
        }

        let mut writer = PageBitWriter::with_capacity(4096);
        // shift by one bit so that the groups are unaligned
        writer.write_bit(true);
        for n in &numbers {
            write_uvarint_bits(*n, &mut writer);
        }

        let mut buf = vec![0u8; writer.size_in_bytes()];
        writer.copy_to(&mut buf);

        let mut cursor: NomBitInput = (&buf, 1);
        for n in numbers {
            let (new_cursor, value) = read_uvarint_bits(cursor).unwrap();
            cursor = new_cursor;
            assert_eq!(value, n);
        }
    }

    #[test]
    fn test_zigzag() {
        for v in [0i64, -1, 1, -2, 2, i64::MIN, i64::MAX, -123456789] {
            assert_eq!(zigzag_decode(zigzag_encode(v)), v);
        }
    }
}
