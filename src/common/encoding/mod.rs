mod uvarint;
mod varbit_ts;
mod varbit_xor;

/// Bit-level decode cursor: a byte slice plus a bit offset into its first
/// byte. This is what `nom`'s bit parsers consume and return.
pub type NomBitInput<'a> = (&'a [u8], usize);

pub use uvarint::*;
pub use varbit_ts::*;
pub use varbit_xor::*;
