pub mod bitwriter;
pub mod encoding;
pub mod time;
pub mod types;

pub use encoding::NomBitInput;
pub use time::{current_time_millis, current_time_secs};
