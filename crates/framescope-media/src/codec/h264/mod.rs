//! H.264 / AVC bitstream parsing.

mod nal;
mod slice;
mod sps;

pub use nal::{remove_emulation_prevention, NalUnitType};
pub use slice::classify_slice;
pub use sps::{parse_sps, Sps};
