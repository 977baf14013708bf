//! Slice header classification.

use super::nal::remove_emulation_prevention;
use crate::bits::BitCursor;
use crate::track::FrameType;
use crate::{Error, Result};

/// Enough of a slice header to reach `slice_type` after EPB removal.
const SLICE_HEADER_PREFIX: usize = 16;

/// Classify a slice NAL unit (header byte included) by its `slice_type`.
///
/// Only `first_mb_in_slice` and `slice_type` are decoded. Values 5..=9
/// signal that every slice of the picture shares the type and map onto the
/// same classes as 0..=4.
pub fn classify_slice(nal: &[u8]) -> Result<FrameType> {
    if nal.len() < 2 {
        return Err(Error::invalid_bitstream("slice NAL unit without payload"));
    }

    let end = nal.len().min(1 + SLICE_HEADER_PREFIX);
    let rbsp = remove_emulation_prevention(&nal[1..end]);
    let mut reader = BitCursor::new(&rbsp);

    // first_mb_in_slice
    reader.skip_ue()?;
    let slice_type = reader.read_ue()?;
    if slice_type > 9 {
        return Err(Error::invalid_bitstream(format!(
            "slice_type {slice_type} out of range"
        )));
    }

    Ok(match slice_type % 5 {
        0 => FrameType::P,
        1 => FrameType::B,
        2 => FrameType::I,
        3 => FrameType::SP,
        _ => FrameType::SI,
    })
}
