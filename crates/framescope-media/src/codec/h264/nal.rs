//! H.264 NAL unit types and RBSP extraction.

/// H.264 NAL unit types (ISO/IEC 14496-10 table 7-1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NalUnitType {
    /// Coded slice of a non-IDR picture
    Slice,
    /// Coded slice data partition A
    PartitionA,
    /// Coded slice data partition B
    PartitionB,
    /// Coded slice data partition C
    PartitionC,
    /// Coded slice of an IDR picture
    Idr,
    /// Supplemental enhancement information
    Sei,
    /// Sequence parameter set
    Sps,
    /// Picture parameter set
    Pps,
    /// Access unit delimiter
    Aud,
    EndOfSequence,
    EndOfStream,
    Filler,
    Other(u8),
}

impl NalUnitType {
    /// Decode from the first byte of a NAL unit.
    pub fn from_header(byte: u8) -> Self {
        match byte & 0x1F {
            1 => Self::Slice,
            2 => Self::PartitionA,
            3 => Self::PartitionB,
            4 => Self::PartitionC,
            5 => Self::Idr,
            6 => Self::Sei,
            7 => Self::Sps,
            8 => Self::Pps,
            9 => Self::Aud,
            10 => Self::EndOfSequence,
            11 => Self::EndOfStream,
            12 => Self::Filler,
            other => Self::Other(other),
        }
    }

    /// Whether the unit starts with a slice header.
    pub fn carries_slice_header(&self) -> bool {
        matches!(self, Self::Slice | Self::PartitionA | Self::Idr)
    }
}

/// Strip emulation prevention bytes (`00 00 03` -> `00 00`).
pub fn remove_emulation_prevention(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut zeros = 0usize;

    for &byte in data {
        if zeros >= 2 && byte == 0x03 {
            zeros = 0;
            continue;
        }
        if byte == 0 {
            zeros += 1;
        } else {
            zeros = 0;
        }
        out.push(byte);
    }

    out
}
