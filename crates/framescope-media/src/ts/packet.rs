//! 188-byte transport packet header and adaptation field.

use crate::bits::BitCursor;
use crate::{Error, Result};

pub const PACKET_SIZE: usize = 188;
pub const SYNC_BYTE: u8 = 0x47;

/// Program Association Table.
pub const PAT_PID: u16 = 0x0000;
/// Null (stuffing) packets.
pub const NULL_PID: u16 = 0x1FFF;

const HEADER_SIZE: usize = 4;

/// Fixed 4-byte packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct PacketHeader {
    pub transport_error: bool,
    pub payload_unit_start: bool,
    pub pid: u16,
    pub scrambling_control: u8,
    pub has_adaptation_field: bool,
    pub has_payload: bool,
    pub continuity_counter: u8,
}

impl PacketHeader {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut bits = BitCursor::new(data.get(..HEADER_SIZE).unwrap_or(data));
        if bits.read_u8()? != SYNC_BYTE {
            return Err(Error::invalid_bitstream("packet does not start with 0x47"));
        }
        let transport_error = bits.read_bool()?;
        let payload_unit_start = bits.read_bool()?;
        // transport_priority
        bits.skip_bits(1)?;
        let pid = bits.read_bits(13)? as u16;
        let scrambling_control = bits.read_bits(2)? as u8;
        let adaptation_field_control = bits.read_bits(2)?;
        let continuity_counter = bits.read_bits(4)? as u8;

        Ok(Self {
            transport_error,
            payload_unit_start,
            pid,
            scrambling_control,
            has_adaptation_field: adaptation_field_control & 0b10 != 0,
            has_payload: adaptation_field_control & 0b01 != 0,
            continuity_counter,
        })
    }
}

/// The parts of an adaptation field the demuxer looks at.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct AdaptationField {
    /// Bytes following the length byte.
    pub length: u8,
    pub discontinuity: bool,
    pub random_access: bool,
    /// Program clock reference in 27 MHz ticks.
    pub pcr: Option<u64>,
}

impl AdaptationField {
    /// Parse from the length byte onwards.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let Some(&length) = data.first() else {
            return Err(Error::invalid_bitstream("missing adaptation field length"));
        };
        let body = data.get(1..1 + length as usize).ok_or_else(|| {
            Error::invalid_bitstream(format!(
                "adaptation field length {length} overruns the packet"
            ))
        })?;
        let Some(&flags) = body.first() else {
            return Ok(Self {
                length,
                ..Default::default()
            });
        };

        let pcr = if flags & 0x10 != 0 && body.len() >= 7 {
            let mut bits = BitCursor::new(&body[1..7]);
            let base = (bits.read_bits(1)? as u64) << 32 | bits.read_bits(32)? as u64;
            bits.skip_bits(6)?;
            let extension = bits.read_bits(9)? as u64;
            Some(base * 300 + extension)
        } else {
            None
        };

        Ok(Self {
            length,
            discontinuity: flags & 0x80 != 0,
            random_access: flags & 0x40 != 0,
            pcr,
        })
    }
}

/// A parsed packet borrowing its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet<'a> {
    pub header: PacketHeader,
    pub adaptation_field: Option<AdaptationField>,
    pub payload: &'a [u8],
}

impl<'a> Packet<'a> {
    /// Parse one packet; `data` must be exactly [`PACKET_SIZE`] bytes.
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        if data.len() != PACKET_SIZE {
            return Err(Error::invalid_bitstream(format!(
                "transport packet of {} bytes",
                data.len()
            )));
        }
        let header = PacketHeader::parse(data)?;

        let mut payload_start = HEADER_SIZE;
        let adaptation_field = if header.has_adaptation_field {
            let field = AdaptationField::parse(&data[HEADER_SIZE..])?;
            payload_start += 1 + field.length as usize;
            Some(field)
        } else {
            None
        };

        let payload = if header.has_payload {
            &data[payload_start..]
        } else {
            &[]
        };

        Ok(Self {
            header,
            adaptation_field,
            payload,
        })
    }
}
