//! Program Association and Program Map tables.

use bytes::Buf;

use crate::{Error, Result};

const PAT_TABLE_ID: u8 = 0x00;
const PMT_TABLE_ID: u8 = 0x02;

/// table_id through last_section_number.
const SECTION_HEADER: usize = 8;
const CRC_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct PatEntry {
    pub program_number: u16,
    pub pmt_pid: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct PmtStream {
    pub stream_type: u8,
    pub pid: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct Pmt {
    pub program_number: u16,
    pub pcr_pid: u16,
    pub streams: Vec<PmtStream>,
}

/// Locate a section in a payload-unit-start payload. Returns the
/// `table_id_extension` and the loop bytes between the header and the CRC.
fn section(payload: &[u8], table_id: u8) -> Result<(u16, &[u8])> {
    let pointer = *payload
        .first()
        .ok_or_else(|| Error::invalid_bitstream("empty PSI payload"))? as usize;
    let section = payload
        .get(1 + pointer..)
        .filter(|s| s.len() >= SECTION_HEADER)
        .ok_or_else(|| Error::invalid_bitstream("PSI pointer field overruns the packet"))?;

    if section[0] != table_id {
        return Err(Error::invalid_bitstream(format!(
            "expected table id {table_id:#04x}, found {:#04x}",
            section[0]
        )));
    }
    let section_length = ((section[1] as usize & 0x0F) << 8) | section[2] as usize;
    let end = 3 + section_length;
    if end > section.len() {
        return Err(Error::invalid_bitstream(format!(
            "section of {section_length} bytes continues past the packet"
        )));
    }
    if end < SECTION_HEADER + CRC_SIZE {
        return Err(Error::invalid_bitstream("section shorter than its header"));
    }

    let extension = u16::from_be_bytes([section[3], section[4]]);
    Ok((extension, &section[SECTION_HEADER..end - CRC_SIZE]))
}

/// Parse a PAT section. Entries for program 0 (network PID) are dropped.
pub fn parse_pat(payload: &[u8]) -> Result<Vec<PatEntry>> {
    let (_, mut body) = section(payload, PAT_TABLE_ID)?;
    let mut entries = Vec::with_capacity(body.len() / 4);
    while body.remaining() >= 4 {
        let program_number = body.get_u16();
        let pmt_pid = body.get_u16() & 0x1FFF;
        if program_number != 0 {
            entries.push(PatEntry {
                program_number,
                pmt_pid,
            });
        }
    }
    Ok(entries)
}

/// Parse a PMT section into its elementary stream list.
pub fn parse_pmt(payload: &[u8]) -> Result<Pmt> {
    let (program_number, mut body) = section(payload, PMT_TABLE_ID)?;
    if body.remaining() < 4 {
        return Err(Error::invalid_bitstream("PMT without program info"));
    }
    let pcr_pid = body.get_u16() & 0x1FFF;
    let program_info_length = (body.get_u16() & 0x0FFF) as usize;
    if program_info_length > body.remaining() {
        return Err(Error::invalid_bitstream("PMT program info overruns the section"));
    }
    body.advance(program_info_length);

    let mut streams = Vec::new();
    while body.remaining() >= 5 {
        let stream_type = body.get_u8();
        let pid = body.get_u16() & 0x1FFF;
        let es_info_length = (body.get_u16() & 0x0FFF) as usize;
        if es_info_length > body.remaining() {
            return Err(Error::invalid_bitstream(format!(
                "ES info of PID {pid} overruns the section"
            )));
        }
        body.advance(es_info_length);
        streams.push(PmtStream { stream_type, pid });
    }

    Ok(Pmt {
        program_number,
        pcr_pid,
        streams,
    })
}
