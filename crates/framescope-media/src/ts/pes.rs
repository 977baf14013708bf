//! PES reassembly and 33-bit timestamps.
//!
//! A [`PesStream`] receives the packet payloads of one PID. The header of
//! each PES packet is parsed (buffered if it straddles transport packets),
//! its timestamps are unwrapped onto a continuous timeline, and the
//! remaining bytes go verbatim to the stream's payload reader.

use tracing::{trace, warn};

use crate::es::{EsEvent, EsReader, PayloadReader};
use crate::track::ticks_to_micros;
use crate::{Error, Result};

/// PES timestamps tick at 90 kHz.
pub const PES_TIMESCALE: u32 = 90_000;

/// Timestamps wrap at 2^33 ticks.
pub const TIMESTAMP_WRAP: i64 = 1 << 33;

const START_CODE: [u8; 3] = [0x00, 0x00, 0x01];
const FIXED_HEADER: usize = 6;
const OPTIONAL_HEADER: usize = 3;

/// Decode a 5-byte PTS/DTS field into its 33-bit value.
pub fn decode_timestamp(b: &[u8; 5]) -> u64 {
    (b[0] as u64 >> 1 & 0x07) << 30
        | (b[1] as u64) << 22
        | (b[2] as u64 >> 1) << 15
        | (b[3] as u64) << 7
        | b[4] as u64 >> 1
}

/// Encode a 33-bit value as a 5-byte PTS/DTS field with the given 4-bit
/// prefix (`0b0010` PTS only, `0b0011` PTS with DTS, `0b0001` DTS).
pub fn encode_timestamp(prefix: u8, value: u64) -> [u8; 5] {
    let value = value & (TIMESTAMP_WRAP as u64 - 1);
    [
        prefix << 4 | ((value >> 30) as u8 & 0x07) << 1 | 1,
        (value >> 22) as u8,
        ((value >> 15) as u8) << 1 | 1,
        (value >> 7) as u8,
        (value as u8) << 1 | 1,
    ]
}

/// Place a raw 33-bit timestamp on the unwrapped timeline nearest to
/// `reference`.
pub fn unwrap_timestamp(raw: u64, reference: Option<i64>) -> i64 {
    let raw = (raw & (TIMESTAMP_WRAP as u64 - 1)) as i64;
    match reference {
        None => raw,
        Some(reference) => {
            let wraps = (reference - raw + TIMESTAMP_WRAP / 2).div_euclid(TIMESTAMP_WRAP);
            raw + wraps * TIMESTAMP_WRAP
        }
    }
}

/// Streams whose packets have no optional header (and so no timestamps).
fn has_optional_header(stream_id: u8) -> bool {
    !matches!(stream_id, 0xBC | 0xBE | 0xBF | 0xF0 | 0xF1 | 0xF2 | 0xF8 | 0xFF)
}

/// Decoded PES packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct PesHeader {
    pub stream_id: u8,
    /// PES_packet_length; 0 means unbounded (video).
    pub packet_length: u16,
    pub pts: Option<u64>,
    pub dts: Option<u64>,
    /// Bytes before the payload.
    pub header_len: usize,
}

impl PesHeader {
    /// Parse a header from the start of a PES packet. `Ok(None)` means more
    /// bytes are needed.
    pub fn parse(data: &[u8]) -> Result<Option<Self>> {
        let prefix = data.len().min(START_CODE.len());
        if data[..prefix] != START_CODE[..prefix] {
            return Err(Error::invalid_bitstream("PES packet without start code"));
        }
        if data.len() < FIXED_HEADER {
            return Ok(None);
        }

        let stream_id = data[3];
        let packet_length = u16::from_be_bytes([data[4], data[5]]);
        if !has_optional_header(stream_id) {
            return Ok(Some(Self {
                stream_id,
                packet_length,
                pts: None,
                dts: None,
                header_len: FIXED_HEADER,
            }));
        }

        if data.len() < FIXED_HEADER + OPTIONAL_HEADER {
            return Ok(None);
        }
        let flags = data[7] >> 6;
        let header_data_length = data[8] as usize;
        let header_len = FIXED_HEADER + OPTIONAL_HEADER + header_data_length;
        if data.len() < header_len {
            return Ok(None);
        }

        let fields = &data[FIXED_HEADER + OPTIONAL_HEADER..header_len];
        let timestamp = |at: usize| -> Result<u64> {
            fields
                .get(at..at + 5)
                .and_then(|b| <&[u8; 5]>::try_from(b).ok())
                .map(decode_timestamp)
                .ok_or_else(|| Error::invalid_bitstream("PES timestamp overruns its header"))
        };
        let (pts, dts) = match flags {
            0b10 => (Some(timestamp(0)?), None),
            0b11 => (Some(timestamp(0)?), Some(timestamp(5)?)),
            0b01 => return Err(Error::invalid_bitstream("forbidden PTS_DTS_flags value")),
            _ => (None, None),
        };

        Ok(Some(Self {
            stream_id,
            packet_length,
            pts,
            dts,
            header_len,
        }))
    }
}

/// Reassembly state for one elementary stream PID.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct PesStream {
    reader: EsReader,
    /// Header bytes gathered so far; `Some` until the header is complete.
    header: Option<Vec<u8>>,
    /// A payload unit start has been seen.
    synced: bool,
    /// Last unwrapped DTS in 90 kHz ticks.
    last_dts: Option<i64>,
    decode_time_us: i64,
    composition_offset_us: i64,
    /// Decode time and composition offset of the unit before the current one.
    previous_unit: Option<(i64, i64)>,
}

impl PesStream {
    pub fn new(reader: EsReader) -> Self {
        Self {
            reader,
            header: None,
            synced: false,
            last_dts: None,
            decode_time_us: 0,
            composition_offset_us: 0,
            previous_unit: None,
        }
    }

    /// Decode time of the current unit.
    pub fn decode_time_us(&self) -> i64 {
        self.decode_time_us
    }

    /// Bytes held by the payload reader.
    pub fn pending_len(&self) -> usize {
        self.reader.pending_len()
    }

    /// Feed the payload of one transport packet.
    pub fn push_packet(&mut self, unit_start: bool, payload: &[u8], events: &mut Vec<EsEvent>) {
        let first = events.len();

        if unit_start {
            if self.synced {
                // The reader must see the end of a unit before timestamps move on.
                self.reader.flush(self.decode_time_us, events);
            }
            self.synced = true;
            self.header = Some(Vec::new());
        }
        if !self.synced {
            trace!(len = payload.len(), "payload before first unit start");
            return;
        }

        match self.header.take() {
            Some(mut header) => {
                header.extend_from_slice(payload);
                match PesHeader::parse(&header) {
                    Ok(Some(parsed)) => {
                        self.start_unit(&parsed);
                        self.reader.push(&header[parsed.header_len..]);
                        self.reader.consume(self.decode_time_us, events);
                    }
                    Ok(None) => self.header = Some(header),
                    Err(e) => {
                        warn!("dropping PES packet: {}", e);
                        self.synced = false;
                    }
                }
            }
            None => {
                self.reader.push(payload);
                self.reader.consume(self.decode_time_us, events);
            }
        }

        self.stamp(&mut events[first..]);
    }

    /// End of stream: emit whatever the reader still holds.
    pub fn flush(&mut self, events: &mut Vec<EsEvent>) {
        let first = events.len();
        if self.synced {
            self.reader.flush(self.decode_time_us, events);
        }
        self.stamp(&mut events[first..]);
    }

    fn start_unit(&mut self, header: &PesHeader) {
        let Some(pts) = header.pts else {
            // No timestamps: the unit continues the previous timing.
            return;
        };
        let dts = unwrap_timestamp(header.dts.unwrap_or(pts), self.last_dts);
        let pts = unwrap_timestamp(pts, Some(dts));
        self.last_dts = Some(dts);

        self.previous_unit = Some((self.decode_time_us, self.composition_offset_us));
        self.decode_time_us = ticks_to_micros(dts, PES_TIMESCALE);
        self.composition_offset_us = ticks_to_micros(pts - dts, PES_TIMESCALE);
    }

    /// Attach the composition offset of the unit a frame was timed from.
    fn stamp(&self, events: &mut [EsEvent]) {
        for event in events {
            let EsEvent::Frame(frame) = event else {
                continue;
            };
            if frame.decode_time_us == self.decode_time_us {
                frame.presentation_time_offset_us = self.composition_offset_us;
            } else if let Some((dts, offset)) = self.previous_unit {
                if frame.decode_time_us == dts {
                    frame.presentation_time_offset_us = offset;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::es::StreamCodec;
    use crate::track::FrameType;

    fn pes_header(pts: Option<u64>, dts: Option<u64>) -> Vec<u8> {
        let mut fields = Vec::new();
        let flags = match (pts, dts) {
            (Some(p), Some(d)) => {
                fields.extend(encode_timestamp(0b0011, p));
                fields.extend(encode_timestamp(0b0001, d));
                0b11
            }
            (Some(p), None) => {
                fields.extend(encode_timestamp(0b0010, p));
                0b10
            }
            _ => 0b00,
        };
        let mut h = vec![0x00, 0x00, 0x01, 0xE0, 0x00, 0x00, 0x80, flags << 6];
        h.push(fields.len() as u8);
        h.extend(fields);
        h
    }

    #[test]
    fn test_timestamp_at_wrap_boundary() {
        let max = (1u64 << 33) - 1;
        let encoded = encode_timestamp(0b0010, max);
        assert_eq!(decode_timestamp(&encoded), max);
        assert_eq!(decode_timestamp(&encode_timestamp(0b0010, 0)), 0);
        assert_eq!(decode_timestamp(&encode_timestamp(0b0011, 0x1_2345_6789)), 0x1_2345_6789);
    }

    #[test]
    fn test_unwrap_crosses_boundary() {
        let max = (1u64 << 33) - 1;
        let before = unwrap_timestamp(max - 3000, None);
        let after = unwrap_timestamp(3000, Some(before));
        assert_eq!(after - before, 6001);
        // Small backwards steps stay backwards.
        assert_eq!(unwrap_timestamp(100, Some(200)), 100);
        assert_eq!(unwrap_timestamp(max, Some(10)), -1);
    }

    #[test]
    fn test_parse_header_variants() {
        let header = PesHeader::parse(&pes_header(Some(90_000), Some(87_000)))
            .unwrap()
            .unwrap();
        assert_eq!(header.stream_id, 0xE0);
        assert_eq!(header.pts, Some(90_000));
        assert_eq!(header.dts, Some(87_000));
        assert_eq!(header.header_len, 19);

        let partial = pes_header(Some(1), None);
        assert_eq!(PesHeader::parse(&partial[..10]).unwrap(), None);
        assert!(PesHeader::parse(&[0x00, 0x01, 0x00]).is_err());

        let padding = PesHeader::parse(&[0x00, 0x00, 0x01, 0xBE, 0x00, 0x10])
            .unwrap()
            .unwrap();
        assert_eq!(padding.header_len, 6);
    }

    #[test]
    fn test_header_split_across_packets() {
        let mut stream = PesStream::new(StreamCodec::Opaque.reader(false));
        let mut events = Vec::new();
        let mut unit = pes_header(Some(180_000), None);
        unit.extend_from_slice(&[0xAB; 20]);

        stream.push_packet(true, &unit[..5], &mut events);
        stream.push_packet(false, &unit[5..], &mut events);
        stream.flush(&mut events);

        assert_eq!(stream.decode_time_us(), 2_000_000);
        match &events[..] {
            [EsEvent::Frame(f)] => {
                assert_eq!(f.size, 20);
                assert_eq!(f.decode_time_us, 2_000_000);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_flush_on_unit_start_uses_previous_time() {
        let mut stream = PesStream::new(StreamCodec::Opaque.reader(false));
        let mut events = Vec::new();

        let mut first = pes_header(Some(93_000), Some(90_000));
        first.extend_from_slice(&[1; 10]);
        let mut second = pes_header(Some(96_000), Some(93_000));
        second.extend_from_slice(&[2; 30]);

        stream.push_packet(false, &[0xFF; 8], &mut events);
        stream.push_packet(true, &first, &mut events);
        stream.push_packet(true, &second, &mut events);
        stream.flush(&mut events);

        let frames: Vec<_> = events
            .iter()
            .map(|e| match e {
                EsEvent::Frame(f) => (
                    f.frame_type,
                    f.size,
                    f.decode_time_us,
                    f.presentation_time_offset_us,
                ),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(
            frames,
            vec![
                (FrameType::Unknown, 10, 1_000_000, 33_333),
                (FrameType::Unknown, 30, 1_033_333, 33_333),
            ]
        );
    }
}
