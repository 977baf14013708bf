//! ADTS (AAC) payload reader.

use tracing::{trace, warn};

use super::{EsEvent, PayloadReader, SampleClock, ScanBuffer};
use crate::bits::BitCursor;
use crate::mp4::AAC_SAMPLE_RATES;
use crate::track::{AudioConfig, Frame, FrameType, TrackConfig};
use crate::{Error, Result};

/// PCM samples per AAC raw data block.
const SAMPLES_PER_BLOCK: u32 = 1024;

/// Decoded ADTS frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct AdtsHeader {
    /// MPEG-4 audio object type (profile + 1).
    pub audio_object_type: u8,
    pub sample_rate_index: u8,
    pub sample_rate: u32,
    pub channel_config: u8,
    pub protection_absent: bool,
    /// Whole frame length, header included.
    pub frame_length: usize,
    pub raw_data_blocks: u8,
}

impl AdtsHeader {
    /// Fixed header bytes without CRC.
    pub const MIN_LEN: usize = 7;

    /// Whether the two bytes start an ADTS header (sync word, layer 0).
    pub fn is_sync(b0: u8, b1: u8) -> bool {
        b0 == 0xFF && b1 & 0xF6 == 0xF0
    }

    /// Parse the header at the front of `data` (at least 7 bytes).
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::MIN_LEN {
            return Err(Error::BitstreamExhausted {
                need: Self::MIN_LEN * 8,
                have: data.len() * 8,
            });
        }
        if !Self::is_sync(data[0], data[1]) {
            return Err(Error::invalid_bitstream("missing ADTS sync word"));
        }

        let mut bits = BitCursor::new(&data[..Self::MIN_LEN]);
        // syncword, id, layer
        bits.skip_bits(12 + 1 + 2)?;
        let protection_absent = bits.read_bool()?;
        let profile = bits.read_bits(2)? as u8;
        let sample_rate_index = bits.read_bits(4)? as u8;
        // private_bit
        bits.skip_bits(1)?;
        let channel_config = bits.read_bits(3)? as u8;
        // original_copy, home, copyright id bit and start
        bits.skip_bits(4)?;
        let frame_length = bits.read_bits(13)? as usize;
        // buffer_fullness
        bits.skip_bits(11)?;
        let raw_data_blocks = bits.read_bits(2)? as u8;

        let sample_rate = AAC_SAMPLE_RATES
            .get(sample_rate_index as usize)
            .copied()
            .ok_or_else(|| {
                Error::invalid_bitstream(format!("ADTS sample rate index {sample_rate_index}"))
            })?;

        let header = Self {
            audio_object_type: profile + 1,
            sample_rate_index,
            sample_rate,
            channel_config,
            protection_absent,
            frame_length,
            raw_data_blocks,
        };
        if frame_length < header.header_len() {
            return Err(Error::invalid_bitstream(format!(
                "ADTS frame length {frame_length} shorter than its header"
            )));
        }
        Ok(header)
    }

    /// Header length, 9 bytes when a CRC follows.
    pub fn header_len(&self) -> usize {
        if self.protection_absent {
            7
        } else {
            9
        }
    }

    /// PCM samples carried by the frame.
    pub fn samples(&self) -> u32 {
        SAMPLES_PER_BLOCK * (self.raw_data_blocks as u32 + 1)
    }

    pub fn channels(&self) -> u16 {
        match self.channel_config {
            7 => 8,
            n => n as u16,
        }
    }

    fn config(&self) -> AudioConfig {
        AudioConfig {
            codec: format!("mp4a.40.{}", self.audio_object_type),
            sample_rate: self.sample_rate,
            channels: self.channels(),
            samples_per_frame: Some(self.samples()),
            bitrate: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
enum State {
    #[default]
    FindSync,
    /// Sync found; carries the clock as it stood there.
    ReadHeader(SampleClock),
    ReadFrame(AdtsHeader, SampleClock),
}

/// Splits an ADTS byte stream into AAC access units.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct AdtsReader {
    buffer: ScanBuffer,
    state: State,
    clock: SampleClock,
    config: Option<AudioConfig>,
    emit_offsets: bool,
}

impl AdtsReader {
    pub fn new(emit_offsets: bool) -> Self {
        Self {
            emit_offsets,
            ..Default::default()
        }
    }

    /// Advance the state machine once; `false` means more bytes are needed.
    fn step(&mut self, events: &mut Vec<EsEvent>) -> bool {
        let data = self.buffer.pending();
        match self.state {
            State::FindSync => {
                let found = data.windows(2).position(|w| AdtsHeader::is_sync(w[0], w[1]));
                match found {
                    Some(skip) => {
                        if skip > 0 {
                            trace!(skip, "ADTS resync");
                        }
                        self.buffer.advance(skip);
                        self.state = State::ReadHeader(self.clock);
                        true
                    }
                    None => {
                        // Keep a trailing 0xFF that may start the next sync word.
                        let drop = data.len() - usize::from(data.last() == Some(&0xFF));
                        self.buffer.advance(drop);
                        false
                    }
                }
            }
            State::ReadHeader(started) => {
                if data.len() < AdtsHeader::MIN_LEN {
                    return false;
                }
                match AdtsHeader::parse(data) {
                    Ok(header) => self.state = State::ReadFrame(header, started),
                    Err(e) => {
                        warn!("skipping bad ADTS header: {}", e);
                        self.buffer.advance(1);
                        self.state = State::FindSync;
                    }
                }
                true
            }
            State::ReadFrame(header, started) => {
                if data.len() < header.frame_length {
                    return false;
                }

                let config = header.config();
                if self.config.as_ref() != Some(&config) {
                    events.push(EsEvent::Config(TrackConfig::Audio(config.clone())));
                    self.config = Some(config);
                }

                let mut frame = Frame::new(
                    FrameType::I,
                    started.time_us(header.sample_rate),
                    header.frame_length as u32,
                )
                .with_duration(header.samples() as f64 * 1_000_000.0 / header.sample_rate as f64);
                if self.emit_offsets {
                    frame = frame.with_byte_offset(self.buffer.position());
                }
                events.push(EsEvent::Frame(frame));

                // A frame begun under an earlier timestamp does not count
                // against the one that replaced it.
                if started == self.clock {
                    self.clock.advance(header.samples());
                }
                self.buffer.advance(header.frame_length);
                self.state = State::FindSync;
                true
            }
        }
    }
}

impl PayloadReader for AdtsReader {
    fn push(&mut self, data: &[u8]) {
        self.buffer.push(data);
    }

    fn skip_input(&mut self, len: u64) {
        self.buffer.discard(len);
        self.state = State::FindSync;
    }

    fn consume(&mut self, timestamp_us: i64, events: &mut Vec<EsEvent>) {
        self.clock.rebase(timestamp_us);
        while self.step(events) {}
    }

    fn flush(&mut self, timestamp_us: i64, events: &mut Vec<EsEvent>) {
        // Frames may straddle payload units, so partial data stays buffered.
        self.consume(timestamp_us, events);
    }

    fn pending_len(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// AAC-LC, 8 kHz mono ADTS frame of `len` bytes without CRC.
    fn adts_frame(len: usize) -> Vec<u8> {
        let sf = 11u8;
        let ch = 1u8;
        let fullness = 0x7FFu16;
        let mut v = vec![
            0xFF,
            0xF1,
            (1 << 6) | (sf << 2) | (ch >> 2),
            ((ch & 3) << 6) | ((len >> 11) as u8 & 0x03),
            ((len >> 3) & 0xFF) as u8,
            (((len & 7) as u8) << 5) | (fullness >> 6) as u8,
            (((fullness & 0x3F) as u8) << 2),
        ];
        v.resize(len, 0xAA);
        v
    }

    fn frames(events: &[EsEvent]) -> Vec<&Frame> {
        events
            .iter()
            .filter_map(|e| match e {
                EsEvent::Frame(f) => Some(f),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_parse_header() {
        let header = AdtsHeader::parse(&adts_frame(20)).unwrap();
        assert_eq!(header.audio_object_type, 2);
        assert_eq!(header.sample_rate, 8000);
        assert_eq!(header.channels(), 1);
        assert_eq!(header.frame_length, 20);
        assert_eq!(header.header_len(), 7);
        assert_eq!(header.samples(), 1024);
    }

    #[test]
    fn test_reject_bad_sample_rate_index() {
        let mut data = adts_frame(20);
        data[2] = (1 << 6) | (13 << 2);
        assert!(matches!(
            AdtsHeader::parse(&data),
            Err(Error::InvalidBitstream(_))
        ));
    }

    #[test]
    fn test_two_frames_one_push() {
        let mut reader = AdtsReader::new(true);
        let mut events = Vec::new();
        let mut data = adts_frame(20);
        data.extend(adts_frame(30));
        reader.push(&data);
        reader.consume(0, &mut events);

        assert!(matches!(events[0], EsEvent::Config(_)));
        let frames = frames(&events);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].decode_time_us - frames[0].decode_time_us, 128_000);
        assert_eq!(frames[0].byte_offset, Some(0));
        assert_eq!(frames[1].byte_offset, Some(20));
        assert_eq!(frames[1].size, 30);
        assert_eq!(reader.pending_len(), 0);
    }

    #[test]
    fn test_resync_after_garbage() {
        let mut reader = AdtsReader::new(true);
        let mut events = Vec::new();
        let mut data = vec![0x00, 0xFF, 0x12];
        data.extend(adts_frame(16));
        reader.push(&data);
        reader.consume(0, &mut events);

        let frames = frames(&events);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].byte_offset, Some(3));
    }

    #[test]
    fn test_partial_frame_waits() {
        let mut reader = AdtsReader::new(false);
        let mut events = Vec::new();
        let frame = adts_frame(40);
        reader.push(&frame[..25]);
        reader.consume(0, &mut events);
        assert!(frames(&events).is_empty());
        assert_eq!(reader.pending_len(), 25);

        reader.push(&frame[25..]);
        reader.consume(0, &mut events);
        assert_eq!(frames(&events).len(), 1);
        assert_eq!(frames(&events)[0].byte_offset, None);
    }

    #[test]
    fn test_frame_spanning_units_keeps_its_start_time() {
        let mut reader = AdtsReader::new(false);
        let mut events = Vec::new();
        let second = adts_frame(60);

        let mut first_unit = adts_frame(40);
        first_unit.extend_from_slice(&second[..10]);
        reader.push(&first_unit);
        reader.consume(0, &mut events);

        // The next unit's timestamp belongs to the first frame starting in it.
        let mut second_unit = second[10..].to_vec();
        second_unit.extend(adts_frame(40));
        reader.push(&second_unit);
        reader.consume(256_000, &mut events);

        let dts: Vec<_> = frames(&events).iter().map(|f| f.decode_time_us).collect();
        assert_eq!(dts, vec![0, 128_000, 256_000]);
    }
}
