//! MPEG-1/2/2.5 audio (Layer I, II, III) payload reader.

use tracing::{trace, warn};

use super::{EsEvent, PayloadReader, SampleClock, ScanBuffer};
use crate::track::{AudioConfig, Frame, FrameType, TrackConfig};
use crate::{Error, Result};

/// Bitrates in kbit/s indexed by `[table][bitrate_index]`.
const BITRATES: [[u16; 15]; 5] = [
    // MPEG-1 Layer I
    [0, 32, 64, 96, 128, 160, 192, 224, 256, 288, 320, 352, 384, 416, 448],
    // MPEG-1 Layer II
    [0, 32, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384],
    // MPEG-1 Layer III
    [0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320],
    // MPEG-2/2.5 Layer I
    [0, 32, 48, 56, 64, 80, 96, 112, 128, 144, 160, 176, 192, 224, 256],
    // MPEG-2/2.5 Layer II and III
    [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160],
];

const SAMPLE_RATES: [[u32; 3]; 3] = [
    [44100, 48000, 32000],
    [22050, 24000, 16000],
    [11025, 12000, 8000],
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum MpegVersion {
    Mpeg1,
    Mpeg2,
    Mpeg25,
}

/// Decoded 4-byte MPEG audio frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct MpegAudioHeader {
    pub version: MpegVersion,
    /// 1, 2 or 3.
    pub layer: u8,
    pub bitrate: u32,
    pub sample_rate: u32,
    pub channels: u16,
    pub padding: bool,
    pub frame_length: usize,
    pub samples_per_frame: u32,
}

impl MpegAudioHeader {
    pub const LEN: usize = 4;

    /// Whether the bytes carry the 11-bit frame sync plus a valid version
    /// and layer.
    pub fn is_sync(b0: u8, b1: u8) -> bool {
        b0 == 0xFF && b1 & 0xE0 == 0xE0 && b1 & 0x18 != 0x08 && b1 & 0x06 != 0
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::LEN {
            return Err(Error::BitstreamExhausted {
                need: Self::LEN * 8,
                have: data.len() * 8,
            });
        }
        if !Self::is_sync(data[0], data[1]) {
            return Err(Error::invalid_bitstream("missing MPEG audio frame sync"));
        }

        let version = match (data[1] >> 3) & 0x03 {
            0 => MpegVersion::Mpeg25,
            2 => MpegVersion::Mpeg2,
            _ => MpegVersion::Mpeg1,
        };
        let layer = 4 - ((data[1] >> 1) & 0x03);
        let bitrate_index = (data[2] >> 4) as usize;
        let rate_index = ((data[2] >> 2) & 0x03) as usize;
        let padding = data[2] & 0x02 != 0;
        let mono = data[3] >> 6 == 0x03;

        if bitrate_index == 0 || bitrate_index == 15 {
            return Err(Error::invalid_bitstream(format!(
                "unsupported MPEG audio bitrate index {bitrate_index}"
            )));
        }
        if rate_index == 3 {
            return Err(Error::invalid_bitstream("reserved MPEG audio sample rate"));
        }

        let table = match (version, layer) {
            (MpegVersion::Mpeg1, l) => (l - 1) as usize,
            (_, 1) => 3,
            _ => 4,
        };
        let bitrate = BITRATES[table][bitrate_index] as u32 * 1000;
        let sample_rate = match version {
            MpegVersion::Mpeg1 => SAMPLE_RATES[0][rate_index],
            MpegVersion::Mpeg2 => SAMPLE_RATES[1][rate_index],
            MpegVersion::Mpeg25 => SAMPLE_RATES[2][rate_index],
        };
        let samples_per_frame = match (layer, version) {
            (1, _) => 384,
            (2, _) | (3, MpegVersion::Mpeg1) => 1152,
            _ => 576,
        };

        let frame_length = if layer == 1 {
            (12 * bitrate / sample_rate + padding as u32) * 4
        } else {
            samples_per_frame / 8 * bitrate / sample_rate + padding as u32
        } as usize;

        Ok(Self {
            version,
            layer,
            bitrate,
            sample_rate,
            channels: if mono { 1 } else { 2 },
            padding,
            frame_length,
            samples_per_frame,
        })
    }

    fn config(&self) -> AudioConfig {
        AudioConfig {
            codec: format!("mp{}", self.layer),
            sample_rate: self.sample_rate,
            channels: self.channels,
            samples_per_frame: Some(self.samples_per_frame),
            bitrate: Some(self.bitrate),
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
    ReadFrame(MpegAudioHeader, SampleClock),
}

/// Splits an MPEG audio byte stream into frames.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct MpegAudioReader {
    buffer: ScanBuffer,
    state: State,
    clock: SampleClock,
    config: Option<AudioConfig>,
    emit_offsets: bool,
}

impl MpegAudioReader {
    pub fn new(emit_offsets: bool) -> Self {
        Self {
            emit_offsets,
            ..Default::default()
        }
    }

    fn step(&mut self, events: &mut Vec<EsEvent>) -> bool {
        let data = self.buffer.pending();
        match self.state {
            State::FindSync => {
                match data
                    .windows(2)
                    .position(|w| MpegAudioHeader::is_sync(w[0], w[1]))
                {
                    Some(skip) => {
                        if skip > 0 {
                            trace!(skip, "MPEG audio resync");
                        }
                        self.buffer.advance(skip);
                        self.state = State::ReadHeader(self.clock);
                        true
                    }
                    None => {
                        let drop = data.len() - usize::from(data.last() == Some(&0xFF));
                        self.buffer.advance(drop);
                        false
                    }
                }
            }
            State::ReadHeader(started) => {
                if data.len() < MpegAudioHeader::LEN {
                    return false;
                }
                match MpegAudioHeader::parse(data) {
                    Ok(header) => self.state = State::ReadFrame(header, started),
                    Err(e) => {
                        warn!("skipping bad MPEG audio header: {}", e);
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

                let duration_us =
                    header.samples_per_frame as f64 * 1_000_000.0 / header.sample_rate as f64;
                let mut frame = Frame::new(
                    FrameType::I,
                    started.time_us(header.sample_rate),
                    header.frame_length as u32,
                )
                .with_duration(duration_us);
                if self.emit_offsets {
                    frame = frame.with_byte_offset(self.buffer.position());
                }
                events.push(EsEvent::Frame(frame));

                // A frame begun under an earlier timestamp does not count
                // against the one that replaced it.
                if started == self.clock {
                    self.clock.advance(header.samples_per_frame);
                }
                self.buffer.advance(header.frame_length.max(MpegAudioHeader::LEN));
                self.state = State::FindSync;
                true
            }
        }
    }
}

impl PayloadReader for MpegAudioReader {
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
        self.consume(timestamp_us, events);
    }

    fn pending_len(&self) -> usize {
        self.buffer.len()
    }
}
