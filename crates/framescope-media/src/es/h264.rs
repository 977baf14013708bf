//! H.264 Annex-B payload reader.
//!
//! The stream is cut at every `00 00 01` start code. A unit spans from its
//! start code to the next one; the extra leading zero of a four-byte start
//! code belongs to the unit it introduces. Each slice NAL unit becomes one
//! frame stamped with the timestamp current when its start code was seen.

use tracing::{trace, warn};

use super::{EsEvent, PayloadReader, ScanBuffer};
use crate::codec::h264::{classify_slice, parse_sps, NalUnitType};
use crate::track::{Frame, FrameType, TrackConfig, VideoConfig};

/// Splits an Annex-B byte stream into NAL units.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct H264Reader {
    buffer: ScanBuffer,
    /// Start code length of the unit at the front of the buffer; 0 until the
    /// first start code is found.
    code_len: usize,
    unit_time_us: i64,
    /// Where the next start code search resumes, relative to the unit start.
    scan_from: usize,
    config: Option<VideoConfig>,
    emit_offsets: bool,
}

impl H264Reader {
    pub fn new(emit_offsets: bool) -> Self {
        Self {
            emit_offsets,
            ..Default::default()
        }
    }

    /// Current codec parameters, once an SPS has been seen.
    pub fn config(&self) -> Option<&VideoConfig> {
        self.config.as_ref()
    }

    fn begin_unit(&mut self, start: usize, code_at: usize, timestamp_us: i64) {
        self.buffer.advance(start);
        self.code_len = code_at + 3 - start;
        self.scan_from = self.code_len;
        self.unit_time_us = timestamp_us;
    }

    fn emit_front(&mut self, len: usize, events: &mut Vec<EsEvent>) {
        let offset = self.emit_offsets.then(|| self.buffer.position());
        let unit = &self.buffer.pending()[..len];
        handle_unit(
            unit,
            self.code_len,
            self.unit_time_us,
            offset,
            &mut self.config,
            events,
        );
    }
}

/// Index of the next `00 00 01` at or after `from`.
fn find_start_code(data: &[u8], from: usize) -> Option<usize> {
    data.get(from..)?
        .windows(3)
        .position(|w| w == [0, 0, 1])
        .map(|i| i + from)
}

/// Start of the start code found at `at`, including a fourth leading zero.
fn code_start(data: &[u8], at: usize) -> usize {
    if at > 0 && data[at - 1] == 0 {
        at - 1
    } else {
        at
    }
}

fn handle_unit(
    unit: &[u8],
    code_len: usize,
    time_us: i64,
    offset: Option<u64>,
    config: &mut Option<VideoConfig>,
    events: &mut Vec<EsEvent>,
) {
    let Some(&header) = unit.get(code_len) else {
        return;
    };
    let nal = &unit[code_len..];

    match NalUnitType::from_header(header) {
        NalUnitType::Sps => match parse_sps(nal) {
            Ok(sps) => {
                let video = VideoConfig::from(&sps);
                if config.as_ref() != Some(&video) {
                    events.push(EsEvent::Config(TrackConfig::Video(video.clone())));
                    *config = Some(video);
                }
            }
            Err(e) => warn!("ignoring undecodable SPS: {}", e),
        },
        nal_type if nal_type.carries_slice_header() => {
            let frame_type = classify_slice(nal).unwrap_or_else(|e| {
                warn!(?nal_type, "unclassifiable slice: {}", e);
                FrameType::Unknown
            });
            let mut frame = Frame::new(frame_type, time_us, unit.len() as u32);
            if let Some(offset) = offset {
                frame = frame.with_byte_offset(offset);
            }
            events.push(EsEvent::Frame(frame));
        }
        nal_type => trace!(?nal_type, size = unit.len(), "NAL unit skipped"),
    }
}

impl PayloadReader for H264Reader {
    fn push(&mut self, data: &[u8]) {
        self.buffer.push(data);
    }

    fn skip_input(&mut self, len: u64) {
        self.buffer.discard(len);
        self.code_len = 0;
        self.scan_from = 0;
    }

    fn consume(&mut self, timestamp_us: i64, events: &mut Vec<EsEvent>) {
        loop {
            let data = self.buffer.pending();
            if self.code_len == 0 {
                match find_start_code(data, 0) {
                    Some(at) => {
                        let start = code_start(data, at);
                        if start > 0 {
                            trace!(skip = start, "bytes before first start code");
                        }
                        self.begin_unit(start, at, timestamp_us);
                    }
                    None => {
                        // A start code may still straddle the next push.
                        let drop = data.len().saturating_sub(3);
                        self.buffer.advance(drop);
                        return;
                    }
                }
                continue;
            }

            match find_start_code(data, self.scan_from) {
                Some(at) => {
                    let end = code_start(data, at);
                    self.emit_front(end, events);
                    // The next unit now starts at the front.
                    self.begin_unit(end, at, timestamp_us);
                }
                None => {
                    self.scan_from = data.len().saturating_sub(2).max(self.code_len);
                    return;
                }
            }
        }
    }

    fn flush(&mut self, timestamp_us: i64, events: &mut Vec<EsEvent>) {
        self.consume(timestamp_us, events);
        if self.code_len > 0 {
            let len = self.buffer.len();
            self.emit_front(len, events);
            self.buffer.advance(len);
        }
        self.code_len = 0;
        self.scan_from = 0;
    }

    fn pending_len(&self) -> usize {
        self.buffer.len()
    }
}
