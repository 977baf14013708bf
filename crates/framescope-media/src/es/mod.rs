//! Elementary-stream payload readers.
//!
//! A payload reader turns an accumulating byte stream into frame boundaries.
//! Bytes arrive through [`PayloadReader::push`]; [`PayloadReader::consume`]
//! scans as far as the buffered bytes allow and leaves any partial header or
//! frame buffered for the next call. Readers are selected per MPEG-TS stream
//! type through [`stream_type_info`].

mod adts;
mod h264;
mod mpeg_audio;

pub use adts::{AdtsHeader, AdtsReader};
pub use h264::H264Reader;
pub use mpeg_audio::{MpegAudioHeader, MpegAudioReader};

use crate::track::{ticks_to_micros, Frame, FrameType, TrackConfig, TrackKind};

/// Output of a payload reader.
#[derive(Debug, Clone, PartialEq)]
pub enum EsEvent {
    Frame(Frame),
    /// Codec parameters changed (first header, SPS, ...).
    Config(TrackConfig),
}

/// Incremental frame-boundary scanner for one elementary stream.
pub trait PayloadReader {
    /// Append payload bytes.
    fn push(&mut self, data: &[u8]);

    /// Account for `len` stream bytes that were never pushed.
    fn skip_input(&mut self, len: u64);

    /// Emit every unit complete in the buffer, timed from `timestamp_us`.
    fn consume(&mut self, timestamp_us: i64, events: &mut Vec<EsEvent>);

    /// The current payload unit is over; `timestamp_us` is its timestamp.
    fn flush(&mut self, timestamp_us: i64, events: &mut Vec<EsEvent>);

    /// Bytes held for a unit that is not complete yet.
    fn pending_len(&self) -> usize;
}

/// Byte buffer with a read position and stream offset bookkeeping.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct ScanBuffer {
    data: Vec<u8>,
    pos: usize,
    /// Stream offset of `data[0]`.
    base: u64,
}

impl ScanBuffer {
    pub fn push(&mut self, bytes: &[u8]) {
        if self.pos > 0 && self.pos * 2 >= self.data.len() {
            self.data.drain(..self.pos);
            self.base += self.pos as u64;
            self.pos = 0;
        }
        self.data.extend_from_slice(bytes);
    }

    /// Unread bytes.
    pub fn pending(&self) -> &[u8] {
        &self.data[self.pos..]
    }

    pub fn len(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mark `n` bytes as read.
    pub fn advance(&mut self, n: usize) {
        self.pos = (self.pos + n).min(self.data.len());
    }

    /// Stream offset of the first unread byte.
    pub fn position(&self) -> u64 {
        self.base + self.pos as u64
    }

    /// Drop everything buffered and move the stream offset past `extra`
    /// bytes that bypassed the buffer.
    pub fn discard(&mut self, extra: u64) {
        self.base += self.data.len() as u64 + extra;
        self.data.clear();
        self.pos = 0;
    }
}

/// Sample-accurate running clock for audio readers.
///
/// Audio frames arrive far more densely than PES timestamps, so each frame
/// is timed as the last seen timestamp plus the samples emitted since.
///
/// A frame whose sync word arrived before a timestamp change keeps the time
/// of the clock it started under.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct SampleClock {
    base_us: Option<i64>,
    samples: u64,
}

impl SampleClock {
    /// Restart counting from `timestamp_us` if it differs from the base.
    pub fn rebase(&mut self, timestamp_us: i64) {
        if self.base_us != Some(timestamp_us) {
            self.base_us = Some(timestamp_us);
            self.samples = 0;
        }
    }

    /// Timestamp of the next frame.
    pub fn time_us(&self, sample_rate: u32) -> i64 {
        self.base_us.unwrap_or(0) + ticks_to_micros(self.samples as i64, sample_rate)
    }

    pub fn advance(&mut self, samples: u32) {
        self.samples += samples as u64;
    }
}

/// Reader for streams with no known framing: one frame per payload unit.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct PassthroughReader {
    unit_bytes: u64,
    unit_start: u64,
    position: u64,
    emit_offsets: bool,
}

impl PassthroughReader {
    pub fn new(emit_offsets: bool) -> Self {
        Self {
            emit_offsets,
            ..Default::default()
        }
    }
}

impl PayloadReader for PassthroughReader {
    fn push(&mut self, data: &[u8]) {
        self.unit_bytes += data.len() as u64;
        self.position += data.len() as u64;
    }

    fn skip_input(&mut self, len: u64) {
        self.position += len;
        self.unit_start = self.position;
    }

    fn consume(&mut self, _timestamp_us: i64, _events: &mut Vec<EsEvent>) {}

    fn flush(&mut self, timestamp_us: i64, events: &mut Vec<EsEvent>) {
        if self.unit_bytes > 0 {
            let size = self.unit_bytes.min(u32::MAX as u64) as u32;
            let mut frame = Frame::new(FrameType::Unknown, timestamp_us, size);
            if self.emit_offsets {
                frame = frame.with_byte_offset(self.unit_start);
            }
            events.push(EsEvent::Frame(frame));
        }
        self.unit_bytes = 0;
        self.unit_start = self.position;
    }

    fn pending_len(&self) -> usize {
        0
    }
}

/// Reader chosen for a stream, dispatched without boxing.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum EsReader {
    Adts(AdtsReader),
    H264(H264Reader),
    MpegAudio(MpegAudioReader),
    Passthrough(PassthroughReader),
}

impl EsReader {
    fn inner(&mut self) -> &mut dyn PayloadReader {
        match self {
            Self::Adts(r) => r,
            Self::H264(r) => r,
            Self::MpegAudio(r) => r,
            Self::Passthrough(r) => r,
        }
    }
}

impl PayloadReader for EsReader {
    fn push(&mut self, data: &[u8]) {
        self.inner().push(data)
    }

    fn skip_input(&mut self, len: u64) {
        self.inner().skip_input(len)
    }

    fn consume(&mut self, timestamp_us: i64, events: &mut Vec<EsEvent>) {
        self.inner().consume(timestamp_us, events)
    }

    fn flush(&mut self, timestamp_us: i64, events: &mut Vec<EsEvent>) {
        self.inner().flush(timestamp_us, events)
    }

    fn pending_len(&self) -> usize {
        match self {
            Self::Adts(r) => r.pending_len(),
            Self::H264(r) => r.pending_len(),
            Self::MpegAudio(r) => r.pending_len(),
            Self::Passthrough(r) => r.pending_len(),
        }
    }
}

/// Payload framing of an elementary stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum StreamCodec {
    Adts,
    H264,
    MpegAudio,
    Opaque,
}

impl StreamCodec {
    /// A fresh reader for this framing.
    pub fn reader(self, emit_offsets: bool) -> EsReader {
        match self {
            Self::Adts => EsReader::Adts(AdtsReader::new(emit_offsets)),
            Self::H264 => EsReader::H264(H264Reader::new(emit_offsets)),
            Self::MpegAudio => EsReader::MpegAudio(MpegAudioReader::new(emit_offsets)),
            Self::Opaque => EsReader::Passthrough(PassthroughReader::new(emit_offsets)),
        }
    }
}

/// What an MPEG-TS stream type carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamTypeInfo {
    pub stream_type: u8,
    pub kind: TrackKind,
    pub mime_type: &'static str,
    pub codec: StreamCodec,
}

const fn info(
    stream_type: u8,
    kind: TrackKind,
    mime_type: &'static str,
    codec: StreamCodec,
) -> StreamTypeInfo {
    StreamTypeInfo {
        stream_type,
        kind,
        mime_type,
        codec,
    }
}

static STREAM_TYPES: &[StreamTypeInfo] = &[
    info(0x01, TrackKind::Video, "video/mpeg", StreamCodec::Opaque),
    info(0x02, TrackKind::Video, "video/mpeg2", StreamCodec::Opaque),
    info(0x03, TrackKind::Audio, "audio/mpeg", StreamCodec::MpegAudio),
    info(0x04, TrackKind::Audio, "audio/mpeg", StreamCodec::MpegAudio),
    info(0x06, TrackKind::Complex, "application/octet-stream", StreamCodec::Opaque),
    info(0x0F, TrackKind::Audio, "audio/aac", StreamCodec::Adts),
    info(0x10, TrackKind::Video, "video/mp4v-es", StreamCodec::Opaque),
    info(0x11, TrackKind::Audio, "audio/aac-latm", StreamCodec::Opaque),
    info(0x15, TrackKind::Complex, "application/id3", StreamCodec::Opaque),
    info(0x1B, TrackKind::Video, "video/h264", StreamCodec::H264),
    info(0x24, TrackKind::Video, "video/h265", StreamCodec::Opaque),
    info(0x81, TrackKind::Audio, "audio/ac3", StreamCodec::Opaque),
    info(0x86, TrackKind::Complex, "application/scte35", StreamCodec::Opaque),
    info(0x87, TrackKind::Audio, "audio/eac3", StreamCodec::Opaque),
];

/// Look up a PMT stream type; unknown types get an opaque passthrough.
pub fn stream_type_info(stream_type: u8) -> StreamTypeInfo {
    STREAM_TYPES
        .iter()
        .find(|i| i.stream_type == stream_type)
        .copied()
        .unwrap_or(info(
            stream_type,
            TrackKind::Unknown,
            "application/octet-stream",
            StreamCodec::Opaque,
        ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_buffer_positions() {
        let mut buf = ScanBuffer::default();
        buf.push(&[1, 2, 3, 4]);
        buf.advance(3);
        assert_eq!(buf.pending(), &[4]);
        assert_eq!(buf.position(), 3);

        // Compaction keeps the stream offset.
        buf.push(&[5, 6]);
        assert_eq!(buf.pending(), &[4, 5, 6]);
        assert_eq!(buf.position(), 3);

        buf.discard(10);
        assert!(buf.is_empty());
        assert_eq!(buf.position(), 16);
    }

    #[test]
    fn test_sample_clock() {
        let mut clock = SampleClock::default();
        clock.rebase(1_000);
        clock.advance(1024);
        assert_eq!(clock.time_us(8000), 1_000 + 128_000);

        clock.rebase(1_000);
        assert_eq!(clock.time_us(8000), 129_000);

        clock.rebase(500_000);
        assert_eq!(clock.time_us(8000), 500_000);
    }

    #[test]
    fn test_stream_type_table() {
        assert_eq!(stream_type_info(0x1B).codec, StreamCodec::H264);
        assert_eq!(stream_type_info(0x0F).kind, TrackKind::Audio);
        let unknown = stream_type_info(0xEE);
        assert_eq!(unknown.kind, TrackKind::Unknown);
        assert_eq!(unknown.codec, StreamCodec::Opaque);
    }

    #[test]
    fn test_passthrough_one_frame_per_unit() {
        let mut reader = StreamCodec::Opaque.reader(true);
        let mut events = Vec::new();
        reader.push(&[0; 100]);
        reader.push(&[0; 50]);
        reader.flush(42, &mut events);
        reader.flush(43, &mut events);
        reader.push(&[0; 10]);
        reader.flush(44, &mut events);

        let frames: Vec<_> = events
            .iter()
            .map(|e| match e {
                EsEvent::Frame(f) => (f.decode_time_us, f.size, f.byte_offset),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(frames, vec![(42, 150, Some(0)), (44, 10, Some(150))]);
    }
}
