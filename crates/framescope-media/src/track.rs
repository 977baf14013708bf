//! Format-agnostic track and frame timeline model.
//!
//! Every demuxer produces [`Frame`] records and appends them to exactly one
//! [`Track`]. Timestamps are normalised to microseconds. Frames are only
//! guaranteed to be in decode order after [`Track::update`].

/// Microseconds per second.
pub const MICROS_PER_SECOND: i64 = 1_000_000;

/// Convert a tick count in `timescale` units to microseconds.
///
/// A zero timescale yields zero rather than dividing by zero. Results past
/// the `i64` range saturate.
pub fn ticks_to_micros(ticks: i64, timescale: u32) -> i64 {
    let saturated = if ticks < 0 { i64::MIN } else { i64::MAX };
    checked_ticks_to_micros(ticks, timescale).unwrap_or(saturated)
}

/// Like [`ticks_to_micros`], but `None` when the result does not fit.
pub fn checked_ticks_to_micros(ticks: i64, timescale: u32) -> Option<i64> {
    if timescale == 0 {
        return Some(0);
    }
    i64::try_from(ticks as i128 * MICROS_PER_SECOND as i128 / timescale as i128).ok()
}

/// Coded frame classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum FrameType {
    I,
    P,
    B,
    SI,
    SP,
    Unknown,
}

impl FrameType {
    /// Whether the frame can be decoded without references.
    pub fn is_keyframe(&self) -> bool {
        matches!(self, Self::I | Self::SI)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::I => "I",
            Self::P => "P",
            Self::B => "B",
            Self::SI => "SI",
            Self::SP => "SP",
            Self::Unknown => "?",
        }
    }
}

impl std::fmt::Display for FrameType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single coded frame (or audio access unit).
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct Frame {
    pub frame_type: FrameType,
    /// Decode timestamp, the authoritative ordering key.
    pub decode_time_us: i64,
    /// Size in bytes of the coded data.
    pub size: u32,
    /// Duration, when the container states one or it can be inferred.
    pub duration_us: Option<f64>,
    /// Absolute byte offset in the source, when the container knows it.
    pub byte_offset: Option<u64>,
    /// Presentation time minus decode time.
    pub presentation_time_offset_us: i64,
}

impl Frame {
    /// Create a frame with no duration, offset or composition delay.
    pub fn new(frame_type: FrameType, decode_time_us: i64, size: u32) -> Self {
        Self {
            frame_type,
            decode_time_us,
            size,
            duration_us: None,
            byte_offset: None,
            presentation_time_offset_us: 0,
        }
    }

    pub fn with_duration(mut self, duration_us: f64) -> Self {
        self.duration_us = Some(duration_us);
        self
    }

    pub fn with_byte_offset(mut self, offset: u64) -> Self {
        self.byte_offset = Some(offset);
        self
    }

    pub fn with_presentation_offset(mut self, offset_us: i64) -> Self {
        self.presentation_time_offset_us = offset_us;
        self
    }

    /// Presentation timestamp.
    pub fn presentation_time_us(&self) -> i64 {
        self.decode_time_us + self.presentation_time_offset_us
    }

    pub fn is_keyframe(&self) -> bool {
        self.frame_type.is_keyframe()
    }
}

/// Track media kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serialize", serde(rename_all = "lowercase"))]
pub enum TrackKind {
    Video,
    Audio,
    Text,
    /// Multiplexed or metadata-bearing streams
    Complex,
    #[default]
    Unknown,
}

impl TrackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Text => "text",
            Self::Complex => "complex",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Video stream parameters.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct VideoConfig {
    /// RFC 6381 codec string, e.g. `avc1.64001f`
    pub codec: String,
    pub profile: Option<String>,
    pub level: Option<String>,
    pub width: u32,
    pub height: u32,
    pub chroma_format_idc: Option<u32>,
    pub bit_depth: Option<u8>,
    pub sample_aspect_ratio: Option<(u32, u32)>,
    pub frame_rate: Option<f64>,
}

/// Audio stream parameters.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct AudioConfig {
    /// RFC 6381 codec string, e.g. `mp4a.40.2`
    pub codec: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub samples_per_frame: Option<u32>,
    pub bitrate: Option<u32>,
}

/// Codec configuration attached to a track.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum TrackConfig {
    Video(VideoConfig),
    Audio(AudioConfig),
    #[default]
    None,
}

/// A demultiplexed track and its frame timeline.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct Track {
    pub id: u32,
    pub kind: TrackKind,
    pub mime_type: String,
    pub config: TrackConfig,
    /// Native media timescale, when the container declares one.
    pub timescale: Option<u32>,
    frames: Vec<Frame>,
    duration_us: f64,
}

impl Track {
    /// Create an empty track.
    pub fn new(id: u32, kind: TrackKind, mime_type: impl Into<String>) -> Self {
        Self {
            id,
            kind,
            mime_type: mime_type.into(),
            config: TrackConfig::None,
            timescale: None,
            frames: Vec::new(),
            duration_us: 0.0,
        }
    }

    /// Append a frame in arrival order.
    pub fn push_frame(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    /// Append several frames in arrival order.
    pub fn extend_frames(&mut self, frames: impl IntoIterator<Item = Frame>) {
        self.frames.extend(frames);
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn frame(&self, index: usize) -> Option<&Frame> {
        self.frames.get(index)
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Duration in microseconds as of the last [`Track::update`].
    pub fn duration_us(&self) -> f64 {
        self.duration_us
    }

    pub fn duration_secs(&self) -> f64 {
        self.duration_us / MICROS_PER_SECOND as f64
    }

    /// Sort frames by decode time and recompute the duration.
    ///
    /// Frames without a stated duration take the decode-time delta to their
    /// successor. The duration is the extent from the first decode time to
    /// the furthest frame end. Calling this twice is a no-op the second time.
    pub fn update(&mut self) {
        self.frames.sort_by_key(|f| f.decode_time_us);

        for i in 0..self.frames.len().saturating_sub(1) {
            if self.frames[i].duration_us.is_none() {
                let delta = self.frames[i + 1].decode_time_us - self.frames[i].decode_time_us;
                self.frames[i].duration_us = Some(delta as f64);
            }
        }

        self.duration_us = match self.frames.first() {
            None => 0.0,
            Some(first) => {
                let start = first.decode_time_us as f64;
                let end = self
                    .frames
                    .iter()
                    .map(|f| f.decode_time_us as f64 + f.duration_us.unwrap_or(0.0))
                    .fold(start, f64::max);
                end - start
            }
        };
    }

    pub fn keyframe_count(&self) -> usize {
        self.frames.iter().filter(|f| f.is_keyframe()).count()
    }

    pub fn total_bytes(&self) -> u64 {
        self.frames.iter().map(|f| f.size as u64).sum()
    }

    /// Frames per second over the track duration.
    pub fn average_frame_rate(&self) -> Option<f64> {
        if self.duration_us <= 0.0 || self.frames.is_empty() {
            return None;
        }
        Some(self.frames.len() as f64 / self.duration_secs())
    }

    /// Average bitrate in bits per second.
    pub fn bitrate_bps(&self) -> Option<f64> {
        if self.duration_us <= 0.0 {
            return None;
        }
        Some(self.total_bytes() as f64 * 8.0 / self.duration_secs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(dts: i64) -> Frame {
        Frame::new(FrameType::P, dts, 100)
    }

    #[test]
    fn test_ticks_to_micros() {
        assert_eq!(ticks_to_micros(90_000, 90_000), 1_000_000);
        assert_eq!(ticks_to_micros(1001, 30_000), 33_366);
        assert_eq!(ticks_to_micros(-3000, 90_000), -33_333);
        assert_eq!(ticks_to_micros(5, 0), 0);
    }

    #[test]
    fn test_ticks_to_micros_out_of_range() {
        assert_eq!(checked_ticks_to_micros(i64::MAX, 1), None);
        assert_eq!(checked_ticks_to_micros(i64::MIN / 2, 1), None);
        assert_eq!(ticks_to_micros(i64::MAX, 1), i64::MAX);
        assert_eq!(ticks_to_micros(i64::MIN / 2, 1), i64::MIN);
        assert_eq!(checked_ticks_to_micros(i64::MAX, 1_000_000), Some(i64::MAX));
    }

    #[test]
    fn test_presentation_time() {
        let f = Frame::new(FrameType::B, 1000, 10).with_presentation_offset(500);
        assert_eq!(f.presentation_time_us(), 1500);
        assert!(!f.is_keyframe());
    }

    #[test]
    fn test_update_sorts_and_infers_durations() {
        let mut track = Track::new(1, TrackKind::Video, "video/h264");
        track.push_frame(frame(2000));
        track.push_frame(frame(0));
        track.push_frame(frame(1000).with_duration(1000.0));
        track.push_frame(frame(3000).with_duration(1000.0));

        track.update();

        let dts: Vec<i64> = track.frames().iter().map(|f| f.decode_time_us).collect();
        assert_eq!(dts, vec![0, 1000, 2000, 3000]);
        assert_eq!(track.frames()[0].duration_us, Some(1000.0));
        assert_eq!(track.frames()[2].duration_us, Some(1000.0));
        assert_eq!(track.duration_us(), 4000.0);
        assert!((track.average_frame_rate().unwrap() - 1000.0).abs() < 1e-6);
    }

    #[test]
    fn test_update_is_idempotent() {
        let mut track = Track::new(7, TrackKind::Audio, "audio/aac");
        for dts in [500, 100, 300, 200, 400] {
            track.push_frame(frame(dts));
        }

        track.update();
        let first = track.clone();
        track.update();

        assert_eq!(track, first);
    }

    #[test]
    fn test_empty_track() {
        let mut track = Track::new(1, TrackKind::Unknown, "");
        track.update();
        assert_eq!(track.duration_us(), 0.0);
        assert!(track.average_frame_rate().is_none());
        assert!(track.bitrate_bps().is_none());
    }
}
