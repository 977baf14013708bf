//! Recursive MP4 box-tree walk with track binding.
//!
//! Besides building the [`Mp4Box`] tree, the walk binds codec and timing
//! boxes to tracks. It remembers the id of the most recent `tkhd` (or
//! `tfhd`) and attributes every later `mdhd`, `hdlr`, sample entry, codec
//! configuration and `trun` to it. That relies on the usual box ordering
//! and is not validated: a file that puts a codec box before its `tkhd`
//! gets it attached to whichever track came last.

use std::collections::BTreeMap;

use tracing::{debug, trace, warn};

use super::boxes::{BoxType, Mp4Box};
use super::fields::{
    decode_fields, AvcConfig, BoxFields, EsDescriptor, HevcConfig, SegmentIndex, TrackExtends,
    TrackFragmentHeader, TrackRun,
};
use super::fragment::{reconstruct_run, RunContext};
use super::sample_table::SampleTables;
use crate::track::{AudioConfig, Track, TrackConfig, TrackKind, VideoConfig};
use crate::{Error, Result};

/// Timescale assumed for tracks whose `mdhd` was never seen.
pub const FALLBACK_TIMESCALE: u32 = 90_000;

/// Deepest box nesting accepted.
const MAX_DEPTH: usize = 32;

/// A box header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoxHeader {
    pub box_type: BoxType,
    /// Declared size including header; 0 means "to the end of the parent".
    pub size: u64,
    pub header_size: u8,
}

impl BoxHeader {
    /// Read a header from the front of `data`, or `None` if incomplete.
    pub fn read(data: &[u8]) -> Option<Self> {
        if data.len() < 8 {
            return None;
        }
        let size = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as u64;
        let box_type = BoxType::from_bytes([data[4], data[5], data[6], data[7]]);

        if size == 1 {
            // 64-bit largesize
            let ext = data.get(8..16)?;
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(ext);
            return Some(Self {
                box_type,
                size: u64::from_be_bytes(bytes),
                header_size: 16,
            });
        }

        Some(Self {
            box_type,
            size,
            header_size: 8,
        })
    }

    /// Whether the box extends to the end of its parent.
    pub fn extends_to_end(&self) -> bool {
        self.size == 0
    }

    /// Resolve the box size against `available` bytes of its parent.
    pub fn resolve_size(&self, available: u64) -> Result<u64> {
        let size = if self.extends_to_end() {
            available
        } else {
            self.size
        };
        if size < self.header_size as u64 {
            return Err(Error::invalid_mp4(format!(
                "{} box size {} smaller than its header",
                self.box_type, size
            )));
        }
        if size > available {
            return Err(Error::invalid_mp4(format!(
                "{} box of {} bytes overruns its parent ({} bytes left)",
                self.box_type, size, available
            )));
        }
        Ok(size)
    }
}

/// Per-track state the walk accumulates outside the [`Track`] itself.
#[derive(Debug, Clone, Default)]
pub struct TrackMedia {
    pub timescale: Option<u32>,
    pub handler: Option<BoxType>,
    pub language: Option<String>,
    pub extends: Option<TrackExtends>,
    pub segment_indexes: Vec<SegmentIndex>,
    /// Decode time (media ticks) where the next fragment run starts.
    pub next_decode_time: u64,
}

impl TrackMedia {
    pub fn timescale(&self) -> u32 {
        self.timescale.filter(|&t| t > 0).unwrap_or(FALLBACK_TIMESCALE)
    }
}

/// State of the `traf` being walked.
#[derive(Debug, Clone, Default)]
struct FragmentState {
    header: Option<TrackFragmentHeader>,
    next_data_offset: Option<u64>,
}

/// Box-tree parser that binds what it sees to tracks.
#[derive(Debug)]
pub struct BoxParser {
    tracks: BTreeMap<u32, Track>,
    media: BTreeMap<u32, TrackMedia>,
    current_track: Option<u32>,
    sample_entry: Option<BoxType>,
    tables: SampleTables,
    moof_offset: u64,
    fragment: FragmentState,
}

impl Default for BoxParser {
    fn default() -> Self {
        Self::new()
    }
}

impl BoxParser {
    pub fn new() -> Self {
        Self {
            tracks: BTreeMap::new(),
            media: BTreeMap::new(),
            current_track: None,
            sample_entry: None,
            tables: SampleTables::default(),
            moof_offset: 0,
            fragment: FragmentState::default(),
        }
    }

    pub fn tracks(&self) -> &BTreeMap<u32, Track> {
        &self.tracks
    }

    pub fn tracks_mut(&mut self) -> &mut BTreeMap<u32, Track> {
        &mut self.tracks
    }

    /// Container-level metadata for a track.
    pub fn media(&self, track_id: u32) -> Option<&TrackMedia> {
        self.media.get(&track_id)
    }

    /// Parse a sequence of complete sibling boxes.
    ///
    /// `offset` is the absolute position of `data[0]` in the source.
    pub fn parse(&mut self, data: &[u8], offset: u64) -> Result<Vec<Mp4Box>> {
        self.parse_children(data, offset, 0)
    }

    /// Parse exactly one box spanning all of `data`.
    pub fn parse_box(&mut self, header: BoxHeader, data: &[u8], offset: u64) -> Result<Mp4Box> {
        self.walk(header, data, offset, 0)
    }

    fn parse_children(&mut self, data: &[u8], offset: u64, depth: usize) -> Result<Vec<Mp4Box>> {
        let mut boxes = Vec::new();
        let mut pos = 0usize;

        while pos < data.len() {
            let rest = &data[pos..];
            let Some(header) = BoxHeader::read(rest) else {
                trace!(offset = offset + pos as u64, len = rest.len(), "trailing bytes");
                break;
            };
            let size = header.resolve_size(rest.len() as u64)? as usize;
            boxes.push(self.walk(header, &rest[..size], offset + pos as u64, depth)?);
            pos += size;
        }

        Ok(boxes)
    }

    fn walk(&mut self, header: BoxHeader, data: &[u8], offset: u64, depth: usize) -> Result<Mp4Box> {
        if depth > MAX_DEPTH {
            return Err(Error::invalid_mp4(format!(
                "{} nested deeper than {} boxes",
                header.box_type, MAX_DEPTH
            )));
        }

        let box_type = header.box_type;
        let payload = data.get(header.header_size as usize..).unwrap_or_default();
        trace!(%box_type, offset, size = data.len(), "box");

        let fields = decode_fields(box_type, payload).unwrap_or_else(|err| {
            warn!(%box_type, offset, error = %err, "malformed box, keeping it opaque");
            BoxFields::Opaque
        });
        self.enter(box_type, offset, &fields)?;

        let is_container = box_type.is_container();
        let children = if is_container {
            let start = box_type.child_offset(payload).min(payload.len());
            let child_offset = offset + header.header_size as u64 + start as u64;
            self.parse_children(&payload[start..], child_offset, depth + 1)?
        } else {
            Vec::new()
        };

        self.exit(box_type)?;

        Ok(Mp4Box {
            box_type,
            size: data.len() as u64,
            offset,
            header_size: header.header_size,
            is_container,
            fields,
            children,
        })
    }

    /// Bind a box before its children are walked.
    fn enter(&mut self, box_type: BoxType, offset: u64, fields: &BoxFields) -> Result<()> {
        match box_type {
            BoxType::TRAK => {
                self.tables = SampleTables::default();
                self.sample_entry = None;
            }
            BoxType::MOOF => self.moof_offset = offset,
            BoxType::TRAF => self.fragment = FragmentState::default(),
            _ => {}
        }

        match fields {
            BoxFields::TrackHeader { track_id, .. } => {
                debug!(track_id, "track header");
                self.current_track = Some(*track_id);
            }
            BoxFields::MediaHeader {
                timescale,
                language,
                ..
            } => {
                if let Some(media) = self.current_media() {
                    media.timescale = Some(*timescale);
                    media.language = Some(language.clone());
                }
            }
            BoxFields::Handler { handler_type, .. } => {
                if let Some(media) = self.current_media() {
                    media.handler = Some(*handler_type);
                }
            }
            BoxFields::VisualSampleEntry { width, height, .. } => {
                self.sample_entry = Some(box_type);
                if let Some(track) = self.current_codec_track(TrackKind::Video) {
                    track.mime_type = "video/mp4".to_string();
                    track.config = TrackConfig::Video(VideoConfig {
                        codec: box_type.to_string(),
                        width: *width as u32,
                        height: *height as u32,
                        ..Default::default()
                    });
                }
            }
            BoxFields::AudioSampleEntry {
                channels,
                sample_rate,
                ..
            } => {
                self.sample_entry = Some(box_type);
                if let Some(track) = self.current_codec_track(TrackKind::Audio) {
                    track.mime_type = "audio/mp4".to_string();
                    track.config = TrackConfig::Audio(AudioConfig {
                        codec: box_type.to_string(),
                        sample_rate: *sample_rate,
                        channels: *channels,
                        ..Default::default()
                    });
                }
            }
            BoxFields::AvcConfig(avcc) => self.bind_avc(avcc),
            BoxFields::HevcConfig(hvcc) => self.bind_hevc(hvcc),
            BoxFields::EsDescriptor(esds) => self.bind_esds(esds),
            BoxFields::TimeToSample(entries) => self.tables.time_to_sample = entries.clone(),
            BoxFields::SyncSamples(samples) => self.tables.sync_samples = Some(samples.clone()),
            BoxFields::SampleToChunk(entries) => self.tables.sample_to_chunk = entries.clone(),
            BoxFields::SampleSize {
                uniform_size,
                sample_count,
                sizes,
            } => {
                self.tables.uniform_size = *uniform_size;
                self.tables.sample_size_count = *sample_count;
                self.tables.sample_sizes = sizes.clone();
            }
            BoxFields::ChunkOffsets(offsets) => self.tables.chunk_offsets = offsets.clone(),
            BoxFields::CompositionOffsets(entries) => {
                self.tables.composition_offsets = Some(entries.clone())
            }
            BoxFields::TrackExtends(trex) => {
                self.media.entry(trex.track_id).or_default().extends = Some(*trex);
            }
            BoxFields::TrackFragmentHeader(tfhd) => {
                self.current_track = Some(tfhd.track_id);
                self.ensure_track(tfhd.track_id);
                self.fragment.header = Some(*tfhd);
            }
            BoxFields::TrackFragmentDecodeTime {
                base_media_decode_time,
            } => {
                if let Some(media) = self.current_media() {
                    media.next_decode_time = *base_media_decode_time;
                }
            }
            BoxFields::TrackRun(run) => self.bind_run(run)?,
            BoxFields::SegmentIndex(sidx) => {
                self.ensure_track(sidx.reference_id);
                self.media
                    .entry(sidx.reference_id)
                    .or_default()
                    .segment_indexes
                    .push(sidx.clone());
            }
            _ => {}
        }

        Ok(())
    }

    /// Finish a box after its children are walked.
    fn exit(&mut self, box_type: BoxType) -> Result<()> {
        if box_type != BoxType::TRAK {
            return Ok(());
        }

        let tables = std::mem::take(&mut self.tables);
        let Some(track_id) = self.current_track else {
            if !tables.is_empty() {
                warn!("sample tables without a track header, ignoring");
            }
            return Ok(());
        };

        let media = self.media.entry(track_id).or_default();
        let timescale = media.timescale();
        let kind = media.handler.map(handler_kind).unwrap_or_default();

        // All passes finish before anything touches the track.
        let frames = tables.reconstruct(track_id, timescale)?;

        if frames.is_empty() && !self.tracks.contains_key(&track_id) {
            return Ok(());
        }
        let track = self.ensure_track(track_id);
        if track.kind == TrackKind::Unknown {
            track.kind = kind;
        }
        track.timescale = Some(timescale);
        debug!(track_id, frames = frames.len(), "sample table attached");
        track.extend_frames(frames);
        Ok(())
    }

    fn current_media(&mut self) -> Option<&mut TrackMedia> {
        let id = self.current_track?;
        Some(self.media.entry(id).or_default())
    }

    fn ensure_track(&mut self, track_id: u32) -> &mut Track {
        let media = self.media.entry(track_id).or_default();
        let kind = media.handler.map(handler_kind).unwrap_or_default();
        let timescale = media.timescale;
        self.tracks.entry(track_id).or_insert_with(|| {
            debug!(track_id, %kind, "track created");
            let mut track = Track::new(track_id, kind, default_mime(kind));
            track.timescale = timescale;
            track
        })
    }

    /// The track a codec box belongs to, created and typed as `kind`.
    fn current_codec_track(&mut self, kind: TrackKind) -> Option<&mut Track> {
        let Some(track_id) = self.current_track else {
            warn!(%kind, "codec box before any track header, ignoring");
            return None;
        };
        let track = self.ensure_track(track_id);
        track.kind = kind;
        Some(track)
    }

    fn bind_avc(&mut self, avcc: &AvcConfig) {
        let entry = self.sample_entry.unwrap_or(BoxType::AVC1);
        let Some(track) = self.current_codec_track(TrackKind::Video) else {
            return;
        };

        let codec = avcc.codec_string(entry);
        track.mime_type = format!("video/mp4; codecs=\"{codec}\"");

        let mut config = match &track.config {
            TrackConfig::Video(v) => v.clone(),
            _ => VideoConfig::default(),
        };
        if let Some(sps) = &avcc.parsed_sps {
            let (width, height) = (config.width, config.height);
            config = VideoConfig::from(sps);
            if config.width == 0 || config.height == 0 {
                config.width = width;
                config.height = height;
            }
        }
        config.codec = codec;
        track.config = TrackConfig::Video(config);
    }

    fn bind_hevc(&mut self, hvcc: &HevcConfig) {
        let entry = self.sample_entry.unwrap_or(BoxType::HVC1);
        let Some(track) = self.current_codec_track(TrackKind::Video) else {
            return;
        };

        let codec = hvcc.codec_string(entry);
        track.mime_type = format!("video/mp4; codecs=\"{codec}\"");

        let mut config = match &track.config {
            TrackConfig::Video(v) => v.clone(),
            _ => VideoConfig::default(),
        };
        config.codec = codec;
        config.level = Some(format!("{:.1}", hvcc.general_level_idc as f64 / 30.0));
        config.chroma_format_idc = Some(hvcc.chroma_format_idc as u32);
        config.bit_depth = Some(hvcc.bit_depth_luma);
        track.config = TrackConfig::Video(config);
    }

    fn bind_esds(&mut self, esds: &EsDescriptor) {
        let Some(track) = self.current_codec_track(TrackKind::Audio) else {
            return;
        };

        let codec = esds.codec_string();
        track.mime_type = format!("audio/mp4; codecs=\"{codec}\"");

        let mut config = match &track.config {
            TrackConfig::Audio(a) => a.clone(),
            _ => AudioConfig::default(),
        };
        config.codec = codec;
        if let Some(rate) = esds.sample_rate {
            config.sample_rate = rate;
        }
        if let Some(channels) = esds.channels.filter(|&c| c > 0) {
            config.channels = channels as u16;
        }
        if esds.avg_bitrate > 0 {
            config.bitrate = Some(esds.avg_bitrate);
        }
        track.config = TrackConfig::Audio(config);
    }

    fn bind_run(&mut self, run: &TrackRun) -> Result<()> {
        let (Some(track_id), Some(header)) = (self.current_track, self.fragment.header) else {
            warn!("trun outside a track fragment, ignoring");
            return Ok(());
        };

        let base_data_offset = header.base_data_offset.unwrap_or(self.moof_offset);
        let media = self.media.entry(track_id).or_default();
        let ctx = RunContext {
            header: &header,
            extends: media.extends.as_ref(),
            timescale: media.timescale(),
            base_data_offset,
            next_data_offset: self.fragment.next_data_offset.unwrap_or(base_data_offset),
            decode_time: media.next_decode_time,
        };
        let out = reconstruct_run(run, &ctx)?;

        media.next_decode_time = out.end_decode_time;
        self.fragment.next_data_offset = Some(out.end_data_offset);

        trace!(track_id, samples = out.frames.len(), "track run");
        self.ensure_track(track_id).extend_frames(out.frames);
        Ok(())
    }
}

/// Track kind for an `hdlr` handler type.
pub fn handler_kind(handler: BoxType) -> TrackKind {
    match &handler.0 {
        b"vide" => TrackKind::Video,
        b"soun" => TrackKind::Audio,
        b"text" | b"subt" | b"sbtl" | b"clcp" => TrackKind::Text,
        b"meta" | b"hint" => TrackKind::Complex,
        _ => TrackKind::Unknown,
    }
}

fn default_mime(kind: TrackKind) -> &'static str {
    match kind {
        TrackKind::Video => "video/mp4",
        TrackKind::Audio => "audio/mp4",
        TrackKind::Text => "text/mp4",
        TrackKind::Complex | TrackKind::Unknown => "application/mp4",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_box(box_type: &[u8; 4], payload: &[u8]) -> Vec<u8> {
        let mut v = ((payload.len() + 8) as u32).to_be_bytes().to_vec();
        v.extend_from_slice(box_type);
        v.extend_from_slice(payload);
        v
    }

    #[test]
    fn test_header_read() {
        assert_eq!(BoxHeader::read(&[0, 0, 0, 8, b'f']), None);

        let header = BoxHeader::read(b"\x00\x00\x00\x10moov").unwrap();
        assert_eq!(header.box_type, BoxType::MOOV);
        assert_eq!(header.size, 16);
        assert_eq!(header.header_size, 8);

        let mut large = vec![0, 0, 0, 1];
        large.extend_from_slice(b"mdat");
        large.extend_from_slice(&(1u64 << 33).to_be_bytes());
        let header = BoxHeader::read(&large).unwrap();
        assert_eq!(header.size, 1 << 33);
        assert_eq!(header.header_size, 16);
    }

    #[test]
    fn test_unknown_boxes_are_opaque() {
        let mut data = make_box(b"zzzz", &[1, 2, 3, 4, 5, 6, 7, 8]);
        data.extend(make_box(b"moov", &make_box(b"yyyy", &[])));

        let mut parser = BoxParser::new();
        let boxes = parser.parse(&data, 0).unwrap();

        assert_eq!(boxes.len(), 2);
        assert_eq!(boxes[0].fields, BoxFields::Opaque);
        assert!(!boxes[0].is_container);
        assert_eq!(boxes[1].children.len(), 1);
        assert_eq!(boxes[1].offset, 16);
        assert_eq!(boxes[1].children[0].offset, 24);
        assert!(parser.tracks().is_empty());
    }

    #[test]
    fn test_child_overrunning_parent_fails() {
        let mut inner = make_box(b"free", &[0; 4]);
        inner[3] = 64;
        let data = make_box(b"moov", &inner);
        assert!(matches!(
            BoxParser::new().parse(&data, 0),
            Err(Error::InvalidMp4(_))
        ));
    }

    #[test]
    fn test_size_zero_extends_to_parent_end() {
        let mut inner = make_box(b"free", &[0; 12]);
        inner[..4].copy_from_slice(&[0; 4]);
        let data = make_box(b"moov", &inner);

        let boxes = BoxParser::new().parse(&data, 0).unwrap();
        assert_eq!(boxes[0].children[0].size, 20);
    }

    #[test]
    fn test_handler_kinds() {
        assert_eq!(handler_kind(BoxType(*b"vide")), TrackKind::Video);
        assert_eq!(handler_kind(BoxType(*b"sbtl")), TrackKind::Text);
        assert_eq!(handler_kind(BoxType(*b"zzzz")), TrackKind::Unknown);
    }
}
