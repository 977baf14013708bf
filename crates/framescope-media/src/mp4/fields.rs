//! Per-box-type payload decoders.
//!
//! Each registered box type maps to a plain function in [`DECODERS`]; any
//! type without an entry decodes to [`BoxFields::Opaque`]. Decoders see only
//! the box payload (header already stripped) and fail with
//! [`Error::InvalidMp4`] when the payload is shorter than its fixed layout.

use bytes::Buf;
use tracing::warn;

use super::boxes::BoxType;
use crate::bits::BitCursor;
use crate::codec::h264::{parse_sps, Sps};
use crate::{Error, Result};

/// `trun`/`trex` sample flag marking a non-sync sample.
pub const SAMPLE_IS_NON_SYNC: u32 = 0x0001_0000;

/// MPEG-4 audio sampling frequency table (ISO/IEC 14496-3).
pub const AAC_SAMPLE_RATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

/// Decoded payload of a box.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum BoxFields {
    /// Unregistered type, or a container with no fields of its own.
    #[default]
    Opaque,
    FileType {
        major_brand: BoxType,
        minor_version: u32,
        compatible_brands: Vec<BoxType>,
    },
    MovieHeader {
        timescale: u32,
        duration: u64,
    },
    TrackHeader {
        track_id: u32,
        duration: u64,
        width: u32,
        height: u32,
    },
    MediaHeader {
        timescale: u32,
        duration: u64,
        language: String,
    },
    Handler {
        handler_type: BoxType,
        name: String,
    },
    TimeToSample(Vec<TimeToSampleEntry>),
    SampleToChunk(Vec<SampleToChunkEntry>),
    SampleSize {
        /// Nonzero when every sample has this size.
        uniform_size: u32,
        sample_count: u32,
        /// Per-sample sizes, empty when `uniform_size` is set.
        sizes: Vec<u32>,
    },
    ChunkOffsets(Vec<u64>),
    CompositionOffsets(Vec<CompositionOffsetEntry>),
    /// 1-based sample numbers of sync samples.
    SyncSamples(Vec<u32>),
    SampleDescription {
        entry_count: u32,
    },
    VisualSampleEntry {
        data_reference_index: u16,
        width: u16,
        height: u16,
        compressor: String,
    },
    AudioSampleEntry {
        data_reference_index: u16,
        channels: u16,
        sample_size: u16,
        sample_rate: u32,
    },
    AvcConfig(AvcConfig),
    HevcConfig(HevcConfig),
    EsDescriptor(EsDescriptor),
    MovieFragmentHeader {
        sequence_number: u32,
    },
    TrackFragmentHeader(TrackFragmentHeader),
    TrackFragmentDecodeTime {
        base_media_decode_time: u64,
    },
    TrackRun(TrackRun),
    TrackExtends(TrackExtends),
    SegmentIndex(SegmentIndex),
    ProtectionSystem(ProtectionSystem),
    EventMessage(EventMessage),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct TimeToSampleEntry {
    pub count: u32,
    pub delta: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct SampleToChunkEntry {
    /// 1-based index of the first chunk this run applies to.
    pub first_chunk: u32,
    pub samples_per_chunk: u32,
    pub sample_description_index: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct CompositionOffsetEntry {
    pub count: u32,
    pub offset: i32,
}

/// `avcC` decoder configuration record.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct AvcConfig {
    pub profile_idc: u8,
    pub profile_compatibility: u8,
    pub level_idc: u8,
    pub nal_length_size: u8,
    pub sps: Vec<Vec<u8>>,
    pub pps: Vec<Vec<u8>>,
    /// First SPS, when it parses.
    pub parsed_sps: Option<Sps>,
}

impl AvcConfig {
    /// RFC 6381 codec string for the given sample entry type.
    pub fn codec_string(&self, entry: BoxType) -> String {
        format!(
            "{}.{:02x}{:02x}{:02x}",
            entry, self.profile_idc, self.profile_compatibility, self.level_idc
        )
    }
}

/// `hvcC` decoder configuration record (header fields only).
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct HevcConfig {
    pub general_profile_space: u8,
    pub general_tier_flag: bool,
    pub general_profile_idc: u8,
    pub general_profile_compatibility_flags: u32,
    pub general_constraint_indicator_flags: [u8; 6],
    pub general_level_idc: u8,
    pub chroma_format_idc: u8,
    pub bit_depth_luma: u8,
    pub bit_depth_chroma: u8,
    pub nal_length_size: u8,
}

impl HevcConfig {
    /// RFC 6381 / ISO/IEC 14496-15 Annex E codec string.
    pub fn codec_string(&self, entry: BoxType) -> String {
        let space = match self.general_profile_space {
            1 => "A",
            2 => "B",
            3 => "C",
            _ => "",
        };
        let compat = self.general_profile_compatibility_flags.reverse_bits();
        let tier = if self.general_tier_flag { 'H' } else { 'L' };

        let mut codec = format!(
            "{}.{}{}.{:x}.{}{}",
            entry, space, self.general_profile_idc, compat, tier, self.general_level_idc
        );

        let constraints = &self.general_constraint_indicator_flags;
        let used = constraints
            .iter()
            .rposition(|&b| b != 0)
            .map_or(0, |i| i + 1);
        for byte in &constraints[..used] {
            codec.push_str(&format!(".{byte:x}"));
        }
        codec
    }
}

/// Fields of an `esds` elementary stream descriptor.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct EsDescriptor {
    pub es_id: u16,
    pub object_type_indication: u8,
    pub stream_type: u8,
    pub max_bitrate: u32,
    pub avg_bitrate: u32,
    /// From the AudioSpecificConfig, when present.
    pub audio_object_type: Option<u8>,
    pub sample_rate: Option<u32>,
    pub channels: Option<u8>,
}

impl EsDescriptor {
    /// RFC 6381 codec string, e.g. `mp4a.40.2`.
    pub fn codec_string(&self) -> String {
        match self.audio_object_type {
            Some(aot) if self.object_type_indication == 0x40 => {
                format!("mp4a.{:02x}.{}", self.object_type_indication, aot)
            }
            _ => format!("mp4a.{:02x}", self.object_type_indication),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct TrackFragmentHeader {
    pub track_id: u32,
    pub flags: u32,
    pub base_data_offset: Option<u64>,
    pub sample_description_index: Option<u32>,
    pub default_sample_duration: Option<u32>,
    pub default_sample_size: Option<u32>,
    pub default_sample_flags: Option<u32>,
}

impl TrackFragmentHeader {
    pub const BASE_DATA_OFFSET: u32 = 0x0000_0001;
    pub const SAMPLE_DESCRIPTION_INDEX: u32 = 0x0000_0002;
    pub const DEFAULT_SAMPLE_DURATION: u32 = 0x0000_0008;
    pub const DEFAULT_SAMPLE_SIZE: u32 = 0x0000_0010;
    pub const DEFAULT_SAMPLE_FLAGS: u32 = 0x0000_0020;
    pub const DURATION_IS_EMPTY: u32 = 0x0001_0000;
    pub const DEFAULT_BASE_IS_MOOF: u32 = 0x0002_0000;
}

#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct TrackRun {
    pub version: u8,
    pub flags: u32,
    pub data_offset: Option<i32>,
    pub first_sample_flags: Option<u32>,
    pub samples: Vec<TrackRunSample>,
}

impl TrackRun {
    pub const DATA_OFFSET: u32 = 0x0000_0001;
    pub const FIRST_SAMPLE_FLAGS: u32 = 0x0000_0004;
    pub const SAMPLE_DURATION: u32 = 0x0000_0100;
    pub const SAMPLE_SIZE: u32 = 0x0000_0200;
    pub const SAMPLE_FLAGS: u32 = 0x0000_0400;
    pub const SAMPLE_COMPOSITION_OFFSET: u32 = 0x0000_0800;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct TrackRunSample {
    pub duration: Option<u32>,
    pub size: Option<u32>,
    pub flags: Option<u32>,
    pub composition_offset: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct TrackExtends {
    pub track_id: u32,
    pub default_sample_description_index: u32,
    pub default_sample_duration: u32,
    pub default_sample_size: u32,
    pub default_sample_flags: u32,
}

#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct SegmentIndex {
    pub reference_id: u32,
    pub timescale: u32,
    pub earliest_presentation_time: u64,
    pub first_offset: u64,
    pub references: Vec<SegmentReference>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct SegmentReference {
    /// Points at another `sidx` rather than media.
    pub reference_type: bool,
    pub referenced_size: u32,
    pub subsegment_duration: u32,
    pub starts_with_sap: bool,
    pub sap_type: u8,
    pub sap_delta_time: u32,
}

/// `pssh` contents, kept opaque.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct ProtectionSystem {
    pub system_id: [u8; 16],
    pub key_ids: Vec<[u8; 16]>,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct EventMessage {
    pub scheme_id_uri: String,
    pub value: String,
    pub timescale: u32,
    /// Absolute time (version 1).
    pub presentation_time: Option<u64>,
    /// Time relative to the segment start (version 0).
    pub presentation_time_delta: Option<u32>,
    pub event_duration: u32,
    pub id: u32,
    pub message_data: Vec<u8>,
}

/// Bounds-checked big-endian reader over a box payload.
pub(crate) struct FieldReader<'a> {
    buf: &'a [u8],
    box_type: BoxType,
}

impl<'a> FieldReader<'a> {
    pub(crate) fn new(box_type: BoxType, buf: &'a [u8]) -> Self {
        Self { buf, box_type }
    }

    fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn ensure(&self, n: usize) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(Error::invalid_mp4(format!(
                "{} truncated: need {} bytes, have {}",
                self.box_type,
                n,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8> {
        self.ensure(1)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self) -> Result<u16> {
        self.ensure(2)?;
        Ok(self.buf.get_u16())
    }

    fn u24(&mut self) -> Result<u32> {
        self.ensure(3)?;
        Ok(self.buf.get_uint(3) as u32)
    }

    fn u32(&mut self) -> Result<u32> {
        self.ensure(4)?;
        Ok(self.buf.get_u32())
    }

    fn i32(&mut self) -> Result<i32> {
        self.ensure(4)?;
        Ok(self.buf.get_i32())
    }

    fn u64(&mut self) -> Result<u64> {
        self.ensure(8)?;
        Ok(self.buf.get_u64())
    }

    /// A 32- or 64-bit field depending on the full-box version.
    fn versioned(&mut self, version: u8) -> Result<u64> {
        if version == 1 {
            self.u64()
        } else {
            self.u32().map(u64::from)
        }
    }

    fn skip(&mut self, n: usize) -> Result<()> {
        self.ensure(n)?;
        self.buf.advance(n);
        Ok(())
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.ensure(n)?;
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn array16(&mut self) -> Result<[u8; 16]> {
        let mut out = [0u8; 16];
        out.copy_from_slice(self.bytes(16)?);
        Ok(out)
    }

    fn fourcc(&mut self) -> Result<BoxType> {
        let b = self.bytes(4)?;
        Ok(BoxType([b[0], b[1], b[2], b[3]]))
    }

    /// Version byte and 24-bit flags.
    fn full_box(&mut self) -> Result<(u8, u32)> {
        let version = self.u8()?;
        let flags = self.u24()?;
        Ok((version, flags))
    }

    /// NUL-terminated string, or the rest of the payload if unterminated.
    fn cstring(&mut self) -> String {
        let end = self
            .buf
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.buf.len());
        let s = String::from_utf8_lossy(&self.buf[..end]).into_owned();
        self.buf = &self.buf[(end + 1).min(self.buf.len())..];
        s
    }

    fn rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.buf)
    }

    /// Capacity hint for `count` entries of `entry_size` bytes, capped by
    /// what the payload can actually hold.
    fn capacity(&self, count: u32, entry_size: usize) -> usize {
        (count as usize).min(self.remaining() / entry_size.max(1))
    }
}

type FieldDecoder = fn(&mut FieldReader<'_>) -> Result<BoxFields>;

/// Registered box decoders, keyed by four-character code.
static DECODERS: &[(BoxType, FieldDecoder)] = &[
    (BoxType::FTYP, decode_ftyp),
    (BoxType::STYP, decode_ftyp),
    (BoxType::MVHD, decode_mvhd),
    (BoxType::TKHD, decode_tkhd),
    (BoxType::MDHD, decode_mdhd),
    (BoxType::HDLR, decode_hdlr),
    (BoxType::STTS, decode_stts),
    (BoxType::STSC, decode_stsc),
    (BoxType::STSZ, decode_stsz),
    (BoxType::STCO, decode_stco),
    (BoxType::CO64, decode_co64),
    (BoxType::CTTS, decode_ctts),
    (BoxType::STSS, decode_stss),
    (BoxType::STSD, decode_stsd),
    (BoxType::AVC1, decode_visual_entry),
    (BoxType::AVC3, decode_visual_entry),
    (BoxType::HEV1, decode_visual_entry),
    (BoxType::HVC1, decode_visual_entry),
    (BoxType::ENCV, decode_visual_entry),
    (BoxType::MP4A, decode_audio_entry),
    (BoxType::ENCA, decode_audio_entry),
    (BoxType::AVCC, decode_avcc),
    (BoxType::HVCC, decode_hvcc),
    (BoxType::ESDS, decode_esds),
    (BoxType::MFHD, decode_mfhd),
    (BoxType::TFHD, decode_tfhd),
    (BoxType::TFDT, decode_tfdt),
    (BoxType::TRUN, decode_trun),
    (BoxType::TREX, decode_trex),
    (BoxType::SIDX, decode_sidx),
    (BoxType::PSSH, decode_pssh),
    (BoxType::EMSG, decode_emsg),
];

/// Whether a decoder is registered for this box type.
pub fn has_decoder(box_type: BoxType) -> bool {
    DECODERS.iter().any(|(t, _)| *t == box_type)
}

/// Decode the payload of a box; unregistered types yield [`BoxFields::Opaque`].
pub fn decode_fields(box_type: BoxType, payload: &[u8]) -> Result<BoxFields> {
    match DECODERS.iter().find(|(t, _)| *t == box_type) {
        Some((_, decode)) => decode(&mut FieldReader::new(box_type, payload)),
        None => Ok(BoxFields::Opaque),
    }
}

fn decode_ftyp(r: &mut FieldReader<'_>) -> Result<BoxFields> {
    let major_brand = r.fourcc()?;
    let minor_version = r.u32()?;
    let mut compatible_brands = Vec::with_capacity(r.remaining() / 4);
    while r.remaining() >= 4 {
        compatible_brands.push(r.fourcc()?);
    }
    Ok(BoxFields::FileType {
        major_brand,
        minor_version,
        compatible_brands,
    })
}

fn decode_mvhd(r: &mut FieldReader<'_>) -> Result<BoxFields> {
    let (version, _) = r.full_box()?;
    // creation_time, modification_time
    r.versioned(version)?;
    r.versioned(version)?;
    let timescale = r.u32()?;
    let duration = r.versioned(version)?;
    Ok(BoxFields::MovieHeader {
        timescale,
        duration,
    })
}

fn decode_tkhd(r: &mut FieldReader<'_>) -> Result<BoxFields> {
    let (version, _) = r.full_box()?;
    r.versioned(version)?;
    r.versioned(version)?;
    let track_id = r.u32()?;
    r.skip(4)?;
    let duration = r.versioned(version)?;
    // reserved, layer, alternate_group, volume, reserved, matrix
    r.skip(8 + 2 + 2 + 2 + 2 + 36)?;
    // 16.16 fixed point
    let width = r.u32()? >> 16;
    let height = r.u32()? >> 16;
    Ok(BoxFields::TrackHeader {
        track_id,
        duration,
        width,
        height,
    })
}

fn decode_mdhd(r: &mut FieldReader<'_>) -> Result<BoxFields> {
    let (version, _) = r.full_box()?;
    r.versioned(version)?;
    r.versioned(version)?;
    let timescale = r.u32()?;
    let duration = r.versioned(version)?;
    let packed = r.u16()?;
    // Three 5-bit letters offset from 0x60.
    let language = (0..3)
        .rev()
        .map(|i| (((packed >> (i * 5)) & 0x1F) as u8 + 0x60) as char)
        .collect();
    Ok(BoxFields::MediaHeader {
        timescale,
        duration,
        language,
    })
}

fn decode_hdlr(r: &mut FieldReader<'_>) -> Result<BoxFields> {
    r.full_box()?;
    r.skip(4)?;
    let handler_type = r.fourcc()?;
    r.skip(12)?;
    let name = r.cstring();
    Ok(BoxFields::Handler { handler_type, name })
}

fn decode_stts(r: &mut FieldReader<'_>) -> Result<BoxFields> {
    r.full_box()?;
    let count = r.u32()?;
    let mut entries = Vec::with_capacity(r.capacity(count, 8));
    for _ in 0..count {
        entries.push(TimeToSampleEntry {
            count: r.u32()?,
            delta: r.u32()?,
        });
    }
    Ok(BoxFields::TimeToSample(entries))
}

fn decode_stsc(r: &mut FieldReader<'_>) -> Result<BoxFields> {
    r.full_box()?;
    let count = r.u32()?;
    let mut entries = Vec::with_capacity(r.capacity(count, 12));
    for _ in 0..count {
        entries.push(SampleToChunkEntry {
            first_chunk: r.u32()?,
            samples_per_chunk: r.u32()?,
            sample_description_index: r.u32()?,
        });
    }
    Ok(BoxFields::SampleToChunk(entries))
}

fn decode_stsz(r: &mut FieldReader<'_>) -> Result<BoxFields> {
    r.full_box()?;
    let uniform_size = r.u32()?;
    let sample_count = r.u32()?;
    let mut sizes = Vec::new();
    if uniform_size == 0 {
        sizes.reserve(r.capacity(sample_count, 4));
        for _ in 0..sample_count {
            sizes.push(r.u32()?);
        }
    }
    Ok(BoxFields::SampleSize {
        uniform_size,
        sample_count,
        sizes,
    })
}

fn decode_stco(r: &mut FieldReader<'_>) -> Result<BoxFields> {
    r.full_box()?;
    let count = r.u32()?;
    let mut offsets = Vec::with_capacity(r.capacity(count, 4));
    for _ in 0..count {
        offsets.push(r.u32()? as u64);
    }
    Ok(BoxFields::ChunkOffsets(offsets))
}

fn decode_co64(r: &mut FieldReader<'_>) -> Result<BoxFields> {
    r.full_box()?;
    let count = r.u32()?;
    let mut offsets = Vec::with_capacity(r.capacity(count, 8));
    for _ in 0..count {
        offsets.push(r.u64()?);
    }
    Ok(BoxFields::ChunkOffsets(offsets))
}

fn decode_ctts(r: &mut FieldReader<'_>) -> Result<BoxFields> {
    // Version 0 offsets are unsigned; real files still store negative
    // values there, so both versions read as i32.
    r.full_box()?;
    let count = r.u32()?;
    let mut entries = Vec::with_capacity(r.capacity(count, 8));
    for _ in 0..count {
        entries.push(CompositionOffsetEntry {
            count: r.u32()?,
            offset: r.i32()?,
        });
    }
    Ok(BoxFields::CompositionOffsets(entries))
}

fn decode_stss(r: &mut FieldReader<'_>) -> Result<BoxFields> {
    r.full_box()?;
    let count = r.u32()?;
    let mut samples = Vec::with_capacity(r.capacity(count, 4));
    for _ in 0..count {
        samples.push(r.u32()?);
    }
    Ok(BoxFields::SyncSamples(samples))
}

fn decode_stsd(r: &mut FieldReader<'_>) -> Result<BoxFields> {
    r.full_box()?;
    let entry_count = r.u32()?;
    Ok(BoxFields::SampleDescription { entry_count })
}

fn decode_visual_entry(r: &mut FieldReader<'_>) -> Result<BoxFields> {
    r.skip(6)?;
    let data_reference_index = r.u16()?;
    // pre_defined, reserved, pre_defined[3]
    r.skip(2 + 2 + 12)?;
    let width = r.u16()?;
    let height = r.u16()?;
    // horizresolution, vertresolution, reserved, frame_count
    r.skip(4 + 4 + 4 + 2)?;
    let name = r.bytes(32)?;
    let len = (name[0] as usize).min(31);
    let compressor = String::from_utf8_lossy(&name[1..1 + len]).into_owned();
    Ok(BoxFields::VisualSampleEntry {
        data_reference_index,
        width,
        height,
        compressor,
    })
}

fn decode_audio_entry(r: &mut FieldReader<'_>) -> Result<BoxFields> {
    r.skip(6)?;
    let data_reference_index = r.u16()?;
    // version, revision, vendor
    r.skip(2 + 2 + 4)?;
    let channels = r.u16()?;
    let sample_size = r.u16()?;
    // compression_id, packet_size
    r.skip(4)?;
    let sample_rate = r.u32()? >> 16;
    Ok(BoxFields::AudioSampleEntry {
        data_reference_index,
        channels,
        sample_size,
        sample_rate,
    })
}

fn decode_avcc(r: &mut FieldReader<'_>) -> Result<BoxFields> {
    let _configuration_version = r.u8()?;
    let profile_idc = r.u8()?;
    let profile_compatibility = r.u8()?;
    let level_idc = r.u8()?;
    let nal_length_size = (r.u8()? & 0x03) + 1;

    let sps_count = r.u8()? & 0x1F;
    let mut sps = Vec::with_capacity(sps_count as usize);
    for _ in 0..sps_count {
        let len = r.u16()? as usize;
        sps.push(r.bytes(len)?.to_vec());
    }

    let pps_count = r.u8()?;
    let mut pps = Vec::with_capacity(pps_count as usize);
    for _ in 0..pps_count {
        let len = r.u16()? as usize;
        pps.push(r.bytes(len)?.to_vec());
    }

    let parsed_sps = match sps.first().map(|nal| parse_sps(nal)) {
        Some(Ok(parsed)) => Some(parsed),
        Some(Err(e)) => {
            warn!("avcC carries an unparseable SPS: {}", e);
            None
        }
        None => None,
    };

    Ok(BoxFields::AvcConfig(AvcConfig {
        profile_idc,
        profile_compatibility,
        level_idc,
        nal_length_size,
        sps,
        pps,
        parsed_sps,
    }))
}

fn decode_hvcc(r: &mut FieldReader<'_>) -> Result<BoxFields> {
    let _configuration_version = r.u8()?;
    let byte = r.u8()?;
    let general_profile_space = byte >> 6;
    let general_tier_flag = byte & 0x20 != 0;
    let general_profile_idc = byte & 0x1F;
    let general_profile_compatibility_flags = r.u32()?;
    let mut general_constraint_indicator_flags = [0u8; 6];
    general_constraint_indicator_flags.copy_from_slice(r.bytes(6)?);
    let general_level_idc = r.u8()?;
    // min_spatial_segmentation_idc, parallelismType
    r.skip(2 + 1)?;
    let chroma_format_idc = r.u8()? & 0x03;
    let bit_depth_luma = (r.u8()? & 0x07) + 8;
    let bit_depth_chroma = (r.u8()? & 0x07) + 8;
    // avgFrameRate
    r.skip(2)?;
    let nal_length_size = (r.u8()? & 0x03) + 1;

    Ok(BoxFields::HevcConfig(HevcConfig {
        general_profile_space,
        general_tier_flag,
        general_profile_idc,
        general_profile_compatibility_flags,
        general_constraint_indicator_flags,
        general_level_idc,
        chroma_format_idc,
        bit_depth_luma,
        bit_depth_chroma,
        nal_length_size,
    }))
}

const ES_DESCRIPTOR_TAG: u8 = 0x03;
const DECODER_CONFIG_TAG: u8 = 0x04;
const DECODER_SPECIFIC_INFO_TAG: u8 = 0x05;

/// Read a descriptor tag and its variable-length size.
fn descriptor_header(r: &mut FieldReader<'_>) -> Result<(u8, usize)> {
    let tag = r.u8()?;
    let mut size = 0usize;
    for _ in 0..4 {
        let b = r.u8()?;
        size = (size << 7) | (b & 0x7F) as usize;
        if b & 0x80 == 0 {
            break;
        }
    }
    Ok((tag, size))
}

fn decode_esds(r: &mut FieldReader<'_>) -> Result<BoxFields> {
    r.full_box()?;
    let mut desc = EsDescriptor::default();

    let (tag, _) = descriptor_header(r)?;
    if tag != ES_DESCRIPTOR_TAG {
        return Err(Error::invalid_mp4(format!(
            "esds: expected ES_Descriptor, found tag {tag:#04x}"
        )));
    }
    desc.es_id = r.u16()?;
    let flags = r.u8()?;
    if flags & 0x80 != 0 {
        // dependsOn_ES_ID
        r.skip(2)?;
    }
    if flags & 0x40 != 0 {
        let url_len = r.u8()? as usize;
        r.skip(url_len)?;
    }
    if flags & 0x20 != 0 {
        // OCR_ES_Id
        r.skip(2)?;
    }

    while r.remaining() > 0 {
        let (tag, size) = descriptor_header(r)?;
        match tag {
            DECODER_CONFIG_TAG => {
                desc.object_type_indication = r.u8()?;
                desc.stream_type = r.u8()? >> 2;
                // bufferSizeDB
                r.u24()?;
                desc.max_bitrate = r.u32()?;
                desc.avg_bitrate = r.u32()?;
            }
            DECODER_SPECIFIC_INFO_TAG => {
                let asc = r.bytes(size.min(r.remaining()))?;
                if let Err(e) = read_audio_specific_config(asc, &mut desc) {
                    warn!("esds: unreadable AudioSpecificConfig: {}", e);
                }
                break;
            }
            _ => r.skip(size.min(r.remaining()))?,
        }
    }

    Ok(BoxFields::EsDescriptor(desc))
}

fn read_audio_specific_config(asc: &[u8], desc: &mut EsDescriptor) -> Result<()> {
    let mut bits = BitCursor::new(asc);
    let mut audio_object_type = bits.read_bits(5)?;
    if audio_object_type == 31 {
        audio_object_type = 32 + bits.read_bits(6)?;
    }
    let frequency_index = bits.read_bits(4)?;
    let sample_rate = if frequency_index == 0x0F {
        bits.read_bits(24)?
    } else {
        AAC_SAMPLE_RATES
            .get(frequency_index as usize)
            .copied()
            .ok_or_else(|| {
                Error::invalid_bitstream(format!("sampling frequency index {frequency_index}"))
            })?
    };
    let channels = bits.read_bits(4)?;

    desc.audio_object_type = Some(audio_object_type as u8);
    desc.sample_rate = Some(sample_rate);
    desc.channels = Some(channels as u8);
    Ok(())
}

fn decode_mfhd(r: &mut FieldReader<'_>) -> Result<BoxFields> {
    r.full_box()?;
    Ok(BoxFields::MovieFragmentHeader {
        sequence_number: r.u32()?,
    })
}

fn decode_tfhd(r: &mut FieldReader<'_>) -> Result<BoxFields> {
    let (_, flags) = r.full_box()?;
    let mut tfhd = TrackFragmentHeader {
        track_id: r.u32()?,
        flags,
        ..Default::default()
    };
    if flags & TrackFragmentHeader::BASE_DATA_OFFSET != 0 {
        tfhd.base_data_offset = Some(r.u64()?);
    }
    if flags & TrackFragmentHeader::SAMPLE_DESCRIPTION_INDEX != 0 {
        tfhd.sample_description_index = Some(r.u32()?);
    }
    if flags & TrackFragmentHeader::DEFAULT_SAMPLE_DURATION != 0 {
        tfhd.default_sample_duration = Some(r.u32()?);
    }
    if flags & TrackFragmentHeader::DEFAULT_SAMPLE_SIZE != 0 {
        tfhd.default_sample_size = Some(r.u32()?);
    }
    if flags & TrackFragmentHeader::DEFAULT_SAMPLE_FLAGS != 0 {
        tfhd.default_sample_flags = Some(r.u32()?);
    }
    Ok(BoxFields::TrackFragmentHeader(tfhd))
}

fn decode_tfdt(r: &mut FieldReader<'_>) -> Result<BoxFields> {
    let (version, _) = r.full_box()?;
    Ok(BoxFields::TrackFragmentDecodeTime {
        base_media_decode_time: r.versioned(version)?,
    })
}

fn decode_trun(r: &mut FieldReader<'_>) -> Result<BoxFields> {
    let (version, flags) = r.full_box()?;
    let sample_count = r.u32()?;

    let mut run = TrackRun {
        version,
        flags,
        ..Default::default()
    };
    if flags & TrackRun::DATA_OFFSET != 0 {
        run.data_offset = Some(r.i32()?);
    }
    if flags & TrackRun::FIRST_SAMPLE_FLAGS != 0 {
        run.first_sample_flags = Some(r.u32()?);
    }

    let per_sample = [
        TrackRun::SAMPLE_DURATION,
        TrackRun::SAMPLE_SIZE,
        TrackRun::SAMPLE_FLAGS,
        TrackRun::SAMPLE_COMPOSITION_OFFSET,
    ]
    .iter()
    .filter(|&&f| flags & f != 0)
    .count()
        * 4;

    run.samples
        .reserve(r.capacity(sample_count, per_sample.max(1)));
    for _ in 0..sample_count {
        let mut sample = TrackRunSample::default();
        if flags & TrackRun::SAMPLE_DURATION != 0 {
            sample.duration = Some(r.u32()?);
        }
        if flags & TrackRun::SAMPLE_SIZE != 0 {
            sample.size = Some(r.u32()?);
        }
        if flags & TrackRun::SAMPLE_FLAGS != 0 {
            sample.flags = Some(r.u32()?);
        }
        if flags & TrackRun::SAMPLE_COMPOSITION_OFFSET != 0 {
            sample.composition_offset = Some(r.i32()?);
        }
        run.samples.push(sample);
    }

    Ok(BoxFields::TrackRun(run))
}

fn decode_trex(r: &mut FieldReader<'_>) -> Result<BoxFields> {
    r.full_box()?;
    Ok(BoxFields::TrackExtends(TrackExtends {
        track_id: r.u32()?,
        default_sample_description_index: r.u32()?,
        default_sample_duration: r.u32()?,
        default_sample_size: r.u32()?,
        default_sample_flags: r.u32()?,
    }))
}

fn decode_sidx(r: &mut FieldReader<'_>) -> Result<BoxFields> {
    let (version, _) = r.full_box()?;
    let reference_id = r.u32()?;
    let timescale = r.u32()?;
    let earliest_presentation_time = r.versioned(version)?;
    let first_offset = r.versioned(version)?;
    r.skip(2)?;
    let count = r.u16()?;

    let mut references = Vec::with_capacity(r.capacity(count as u32, 12));
    for _ in 0..count {
        let word = r.u32()?;
        let subsegment_duration = r.u32()?;
        let sap = r.u32()?;
        references.push(SegmentReference {
            reference_type: word >> 31 == 1,
            referenced_size: word & 0x7FFF_FFFF,
            subsegment_duration,
            starts_with_sap: sap >> 31 == 1,
            sap_type: ((sap >> 28) & 0x07) as u8,
            sap_delta_time: sap & 0x0FFF_FFFF,
        });
    }

    Ok(BoxFields::SegmentIndex(SegmentIndex {
        reference_id,
        timescale,
        earliest_presentation_time,
        first_offset,
        references,
    }))
}

fn decode_pssh(r: &mut FieldReader<'_>) -> Result<BoxFields> {
    let (version, _) = r.full_box()?;
    let system_id = r.array16()?;
    let mut key_ids = Vec::new();
    if version > 0 {
        let count = r.u32()?;
        key_ids.reserve(r.capacity(count, 16));
        for _ in 0..count {
            key_ids.push(r.array16()?);
        }
    }
    let size = r.u32()? as usize;
    let data = r.bytes(size)?.to_vec();
    Ok(BoxFields::ProtectionSystem(ProtectionSystem {
        system_id,
        key_ids,
        data,
    }))
}

fn decode_emsg(r: &mut FieldReader<'_>) -> Result<BoxFields> {
    let (version, _) = r.full_box()?;
    let mut msg = EventMessage::default();
    if version == 0 {
        msg.scheme_id_uri = r.cstring();
        msg.value = r.cstring();
        msg.timescale = r.u32()?;
        msg.presentation_time_delta = Some(r.u32()?);
        msg.event_duration = r.u32()?;
        msg.id = r.u32()?;
    } else {
        msg.timescale = r.u32()?;
        msg.presentation_time = Some(r.u64()?);
        msg.event_duration = r.u32()?;
        msg.id = r.u32()?;
        msg.scheme_id_uri = r.cstring();
        msg.value = r.cstring();
    }
    msg.message_data = r.rest().to_vec();
    Ok(BoxFields::EventMessage(msg))
}
