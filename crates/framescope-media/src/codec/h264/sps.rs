//! H.264 Sequence Parameter Set (SPS) parsing

use super::nal::remove_emulation_prevention;
use crate::bits::BitCursor;
use crate::track::VideoConfig;
use crate::{Error, Result};

/// Decoded sequence parameter set.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct Sps {
    pub profile_idc: u8,
    /// constraint_set0..5 flags plus reserved bits, as one byte
    pub constraint_flags: u8,
    pub level_idc: u8,
    pub seq_parameter_set_id: u32,
    /// 0 = monochrome, 1 = 4:2:0, 2 = 4:2:2, 3 = 4:4:4
    pub chroma_format_idc: u32,
    pub bit_depth_luma: u8,
    pub bit_depth_chroma: u8,
    pub frame_mbs_only: bool,
    /// Size of the decoded picture before cropping
    pub coded_width: u32,
    pub coded_height: u32,
    /// Display size after frame cropping
    pub width: u32,
    pub height: u32,
    /// Sample aspect ratio as (horizontal, vertical)
    pub sample_aspect_ratio: (u32, u32),
    /// Frames per second from VUI timing info
    pub frame_rate: Option<f64>,
}

impl Sps {
    /// Human-readable profile name.
    pub fn profile_name(&self) -> &'static str {
        let constrained = self.constraint_flags & 0x40 != 0;
        match self.profile_idc {
            66 if constrained => "Constrained Baseline",
            66 => "Baseline",
            77 => "Main",
            88 => "Extended",
            100 => "High",
            110 => "High 10",
            122 => "High 4:2:2",
            244 => "High 4:4:4 Predictive",
            44 => "CAVLC 4:4:4 Intra",
            83 => "Scalable Baseline",
            86 => "Scalable High",
            118 => "Multiview High",
            128 => "Stereo High",
            _ => "Unknown",
        }
    }

    /// Level as written in the H.264 level tables, e.g. "3.1" or "1b".
    pub fn level_name(&self) -> String {
        let constraint_set3 = self.constraint_flags & 0x10 != 0;
        if self.level_idc == 11 && constraint_set3 && matches!(self.profile_idc, 66 | 77 | 88) {
            return "1b".to_string();
        }
        if self.level_idc % 10 == 0 {
            format!("{}", self.level_idc / 10)
        } else {
            format!("{}.{}", self.level_idc / 10, self.level_idc % 10)
        }
    }

    /// RFC 6381 codec string, e.g. `avc1.64001f`.
    pub fn codec_string(&self) -> String {
        format!(
            "avc1.{:02x}{:02x}{:02x}",
            self.profile_idc, self.constraint_flags, self.level_idc
        )
    }
}

impl From<&Sps> for VideoConfig {
    fn from(sps: &Sps) -> Self {
        VideoConfig {
            codec: sps.codec_string(),
            profile: Some(sps.profile_name().to_string()),
            level: Some(sps.level_name()),
            width: sps.width,
            height: sps.height,
            chroma_format_idc: Some(sps.chroma_format_idc),
            bit_depth: Some(sps.bit_depth_luma),
            sample_aspect_ratio: Some(sps.sample_aspect_ratio),
            frame_rate: sps.frame_rate,
        }
    }
}

const SAR_TABLE: [(u32, u32); 17] = [
    (1, 1),
    (1, 1),
    (12, 11),
    (10, 11),
    (16, 11),
    (40, 33),
    (24, 11),
    (20, 11),
    (32, 11),
    (80, 33),
    (18, 11),
    (15, 11),
    (64, 33),
    (160, 99),
    (4, 3),
    (3, 2),
    (2, 1),
];

/// Profiles whose SPS carries chroma format and bit depth fields.
fn has_chroma_info(profile_idc: u8) -> bool {
    matches!(
        profile_idc,
        100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135
    )
}

/// Parse an SPS NAL unit, header byte included.
pub fn parse_sps(nal: &[u8]) -> Result<Sps> {
    if nal.len() < 4 {
        return Err(Error::invalid_bitstream("SPS shorter than 4 bytes"));
    }

    let rbsp = remove_emulation_prevention(&nal[1..]);
    let mut reader = BitCursor::new(&rbsp);

    let profile_idc = reader.read_u8()?;
    let constraint_flags = reader.read_u8()?;
    let level_idc = reader.read_u8()?;
    let seq_parameter_set_id = reader.read_ue()?;
    if seq_parameter_set_id > 31 {
        return Err(Error::invalid_bitstream(format!(
            "seq_parameter_set_id {seq_parameter_set_id} out of range"
        )));
    }

    let mut chroma_format_idc = 1;
    let mut separate_colour_plane = false;
    let mut bit_depth_luma = 8;
    let mut bit_depth_chroma = 8;

    if has_chroma_info(profile_idc) {
        chroma_format_idc = reader.read_ue()?;
        if chroma_format_idc > 3 {
            return Err(Error::invalid_bitstream(format!(
                "chroma_format_idc {chroma_format_idc} out of range"
            )));
        }
        if chroma_format_idc == 3 {
            separate_colour_plane = reader.read_bool()?;
        }
        bit_depth_luma = 8 + reader.read_ue()?.min(6) as u8;
        bit_depth_chroma = 8 + reader.read_ue()?.min(6) as u8;
        // qpprime_y_zero_transform_bypass_flag
        reader.skip_bits(1)?;

        let seq_scaling_matrix_present = reader.read_bool()?;
        if seq_scaling_matrix_present {
            let lists = if chroma_format_idc == 3 { 12 } else { 8 };
            for i in 0..lists {
                if reader.read_bool()? {
                    skip_scaling_list(&mut reader, if i < 6 { 16 } else { 64 })?;
                }
            }
        }
    }

    // log2_max_frame_num_minus4
    reader.skip_ue()?;

    let pic_order_cnt_type = reader.read_ue()?;
    match pic_order_cnt_type {
        0 => reader.skip_ue()?, // log2_max_pic_order_cnt_lsb_minus4
        1 => {
            reader.skip_bits(1)?; // delta_pic_order_always_zero_flag
            reader.skip_se()?; // offset_for_non_ref_pic
            reader.skip_se()?; // offset_for_top_to_bottom_field
            let cycle = reader.read_ue()?;
            for _ in 0..cycle {
                reader.skip_se()?; // offset_for_ref_frame
            }
        }
        2 => {}
        other => {
            return Err(Error::invalid_bitstream(format!(
                "pic_order_cnt_type {other} out of range"
            )));
        }
    }

    // max_num_ref_frames
    reader.skip_ue()?;
    // gaps_in_frame_num_value_allowed_flag
    reader.skip_bits(1)?;

    let width_in_mbs = reader.read_ue()? as u64 + 1;
    let height_in_map_units = reader.read_ue()? as u64 + 1;
    let frame_mbs_only = reader.read_bool()?;
    if !frame_mbs_only {
        // mb_adaptive_frame_field_flag
        reader.skip_bits(1)?;
    }
    // direct_8x8_inference_flag
    reader.skip_bits(1)?;

    let (mut crop_left, mut crop_right, mut crop_top, mut crop_bottom) = (0u64, 0u64, 0u64, 0u64);
    if reader.read_bool()? {
        crop_left = reader.read_ue()? as u64;
        crop_right = reader.read_ue()? as u64;
        crop_top = reader.read_ue()? as u64;
        crop_bottom = reader.read_ue()? as u64;
    }

    let field_factor = if frame_mbs_only { 1 } else { 2 };
    let coded_width = width_in_mbs * 16;
    let coded_height = height_in_map_units * 16 * field_factor;

    let chroma_array_type = if separate_colour_plane {
        0
    } else {
        chroma_format_idc
    };
    let (crop_unit_x, crop_unit_y) = match chroma_array_type {
        0 => (1, field_factor),
        1 => (2, 2 * field_factor),
        2 => (2, field_factor),
        _ => (1, field_factor),
    };

    let width = coded_width.saturating_sub((crop_left + crop_right) * crop_unit_x);
    let height = coded_height.saturating_sub((crop_top + crop_bottom) * crop_unit_y);

    let mut sample_aspect_ratio = (1, 1);
    let mut frame_rate = None;

    // The VUI is optional trailing data. A truncated VUI keeps the fields
    // decoded so far rather than failing the whole SPS.
    if reader.read_bool().unwrap_or(false) {
        if let Ok(vui) = parse_vui(&mut reader) {
            sample_aspect_ratio = vui.0;
            frame_rate = vui.1;
        }
    }

    Ok(Sps {
        profile_idc,
        constraint_flags,
        level_idc,
        seq_parameter_set_id,
        chroma_format_idc,
        bit_depth_luma,
        bit_depth_chroma,
        frame_mbs_only,
        coded_width: dimension(coded_width, "coded width")?,
        coded_height: dimension(coded_height, "coded height")?,
        width: dimension(width, "width")?,
        height: dimension(height, "height")?,
        sample_aspect_ratio,
        frame_rate,
    })
}

fn dimension(value: u64, name: &str) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| Error::invalid_bitstream(format!("{name} {value} out of range")))
}

fn skip_scaling_list(reader: &mut BitCursor<'_>, size: usize) -> Result<()> {
    let mut last_scale = 8i32;
    let mut next_scale = 8i32;
    for _ in 0..size {
        if next_scale != 0 {
            let delta = reader.read_se()?;
            next_scale = (last_scale + delta + 256) % 256;
        }
        if next_scale != 0 {
            last_scale = next_scale;
        }
    }
    Ok(())
}

/// Returns (sample aspect ratio, frame rate).
fn parse_vui(reader: &mut BitCursor<'_>) -> Result<((u32, u32), Option<f64>)> {
    let mut sar = (1, 1);

    // aspect_ratio_info_present_flag
    if reader.read_bool()? {
        let idc = reader.read_u8()?;
        if idc == 255 {
            let sar_width = reader.read_bits(16)?;
            let sar_height = reader.read_bits(16)?;
            if sar_width > 0 && sar_height > 0 {
                sar = (sar_width, sar_height);
            }
        } else if let Some(&entry) = SAR_TABLE.get(idc as usize) {
            sar = entry;
        }
    }

    // overscan_info_present_flag
    if reader.read_bool()? {
        reader.skip_bits(1)?; // overscan_appropriate_flag
    }

    // video_signal_type_present_flag
    if reader.read_bool()? {
        reader.skip_bits(4)?; // video_format, video_full_range_flag
        if reader.read_bool()? {
            reader.skip_bits(24)?; // colour_primaries, transfer, matrix
        }
    }

    // chroma_loc_info_present_flag
    if reader.read_bool()? {
        reader.skip_ue()?;
        reader.skip_ue()?;
    }

    let mut frame_rate = None;
    // timing_info_present_flag
    if reader.read_bool()? {
        let num_units_in_tick = reader.read_bits(32)?;
        let time_scale = reader.read_bits(32)?;
        if num_units_in_tick > 0 && time_scale > 0 {
            frame_rate = Some(time_scale as f64 / (2.0 * num_units_in_tick as f64));
        }
    }

    Ok((sar, frame_rate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitstream_io::{BigEndian, BitWrite, BitWriter};

    struct SpsWriter(BitWriter<Vec<u8>, BigEndian>);

    impl SpsWriter {
        fn new() -> Self {
            Self(BitWriter::endian(Vec::new(), BigEndian))
        }

        fn bits(&mut self, count: u32, value: u32) -> &mut Self {
            self.0.write(count, value).unwrap();
            self
        }

        fn flag(&mut self, value: bool) -> &mut Self {
            self.0.write_bit(value).unwrap();
            self
        }

        fn ue(&mut self, value: u32) -> &mut Self {
            let code = value as u64 + 1;
            let len = 64 - code.leading_zeros();
            for _ in 1..len {
                self.0.write_bit(false).unwrap();
            }
            self.0.write(len, code).unwrap();
            self
        }

        fn finish(mut self) -> Vec<u8> {
            // rbsp_stop_one_bit + alignment
            self.0.write_bit(true).unwrap();
            self.0.byte_align().unwrap();
            let mut nal = vec![0x67];
            nal.extend(self.0.into_writer());
            nal
        }
    }

    #[test]
    fn test_parse_baseline_720p_with_timing() {
        let mut w = SpsWriter::new();
        w.bits(8, 66).bits(8, 0xC0).bits(8, 31).ue(0);
        w.ue(0); // log2_max_frame_num_minus4
        w.ue(2); // pic_order_cnt_type
        w.ue(1).flag(false); // max_num_ref_frames, gaps
        w.ue(79).ue(44); // 80 x 45 macroblocks
        w.flag(true).flag(true); // frame_mbs_only, direct_8x8
        w.flag(false); // no cropping
        w.flag(true); // vui present
        w.flag(true).bits(8, 1); // aspect ratio 1:1
        w.flag(false).flag(false).flag(false);
        w.flag(true).bits(32, 1001).bits(32, 60000).flag(true);
        let nal = w.finish();

        let sps = parse_sps(&nal).unwrap();
        assert_eq!(sps.profile_idc, 66);
        assert_eq!(sps.profile_name(), "Constrained Baseline");
        assert_eq!(sps.level_name(), "3.1");
        assert_eq!(sps.codec_string(), "avc1.42c01f");
        assert_eq!(sps.chroma_format_idc, 1);
        assert_eq!((sps.width, sps.height), (1280, 720));
        assert_eq!(sps.sample_aspect_ratio, (1, 1));
        let fps = sps.frame_rate.unwrap();
        assert!((fps - 29.97).abs() < 0.01);
    }

    #[test]
    fn test_parse_high_1080p_with_cropping() {
        let mut w = SpsWriter::new();
        w.bits(8, 100).bits(8, 0).bits(8, 40).ue(0);
        w.ue(1).ue(0).ue(0).flag(false); // 4:2:0, 8-bit, 8-bit, qpprime
        w.flag(false); // no scaling matrix
        w.ue(0).ue(0).ue(4); // frame_num, poc type 0, poc lsb
        w.ue(4).flag(false);
        w.ue(119).ue(67); // 120 x 68 macroblocks = 1920 x 1088
        w.flag(true).flag(true);
        w.flag(true).ue(0).ue(0).ue(0).ue(4); // crop 8 lines off the bottom
        w.flag(false); // no vui
        let nal = w.finish();

        let sps = parse_sps(&nal).unwrap();
        assert_eq!(sps.profile_name(), "High");
        assert_eq!(sps.level_name(), "4");
        assert_eq!((sps.coded_width, sps.coded_height), (1920, 1088));
        assert_eq!((sps.width, sps.height), (1920, 1080));
        assert_eq!(sps.bit_depth_luma, 8);
        assert!(sps.frame_rate.is_none());
    }

    #[test]
    fn test_parse_interlaced_extended_sar() {
        let mut w = SpsWriter::new();
        w.bits(8, 77).bits(8, 0).bits(8, 30).ue(0);
        w.ue(0).ue(0).ue(0);
        w.ue(2).flag(false);
        w.ue(44).ue(17); // 720 x (18 * 16 * 2) = 720 x 576
        w.flag(false).flag(false).flag(true); // field coding, mbaff, direct_8x8
        w.flag(false);
        w.flag(true);
        w.flag(true).bits(8, 255).bits(16, 64).bits(16, 45);
        w.flag(false).flag(false).flag(false).flag(false);
        let nal = w.finish();

        let sps = parse_sps(&nal).unwrap();
        assert!(!sps.frame_mbs_only);
        assert_eq!((sps.width, sps.height), (720, 576));
        assert_eq!(sps.sample_aspect_ratio, (64, 45));
    }

    #[test]
    fn test_oversized_picture_is_rejected() {
        let mut w = SpsWriter::new();
        w.bits(8, 66).bits(8, 0).bits(8, 31).ue(0);
        w.ue(0).ue(2).ue(1).flag(false);
        w.ue(1 << 30).ue(44); // 2^30 + 1 macroblocks across
        w.flag(true).flag(true).flag(false).flag(false);
        let nal = w.finish();

        assert!(matches!(
            parse_sps(&nal),
            Err(Error::InvalidBitstream(_))
        ));
    }

    #[test]
    fn test_truncated_sps_fails() {
        assert!(parse_sps(&[0x67, 0x64, 0x00]).is_err());
        assert!(parse_sps(&[0x67, 0x64, 0x00, 0x28]).is_err());
    }
}
