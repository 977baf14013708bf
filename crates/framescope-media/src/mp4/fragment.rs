//! Fragmented MP4 track run reconstruction.

use super::fields::{TrackExtends, TrackFragmentHeader, TrackRun, SAMPLE_IS_NON_SYNC};
use crate::track::{checked_ticks_to_micros, Frame, FrameType};
use crate::{Error, Result};

/// Per-`traf` inputs for turning a `trun` into frames.
#[derive(Debug, Clone, Copy)]
pub struct RunContext<'a> {
    pub header: &'a TrackFragmentHeader,
    pub extends: Option<&'a TrackExtends>,
    pub timescale: u32,
    /// Offset that `trun` data offsets are relative to.
    pub base_data_offset: u64,
    /// Where the previous run's data ended, for runs with no data offset.
    pub next_data_offset: u64,
    /// Decode time of the first sample, in media ticks.
    pub decode_time: u64,
}

/// Frames of one run plus the state the following run continues from.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutput {
    pub frames: Vec<Frame>,
    pub end_decode_time: u64,
    pub end_data_offset: u64,
}

impl RunContext<'_> {
    fn default_duration(&self) -> u32 {
        self.header
            .default_sample_duration
            .or(self.extends.map(|t| t.default_sample_duration))
            .unwrap_or(0)
    }

    fn default_size(&self) -> u32 {
        self.header
            .default_sample_size
            .or(self.extends.map(|t| t.default_sample_size))
            .unwrap_or(0)
    }

    fn default_flags(&self) -> u32 {
        self.header
            .default_sample_flags
            .or(self.extends.map(|t| t.default_sample_flags))
            .unwrap_or(0)
    }
}

/// Expand a track run into frames.
///
/// Sample fields absent from the run fall back to the `tfhd` defaults, then
/// to the `trex` defaults. The first sample's flags may be overridden by
/// the run's `first_sample_flags`. Decode times or byte offsets that
/// overflow are rejected.
pub fn reconstruct_run(run: &TrackRun, ctx: &RunContext<'_>) -> Result<RunOutput> {
    let track_id = ctx.header.track_id;
    let timescale = ctx.timescale.max(1);
    let mut offset = match run.data_offset {
        Some(delta) => ctx
            .base_data_offset
            .checked_add_signed(delta as i64)
            .ok_or_else(|| overflow(track_id, "data offset"))?,
        None => ctx.next_data_offset,
    };
    let mut dts = ctx.decode_time;
    let mut frames = Vec::with_capacity(run.samples.len());

    for (i, sample) in run.samples.iter().enumerate() {
        let duration = sample.duration.unwrap_or_else(|| ctx.default_duration());
        let size = sample.size.unwrap_or_else(|| ctx.default_size());
        let flags = match (i, run.first_sample_flags) {
            (0, Some(first)) => first,
            _ => sample.flags.unwrap_or_else(|| ctx.default_flags()),
        };
        let frame_type = if flags & SAMPLE_IS_NON_SYNC != 0 {
            FrameType::P
        } else {
            FrameType::I
        };

        let dts_ticks = i64::try_from(dts).map_err(|_| overflow(track_id, "decode time"))?;
        let pts_ticks = dts_ticks
            .checked_add(sample.composition_offset.unwrap_or(0) as i64)
            .ok_or_else(|| overflow(track_id, "presentation time"))?;
        let decode_time_us = checked_ticks_to_micros(dts_ticks, timescale)
            .ok_or_else(|| overflow(track_id, "decode time"))?;
        let presentation_time_us = checked_ticks_to_micros(pts_ticks, timescale)
            .ok_or_else(|| overflow(track_id, "presentation time"))?;

        frames.push(
            Frame::new(frame_type, decode_time_us, size)
                .with_duration(duration as f64 * 1_000_000.0 / timescale as f64)
                .with_byte_offset(offset)
                .with_presentation_offset(presentation_time_us - decode_time_us),
        );

        dts = dts
            .checked_add(duration as u64)
            .ok_or_else(|| overflow(track_id, "decode time"))?;
        offset = offset
            .checked_add(size as u64)
            .ok_or_else(|| overflow(track_id, "data offset"))?;
    }

    Ok(RunOutput {
        frames,
        end_decode_time: dts,
        end_data_offset: offset,
    })
}

fn overflow(track_id: u32, what: &str) -> Error {
    Error::invalid_mp4(format!("track {track_id}: track run {what} out of range"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mp4::fields::TrackRunSample;

    fn sample(size: u32, flags: Option<u32>, cto: Option<i32>) -> TrackRunSample {
        TrackRunSample {
            duration: None,
            size: Some(size),
            flags,
            composition_offset: cto,
        }
    }

    #[test]
    fn test_run_with_defaults() {
        let header = TrackFragmentHeader {
            track_id: 1,
            default_sample_duration: Some(3000),
            ..Default::default()
        };
        let extends = TrackExtends {
            track_id: 1,
            default_sample_flags: SAMPLE_IS_NON_SYNC,
            ..Default::default()
        };
        let run = TrackRun {
            data_offset: Some(100),
            first_sample_flags: Some(0),
            samples: vec![
                sample(500, None, Some(6000)),
                sample(40, None, Some(0)),
                sample(60, None, Some(3000)),
            ],
            ..Default::default()
        };
        let ctx = RunContext {
            header: &header,
            extends: Some(&extends),
            timescale: 90_000,
            base_data_offset: 1000,
            next_data_offset: 0,
            decode_time: 90_000,
        };

        let out = reconstruct_run(&run, &ctx).unwrap();
        let types: Vec<_> = out.frames.iter().map(|f| f.frame_type).collect();
        assert_eq!(types, vec![FrameType::I, FrameType::P, FrameType::P]);

        let offsets: Vec<_> = out.frames.iter().map(|f| f.byte_offset.unwrap()).collect();
        assert_eq!(offsets, vec![1100, 1600, 1640]);

        assert_eq!(out.frames[0].decode_time_us, 1_000_000);
        assert_eq!(out.frames[0].presentation_time_us(), 1_066_666);
        assert_eq!(out.frames[1].decode_time_us, 1_033_333);
        assert_eq!(out.end_decode_time, 99_000);
        assert_eq!(out.end_data_offset, 1700);
    }

    #[test]
    fn test_run_continues_previous_data() {
        let header = TrackFragmentHeader::default();
        let run = TrackRun {
            samples: vec![sample(10, Some(0), None)],
            ..Default::default()
        };
        let ctx = RunContext {
            header: &header,
            extends: None,
            timescale: 1000,
            base_data_offset: 0,
            next_data_offset: 4242,
            decode_time: 0,
        };

        let out = reconstruct_run(&run, &ctx).unwrap();
        assert_eq!(out.frames[0].byte_offset, Some(4242));
        assert_eq!(out.frames[0].duration_us, Some(0.0));
    }

    #[test]
    fn test_decode_time_overflow_is_rejected() {
        let header = TrackFragmentHeader {
            track_id: 3,
            default_sample_duration: Some(10),
            ..Default::default()
        };
        let run = TrackRun {
            samples: vec![sample(10, Some(0), None), sample(10, Some(0), None)],
            ..Default::default()
        };
        let ctx = RunContext {
            header: &header,
            extends: None,
            timescale: 1000,
            base_data_offset: 0,
            next_data_offset: 0,
            decode_time: u64::MAX - 1,
        };

        assert!(matches!(
            reconstruct_run(&run, &ctx),
            Err(Error::InvalidMp4(_))
        ));
    }

    #[test]
    fn test_decode_time_beyond_i64_is_rejected() {
        let header = TrackFragmentHeader::default();
        let run = TrackRun {
            samples: vec![sample(10, Some(0), None)],
            ..Default::default()
        };
        let ctx = RunContext {
            header: &header,
            extends: None,
            timescale: 1000,
            base_data_offset: 0,
            next_data_offset: 0,
            decode_time: i64::MAX as u64 + 1,
        };

        assert!(reconstruct_run(&run, &ctx).is_err());
    }

    #[test]
    fn test_data_offset_overflow_is_rejected() {
        let header = TrackFragmentHeader::default();
        let run = TrackRun {
            data_offset: Some(8),
            samples: vec![sample(10, Some(0), None), sample(10, Some(0), None)],
            ..Default::default()
        };
        let ctx = RunContext {
            header: &header,
            extends: None,
            timescale: 1000,
            base_data_offset: u64::MAX - 20,
            next_data_offset: 0,
            decode_time: 0,
        };

        assert!(matches!(
            reconstruct_run(&run, &ctx),
            Err(Error::InvalidMp4(_))
        ));
    }
}
