//! Progressive MP4 sample table reconstruction.
//!
//! A track's `stbl` carries independently run-length-compressed tables:
//! - stts: sample durations (decoding time)
//! - stss: sync sample table (keyframes)
//! - stsc: sample-to-chunk mapping
//! - stsz: sample sizes
//! - stco/co64: chunk offsets
//! - ctts: composition time offsets (for B-frames)
//!
//! [`SampleTables::reconstruct`] joins them into one [`Frame`] per sample.

use std::collections::HashSet;

use super::fields::{CompositionOffsetEntry, SampleToChunkEntry, TimeToSampleEntry};
use crate::track::{checked_ticks_to_micros, Frame, FrameType};
use crate::{Error, Result};

/// Upper bound on samples per track, far above any real file.
const MAX_SAMPLES: u64 = 1 << 26;

/// The sample-table boxes collected from one `stbl`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SampleTables {
    pub time_to_sample: Vec<TimeToSampleEntry>,
    /// `None` when the track has no `stss`, meaning every sample is sync.
    pub sync_samples: Option<Vec<u32>>,
    pub sample_to_chunk: Vec<SampleToChunkEntry>,
    pub uniform_size: u32,
    pub sample_size_count: u32,
    pub sample_sizes: Vec<u32>,
    pub chunk_offsets: Vec<u64>,
    pub composition_offsets: Option<Vec<CompositionOffsetEntry>>,
}

impl SampleTables {
    /// Whether no sample-table box has been seen.
    pub fn is_empty(&self) -> bool {
        self.time_to_sample.is_empty()
            && self.sample_to_chunk.is_empty()
            && self.chunk_offsets.is_empty()
            && self.sample_size_count == 0
    }

    /// Total samples described by the time-to-sample runs.
    pub fn timed_sample_count(&self) -> u64 {
        self.time_to_sample.iter().map(|e| e.count as u64).sum()
    }

    /// Rebuild the frame timeline of track `track_id`.
    ///
    /// Runs four passes (timing, composition offsets, chunk expansion, byte
    /// offsets) into a fresh vector, so on error nothing is attached
    /// anywhere. The time-to-sample, sample-size and chunk tables must agree
    /// on the sample count.
    pub fn reconstruct(&self, track_id: u32, timescale: u32) -> Result<Vec<Frame>> {
        if self.is_empty() {
            return Ok(Vec::new());
        }

        let timed = self.timed_sample_count();
        if timed > MAX_SAMPLES {
            return Err(Error::invalid_mp4(format!(
                "track {track_id}: implausible sample count {timed}"
            )));
        }
        if self.sample_size_count as u64 != timed {
            return Err(Error::SampleSizeMismatch {
                track_id,
                timing: timed,
                sizes: self.sample_size_count as u64,
            });
        }

        let mut frames = self.resolve_timing(track_id, timescale)?;
        self.resolve_composition_offsets(&mut frames, track_id, timescale)?;

        let chunk_counts = self.chunk_sample_counts()?;
        let chunked: u64 = chunk_counts.iter().map(|&n| n as u64).sum();
        if chunked != frames.len() as u64 {
            return Err(Error::SampleCountMismatch {
                track_id,
                timing: frames.len() as u64,
                chunks: chunked,
            });
        }

        self.resolve_offsets(&mut frames, &chunk_counts, track_id)?;
        Ok(frames)
    }

    fn sample_size(&self, index: usize) -> u32 {
        if self.uniform_size > 0 {
            self.uniform_size
        } else {
            self.sample_sizes.get(index).copied().unwrap_or(0)
        }
    }

    /// Pass 1: decode times, durations and sync flags.
    fn resolve_timing(&self, track_id: u32, timescale: u32) -> Result<Vec<Frame>> {
        let sync: Option<HashSet<u32>> = self
            .sync_samples
            .as_ref()
            .map(|s| s.iter().copied().collect());
        let mut frames = Vec::with_capacity(self.timed_sample_count() as usize);
        let mut dts = 0i64;

        for entry in &self.time_to_sample {
            let duration_us = entry.delta as f64 * 1_000_000.0 / timescale.max(1) as f64;
            for _ in 0..entry.count {
                let index = frames.len();
                // stss numbers samples from 1.
                let frame_type = match &sync {
                    Some(set) if !set.contains(&(index as u32 + 1)) => FrameType::P,
                    _ => FrameType::I,
                };
                let decode_time_us = checked_ticks_to_micros(dts, timescale)
                    .ok_or_else(|| out_of_range(track_id, "decode time"))?;
                frames.push(
                    Frame::new(frame_type, decode_time_us, self.sample_size(index))
                        .with_duration(duration_us),
                );
                dts += entry.delta as i64;
            }
        }

        Ok(frames)
    }

    /// Pass 2: presentation offsets from `ctts`.
    fn resolve_composition_offsets(
        &self,
        frames: &mut [Frame],
        track_id: u32,
        timescale: u32,
    ) -> Result<()> {
        let Some(entries) = &self.composition_offsets else {
            return Ok(());
        };

        let mut decode_ticks = 0i64;
        let mut deltas = self
            .time_to_sample
            .iter()
            .flat_map(|e| std::iter::repeat(e.delta as i64).take(e.count as usize));
        let mut frames = frames.iter_mut();

        for entry in entries {
            for _ in 0..entry.count {
                let Some(frame) = frames.next() else {
                    return Ok(());
                };
                let pts = checked_ticks_to_micros(decode_ticks + entry.offset as i64, timescale)
                    .ok_or_else(|| out_of_range(track_id, "presentation time"))?;
                frame.presentation_time_offset_us = pts - frame.decode_time_us;
                decode_ticks += deltas.next().unwrap_or(0);
            }
        }
        Ok(())
    }

    /// Pass 3: flat per-chunk sample counts from the `stsc` runs.
    ///
    /// Each run covers chunks from its `first_chunk` up to the next run's,
    /// the last one extending to the end of the chunk-offset table.
    fn chunk_sample_counts(&self) -> Result<Vec<u32>> {
        let chunk_count = self.chunk_offsets.len() as u32;
        let mut counts = Vec::with_capacity(chunk_count as usize);
        let mut prev_first = 0u32;

        for (i, entry) in self.sample_to_chunk.iter().enumerate() {
            if entry.first_chunk <= prev_first {
                return Err(Error::invalid_mp4(format!(
                    "stsc entry {i} starts at chunk {} after chunk {prev_first}",
                    entry.first_chunk
                )));
            }
            if i == 0 && entry.first_chunk != 1 {
                return Err(Error::invalid_mp4(format!(
                    "stsc starts at chunk {}",
                    entry.first_chunk
                )));
            }
            prev_first = entry.first_chunk;
            if entry.first_chunk > chunk_count {
                break;
            }

            let next_first = self
                .sample_to_chunk
                .get(i + 1)
                .map_or(chunk_count + 1, |next| next.first_chunk)
                .min(chunk_count + 1);
            for _ in entry.first_chunk..next_first {
                counts.push(entry.samples_per_chunk);
            }
        }

        Ok(counts)
    }

    /// Pass 4: absolute byte offsets, chunk base plus preceding sizes.
    fn resolve_offsets(
        &self,
        frames: &mut [Frame],
        chunk_counts: &[u32],
        track_id: u32,
    ) -> Result<()> {
        let mut frames = frames.iter_mut();
        for (&base, &count) in self.chunk_offsets.iter().zip(chunk_counts) {
            let mut offset = base;
            for frame in frames.by_ref().take(count as usize) {
                frame.byte_offset = Some(offset);
                offset = offset
                    .checked_add(frame.size as u64)
                    .ok_or_else(|| out_of_range(track_id, "byte offset"))?;
            }
        }
        Ok(())
    }
}

fn out_of_range(track_id: u32, what: &str) -> Error {
    Error::invalid_mp4(format!("track {track_id}: sample {what} out of range"))
}
