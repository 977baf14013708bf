//! Framescope-Media: incremental MP4 and MPEG-TS demultiplexing into
//! per-track frame timelines
//!
//! Callers push byte chunks of any size into a [`Demuxer`] and call
//! [`Demuxer::end`] once the input is exhausted. Each elementary stream
//! becomes a [`Track`] holding one [`Frame`] per coded frame or audio access
//! unit, with decode time, presentation offset, size and (where the
//! container knows it) byte offset.
//!
//! # Modules
//!
//! - `bits` - Bit-granular reader with Exp-Golomb decoding
//! - `codec` - H.264 NAL units, SPS and slice headers
//! - `mp4` - Box tree, stateful track binding, sample-table and fragment
//!   reconstruction
//! - `ts` - Transport packets, PAT/PMT, PES reassembly and 33-bit timestamps
//! - `es` - Payload readers for ADTS, H.264 Annex-B and MPEG audio
//! - `track` - The Track/Frame timeline model
//! - `demux` - The shared demuxer contract and container sniffing
//!
//! # Example
//!
//! ```no_run
//! use framescope_media::{demux_all, detect_container, open_demuxer, DemuxOptions};
//!
//! let data = std::fs::read("input.ts")?;
//! let kind = detect_container(&data).expect("unknown container");
//! let mut demuxer = open_demuxer(kind, &DemuxOptions::default());
//! demux_all(demuxer.as_mut(), &data, 64 * 1024)?;
//! for track in demuxer.tracks().values() {
//!     println!("{} {} frames", track.mime_type, track.frame_count());
//! }
//! # Ok::<(), framescope_media::Error>(())
//! ```

pub mod bits;
pub mod codec;
pub mod demux;
pub mod error;
pub mod es;
pub mod mp4;
pub mod track;
pub mod ts;

pub use bits::BitCursor;
pub use demux::{
    demux_all, detect_container, open_demuxer, open_for, ContainerKind, DemuxOptions, Demuxer,
};
pub use error::{Error, Result};
pub use mp4::{BoxType, Mp4Box, Mp4Demuxer};
pub use track::{AudioConfig, Frame, FrameType, Track, TrackConfig, TrackKind, VideoConfig};
pub use ts::TsDemuxer;
