//! Error types for framescope-media.

use std::io;
use thiserror::Error;

/// Result type for framescope-media operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for framescope-media operations.
///
/// Only structural corruption and bit-level exhaustion surface here.
/// Unknown-but-well-formed input degrades to opaque output, and running out
/// of buffered bytes mid-header is the normal "need more data" state.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A bit-level read ran past the end of its buffer.
    #[error("Bitstream exhausted: need {need} bits, have {have}")]
    BitstreamExhausted { need: usize, have: usize },

    /// A bitstream field decoded to an impossible value.
    #[error("Invalid bitstream: {0}")]
    InvalidBitstream(String),

    /// Invalid MP4 file structure.
    #[error("Invalid MP4: {0}")]
    InvalidMp4(String),

    /// A box larger than the configured buffering limit.
    #[error("Box {box_type} of {size} bytes exceeds maximum {max}")]
    BoxTooLarge { box_type: String, size: u64, max: u64 },

    /// The time-to-sample and sample-to-chunk tables disagree.
    #[error("Track {track_id}: time-to-sample table describes {timing} samples but chunk layout holds {chunks}")]
    SampleCountMismatch {
        track_id: u32,
        timing: u64,
        chunks: u64,
    },

    /// The sample-size table disagrees with the time-to-sample table.
    #[error("Track {track_id}: {timing} timed samples but {sizes} sample sizes")]
    SampleSizeMismatch {
        track_id: u32,
        timing: u64,
        sizes: u64,
    },

    /// No transport-stream sync byte or elementary-stream marker found.
    #[error("No sync byte found in {scanned} bytes")]
    NoSyncByte { scanned: usize },
}

impl Error {
    /// Create an invalid MP4 error.
    pub fn invalid_mp4(msg: impl Into<String>) -> Self {
        Self::InvalidMp4(msg.into())
    }

    /// Create an invalid bitstream error.
    pub fn invalid_bitstream(msg: impl Into<String>) -> Self {
        Self::InvalidBitstream(msg.into())
    }

    /// Whether this error aborts the demux session rather than a single unit.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::InvalidMp4(_)
                | Self::BoxTooLarge { .. }
                | Self::SampleCountMismatch { .. }
                | Self::SampleSizeMismatch { .. }
                | Self::NoSyncByte { .. }
        )
    }
}
