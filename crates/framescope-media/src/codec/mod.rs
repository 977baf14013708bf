//! Codec bitstream metadata parsers.

pub mod h264;
