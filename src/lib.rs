//! Framescope - frame-level inspection of MP4 and MPEG-TS files
//!
//! This library crate exposes the CLI internals for integration testing.

pub mod config;
pub mod inspect;
