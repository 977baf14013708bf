//! Uniform demultiplexer contract and container sniffing.

use std::collections::BTreeMap;
use std::fmt;

use tracing::debug;

use crate::es::{AdtsHeader, MpegAudioHeader};
use crate::mp4::{BoxType, Mp4Demuxer};
use crate::track::Track;
use crate::ts::{TsDemuxer, PACKET_SIZE, SYNC_BYTE};
use crate::Result;

/// Default cap on a single buffered MP4 box.
pub const DEFAULT_MAX_BOX_SIZE: u64 = 64 * 1024 * 1024;

/// Options shared by all demultiplexers.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct DemuxOptions {
    /// Largest non-skippable MP4 box that is buffered before failing.
    pub max_box_size: u64,
    /// Keep the parsed MP4 box tree for inspection.
    pub keep_box_tree: bool,
}

impl Default for DemuxOptions {
    fn default() -> Self {
        Self {
            max_box_size: DEFAULT_MAX_BOX_SIZE,
            keep_box_tree: true,
        }
    }
}

/// Container families a demultiplexer exists for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum ContainerKind {
    Mp4,
    MpegTs,
    /// Raw ADTS or MPEG audio elementary stream.
    RawAudio,
}

impl ContainerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mp4 => "mp4",
            Self::MpegTs => "mpegts",
            Self::RawAudio => "raw-audio",
        }
    }
}

impl fmt::Display for ContainerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Push-driven demultiplexer.
///
/// `append` may be called any number of times with successive chunks of the
/// input; chunk boundaries never change the result. `end` flushes pending
/// units and sorts every track by decode time. A structural error stops the
/// demultiplexer, and later calls fail too.
pub trait Demuxer: Send + fmt::Debug {
    fn kind(&self) -> ContainerKind;

    fn append(&mut self, data: &[u8]) -> Result<()>;

    fn end(&mut self) -> Result<()>;

    fn tracks(&self) -> &BTreeMap<u32, Track>;

    /// Release fully consumed input, returning the number of bytes freed.
    fn prune(&mut self) -> usize {
        0
    }
}

/// Top-level box types an MP4 file may open with.
const MP4_LEADING_BOXES: [BoxType; 8] = [
    BoxType::FTYP,
    BoxType::STYP,
    BoxType::MOOV,
    BoxType::MOOF,
    BoxType::FREE,
    BoxType::SKIP,
    BoxType::MDAT,
    BoxType::SIDX,
];

/// Guess the container from the first bytes of a stream.
pub fn detect_container(data: &[u8]) -> Option<ContainerKind> {
    if let Some(fourcc) = data.get(4..8) {
        if MP4_LEADING_BOXES.iter().any(|t| t.0[..] == *fourcc) {
            return Some(ContainerKind::Mp4);
        }
    }

    if data.first() == Some(&SYNC_BYTE)
        && data.get(PACKET_SIZE).map_or(true, |&b| b == SYNC_BYTE)
    {
        return Some(ContainerKind::MpegTs);
    }

    if data.starts_with(b"ID3") {
        return Some(ContainerKind::RawAudio);
    }
    match data {
        [b0, b1, ..] if AdtsHeader::is_sync(*b0, *b1) || MpegAudioHeader::is_sync(*b0, *b1) => {
            Some(ContainerKind::RawAudio)
        }
        _ => None,
    }
}

type Factory = fn(&DemuxOptions) -> Box<dyn Demuxer>;

fn mp4_demuxer(options: &DemuxOptions) -> Box<dyn Demuxer> {
    Box::new(Mp4Demuxer::new(options.clone()))
}

fn ts_demuxer(_: &DemuxOptions) -> Box<dyn Demuxer> {
    Box::new(TsDemuxer::new())
}

static FACTORIES: &[(ContainerKind, Factory)] = &[
    (ContainerKind::Mp4, mp4_demuxer),
    (ContainerKind::MpegTs, ts_demuxer),
    // The transport stream demuxer also recognises raw audio.
    (ContainerKind::RawAudio, ts_demuxer),
];

/// Create a demultiplexer for `kind`.
pub fn open_demuxer(kind: ContainerKind, options: &DemuxOptions) -> Box<dyn Demuxer> {
    debug!(%kind, "opening demuxer");
    FACTORIES
        .iter()
        .find(|(k, _)| *k == kind)
        .map_or_else(|| ts_demuxer(options), |(_, factory)| factory(options))
}

/// Detect the container of `data` and open a matching demultiplexer.
pub fn open_for(data: &[u8], options: &DemuxOptions) -> Option<Box<dyn Demuxer>> {
    detect_container(data).map(|kind| open_demuxer(kind, options))
}

/// Demultiplex a complete in-memory input in `chunk_size` appends.
pub fn demux_all(demuxer: &mut dyn Demuxer, data: &[u8], chunk_size: usize) -> Result<()> {
    for chunk in data.chunks(chunk_size.max(1)) {
        demuxer.append(chunk)?;
        demuxer.prune();
    }
    demuxer.end()
}
