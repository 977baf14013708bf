//! File-level driver: streams a file through a demuxer and summarises the
//! resulting tracks.

use anyhow::{Context, Result};
use framescope_media::{
    detect_container, open_demuxer, ContainerKind, Demuxer, Frame, Mp4Box, Mp4Demuxer, Track,
    TrackConfig, TrackKind,
};
use serde::Serialize;
use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use crate::config::DemuxConfig;

/// Bytes read before giving up on recognising the container.
const SNIFF_LIMIT: usize = 4096;

/// Summary of one track.
#[derive(Debug, Clone, Serialize)]
pub struct TrackReport {
    pub id: u32,
    pub kind: TrackKind,
    pub mime_type: String,
    pub codec: Option<String>,
    pub frame_count: usize,
    pub keyframe_count: usize,
    pub total_bytes: u64,
    pub duration_secs: f64,
    pub frame_rate: Option<f64>,
    pub bitrate_bps: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frames: Option<Vec<Frame>>,
}

impl TrackReport {
    pub fn new(track: &Track, with_frames: bool) -> Self {
        let codec = match &track.config {
            TrackConfig::Video(v) if !v.codec.is_empty() => Some(v.codec.clone()),
            TrackConfig::Audio(a) if !a.codec.is_empty() => Some(a.codec.clone()),
            _ => None,
        };
        Self {
            id: track.id,
            kind: track.kind,
            mime_type: track.mime_type.clone(),
            codec,
            frame_count: track.frame_count(),
            keyframe_count: track.keyframe_count(),
            total_bytes: track.total_bytes(),
            duration_secs: track.duration_secs(),
            frame_rate: track.average_frame_rate(),
            bitrate_bps: track.bitrate_bps(),
            frames: with_frames.then(|| track.frames().to_vec()),
        }
    }
}

/// Summary of a demultiplexed file.
#[derive(Debug, Clone, Serialize)]
pub struct FileReport {
    pub path: PathBuf,
    pub container: ContainerKind,
    pub size: u64,
    pub tracks: Vec<TrackReport>,
}

impl FileReport {
    pub fn new(
        path: &Path,
        container: ContainerKind,
        size: u64,
        demuxer: &dyn Demuxer,
        with_frames: bool,
    ) -> Self {
        Self {
            path: path.to_path_buf(),
            container,
            size,
            tracks: demuxer
                .tracks()
                .values()
                .map(|t| TrackReport::new(t, with_frames))
                .collect(),
        }
    }
}

impl fmt::Display for FileReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "File: {}", self.path.display())?;
        writeln!(f, "Container: {}", self.container)?;
        writeln!(f, "Size: {} bytes", self.size)?;
        writeln!(f, "\nTracks: {}", self.tracks.len())?;
        for track in &self.tracks {
            write!(f, "{}", track)?;
        }
        Ok(())
    }
}

impl fmt::Display for TrackReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "  [{}] {} {}", self.id, self.kind, self.mime_type)?;
        if let Some(codec) = &self.codec {
            write!(f, " ({})", codec)?;
        }
        writeln!(f)?;

        write!(
            f,
            "      {} frames, {} keyframes, {}",
            self.frame_count,
            self.keyframe_count,
            format_duration(self.duration_secs)
        )?;
        if let Some(fps) = self.frame_rate {
            write!(f, ", {:.3} fps", fps)?;
        }
        if let Some(bps) = self.bitrate_bps {
            write!(f, ", {:.1} kb/s", bps / 1000.0)?;
        }
        writeln!(f)?;

        for (i, frame) in self.frames.iter().flatten().enumerate() {
            write!(
                f,
                "      #{:<6} {:<7} dts {:>12} pts {:>12} size {:>8}",
                i,
                frame.frame_type.as_str(),
                frame.decode_time_us,
                frame.presentation_time_us(),
                frame.size
            )?;
            if let Some(offset) = frame.byte_offset {
                write!(f, " @{}", offset)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// `HH:MM:SS.mmm`
pub fn format_duration(secs: f64) -> String {
    let millis = (secs * 1000.0).round() as u64;
    let (secs, millis) = (millis / 1000, millis % 1000);
    format!(
        "{:02}:{:02}:{:02}.{:03}",
        secs / 3600,
        secs / 60 % 60,
        secs % 60,
        millis
    )
}

/// Read until the container is recognised, returning the bytes read.
fn sniff(reader: &mut impl Read, path: &Path) -> Result<(ContainerKind, Vec<u8>)> {
    let mut head = Vec::with_capacity(SNIFF_LIMIT);
    let mut buf = [0u8; 512];
    loop {
        let n = reader
            .read(&mut buf)
            .with_context(|| format!("Failed to read {:?}", path))?;
        head.extend_from_slice(&buf[..n]);
        // ID3 and 188-byte checks want a little more than the first bytes.
        if let Some(kind) = detect_container(&head) {
            if n == 0 || head.len() > 188 {
                return Ok((kind, head));
            }
        }
        if n == 0 || head.len() >= SNIFF_LIMIT {
            anyhow::bail!("Unrecognised container: {:?}", path);
        }
    }
}

/// Stream `head` and then the rest of `reader` into `demuxer` in
/// `chunk_size` appends. Returns the number of bytes fed.
fn feed(
    demuxer: &mut dyn Demuxer,
    mut reader: impl Read,
    head: &[u8],
    chunk_size: usize,
    path: &Path,
) -> Result<u64> {
    let chunk_size = chunk_size.max(1);
    let mut total = 0u64;
    for chunk in head.chunks(chunk_size) {
        demuxer.append(chunk)?;
        total += chunk.len() as u64;
    }

    let mut buf = vec![0u8; chunk_size];
    loop {
        let n = reader
            .read(&mut buf)
            .with_context(|| format!("Failed to read {:?}", path))?;
        if n == 0 {
            break;
        }
        demuxer.append(&buf[..n])?;
        let freed = demuxer.prune();
        tracing::trace!(bytes = n, freed, "appended");
        total += n as u64;
    }

    demuxer.end()?;
    Ok(total)
}

fn open(path: &Path) -> Result<BufReader<File>> {
    if !path.exists() {
        anyhow::bail!("File does not exist: {:?}", path);
    }
    let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    Ok(BufReader::new(file))
}

/// Demultiplex a whole file and summarise its tracks.
pub fn probe_file(path: &Path, config: &DemuxConfig, with_frames: bool) -> Result<FileReport> {
    let mut reader = open(path)?;
    let (kind, head) = sniff(&mut reader, path)?;
    tracing::info!("Probing {:?} as {}", path, kind);

    let mut demuxer = open_demuxer(kind, &config.to_options(false));
    let size = feed(demuxer.as_mut(), reader, &head, config.chunk_size, path)
        .with_context(|| format!("Failed to demux {:?}", path))?;

    Ok(FileReport::new(
        path,
        demuxer.kind(),
        size,
        demuxer.as_ref(),
        with_frames,
    ))
}

/// Parse the top-level MP4 box tree of a file.
pub fn box_tree(path: &Path, config: &DemuxConfig) -> Result<Vec<Mp4Box>> {
    let mut reader = open(path)?;
    let (kind, head) = sniff(&mut reader, path)?;
    if kind != ContainerKind::Mp4 {
        anyhow::bail!("{:?} is {}, not MP4", path, kind);
    }

    let mut demuxer = Mp4Demuxer::new(config.to_options(true));
    feed(&mut demuxer, reader, &head, config.chunk_size, path)
        .with_context(|| format!("Failed to parse {:?}", path))?;
    if let Some(truncated) = demuxer.truncated_box() {
        tracing::warn!("{:?} ends inside a {} box", path, truncated);
    }
    Ok(demuxer.boxes().to_vec())
}

/// Indented box tree, one box per line.
pub struct BoxTree<'a>(pub &'a [Mp4Box]);

impl fmt::Display for BoxTree<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn walk(f: &mut fmt::Formatter<'_>, b: &Mp4Box, depth: usize) -> fmt::Result {
            writeln!(
                f,
                "{:indent$}{} @{} size {}",
                "",
                b.box_type,
                b.offset,
                b.size,
                indent = depth * 2
            )?;
            b.children.iter().try_for_each(|child| walk(f, child, depth + 1))
        }

        self.0.iter().try_for_each(|b| walk(f, b, 0))
    }
}
