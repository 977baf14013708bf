//! Incremental MP4 demultiplexing.
//!
//! [`Mp4Demuxer`] accepts the file in arbitrary chunks. Every top-level box
//! is parsed once its full extent is buffered; the payloads of `mdat`,
//! `free`, `skip` and `wide` are discarded as they stream past instead of
//! being buffered.

mod boxes;
mod fields;
mod fragment;
mod parser;
mod sample_table;

pub use boxes::{BoxType, Mp4Box};
pub use fields::{
    decode_fields, AvcConfig, BoxFields, CompositionOffsetEntry, EsDescriptor, EventMessage,
    HevcConfig, ProtectionSystem, SampleToChunkEntry, SegmentIndex, SegmentReference,
    TimeToSampleEntry, TrackExtends, TrackFragmentHeader, TrackRun, TrackRunSample,
    AAC_SAMPLE_RATES, SAMPLE_IS_NON_SYNC,
};
pub use fragment::{reconstruct_run, RunContext, RunOutput};
pub use parser::{handler_kind, BoxHeader, BoxParser, TrackMedia, FALLBACK_TIMESCALE};
pub use sample_table::SampleTables;

use std::collections::BTreeMap;

use bytes::{Buf, BytesMut};
use tracing::{debug, warn};

use crate::demux::{ContainerKind, DemuxOptions, Demuxer};
use crate::track::Track;
use crate::{Error, Result};

/// Pending skip that lasts until the end of the stream.
const SKIP_TO_END: u64 = u64::MAX;

/// Top-level boxes whose payload is never buffered.
fn is_skippable(box_type: BoxType) -> bool {
    matches!(
        box_type,
        BoxType::MDAT | BoxType::FREE | BoxType::SKIP | BoxType::WIDE
    )
}

/// Push-driven MP4 demultiplexer.
#[derive(Debug)]
pub struct Mp4Demuxer {
    options: DemuxOptions,
    parser: BoxParser,
    buffer: BytesMut,
    /// Absolute source offset of `buffer[0]`.
    offset: u64,
    /// Payload bytes of a skipped box still to discard.
    skip: u64,
    skipping: Option<BoxType>,
    boxes: Vec<Mp4Box>,
    /// Index in `boxes` of a skipped box that runs to the end of the stream.
    open_box: Option<usize>,
    truncated: Option<BoxType>,
    failed: bool,
}

impl Default for Mp4Demuxer {
    fn default() -> Self {
        Self::new(DemuxOptions::default())
    }
}

impl Mp4Demuxer {
    pub fn new(options: DemuxOptions) -> Self {
        Self {
            options,
            parser: BoxParser::new(),
            buffer: BytesMut::new(),
            offset: 0,
            skip: 0,
            skipping: None,
            boxes: Vec::new(),
            open_box: None,
            truncated: None,
            failed: false,
        }
    }

    /// Top-level boxes parsed so far (empty unless `keep_box_tree`).
    pub fn boxes(&self) -> &[Mp4Box] {
        &self.boxes
    }

    /// Type of a top-level box cut short by the end of the stream.
    pub fn truncated_box(&self) -> Option<BoxType> {
        self.truncated
    }

    /// Container-level metadata for a track.
    pub fn media(&self, track_id: u32) -> Option<&TrackMedia> {
        self.parser.media(track_id)
    }

    /// Bytes currently held for an incomplete top-level box.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn check_usable(&self) -> Result<()> {
        if self.failed {
            return Err(Error::invalid_mp4(
                "demuxer stopped by an earlier structural error",
            ));
        }
        Ok(())
    }

    /// Discard up to `available` bytes of a pending skip, returning how many.
    fn take_skip(&mut self, available: usize) -> usize {
        let n = self.skip.min(available as u64) as usize;
        if self.skip != SKIP_TO_END {
            self.skip -= n as u64;
        }
        self.offset += n as u64;
        n
    }

    fn push_box(&mut self, mp4_box: Mp4Box) {
        if self.options.keep_box_tree {
            self.boxes.push(mp4_box);
        }
    }

    fn drain(&mut self) -> Result<()> {
        loop {
            if self.skip > 0 {
                let n = self.take_skip(self.buffer.len());
                self.buffer.advance(n);
                if self.skip > 0 {
                    return Ok(());
                }
            }

            let Some(header) = BoxHeader::read(&self.buffer) else {
                return Ok(());
            };
            let header_len = header.header_size as u64;

            if is_skippable(header.box_type) {
                if header.extends_to_end() {
                    self.skip = SKIP_TO_END;
                    self.open_box = self.options.keep_box_tree.then_some(self.boxes.len());
                } else if header.size < header_len {
                    return Err(Error::invalid_mp4(format!(
                        "{} box size {} smaller than its header",
                        header.box_type, header.size
                    )));
                } else {
                    self.skip = header.size - header_len;
                }
                self.skipping = Some(header.box_type);
                debug!(box_type = %header.box_type, offset = self.offset, size = header.size, "skipping box payload");
                self.push_box(Mp4Box {
                    box_type: header.box_type,
                    size: header.size,
                    offset: self.offset,
                    header_size: header.header_size,
                    is_container: false,
                    fields: BoxFields::Opaque,
                    children: Vec::new(),
                });
                self.buffer.advance(header_len as usize);
                self.offset += header_len;
                continue;
            }

            if header.extends_to_end() {
                // Only resolvable once the stream ends.
                if self.buffer.len() as u64 > self.options.max_box_size {
                    return Err(self.too_large(header.box_type, self.buffer.len() as u64));
                }
                return Ok(());
            }
            if header.size > self.options.max_box_size {
                return Err(self.too_large(header.box_type, header.size));
            }
            if (self.buffer.len() as u64) < header.size {
                return Ok(());
            }

            let size = header.resolve_size(header.size)? as usize;
            let data = self.buffer.split_to(size);
            let parsed = self.parser.parse_box(header, &data, self.offset)?;
            self.offset += size as u64;
            self.push_box(parsed);
        }
    }

    fn too_large(&self, box_type: BoxType, size: u64) -> Error {
        Error::BoxTooLarge {
            box_type: box_type.to_string(),
            size,
            max: self.options.max_box_size,
        }
    }

    fn finish(&mut self) -> Result<()> {
        if self.skip > 0 && self.skip != SKIP_TO_END {
            warn!(
                box_type = ?self.skipping,
                missing = self.skip,
                "stream ended inside a skipped box"
            );
            self.truncated = self.skipping;
        }

        if !self.buffer.is_empty() {
            match BoxHeader::read(&self.buffer) {
                Some(header) if header.extends_to_end() => {
                    let data = self.buffer.split();
                    let size = header.resolve_size(data.len() as u64)?;
                    let parsed = self.parser.parse_box(header, &data, self.offset)?;
                    self.offset += size;
                    self.push_box(parsed);
                }
                Some(header) => {
                    warn!(
                        box_type = %header.box_type,
                        have = self.buffer.len(),
                        need = header.size,
                        "stream ended inside a box"
                    );
                    self.truncated = Some(header.box_type);
                }
                None => warn!(len = self.buffer.len(), "trailing bytes after last box"),
            }
            self.offset += self.buffer.len() as u64;
            self.buffer.clear();
        }

        if let Some(index) = self.open_box.take() {
            if let Some(open) = self.boxes.get_mut(index) {
                open.size = self.offset - open.offset;
            }
        }

        for track in self.parser.tracks_mut().values_mut() {
            track.update();
        }
        Ok(())
    }
}

impl Demuxer for Mp4Demuxer {
    fn kind(&self) -> ContainerKind {
        ContainerKind::Mp4
    }

    fn append(&mut self, mut data: &[u8]) -> Result<()> {
        self.check_usable()?;

        if self.skip > 0 && self.buffer.is_empty() {
            let n = self.take_skip(data.len());
            data = &data[n..];
        }
        self.buffer.extend_from_slice(data);

        let result = self.drain();
        self.failed = result.is_err();
        result
    }

    fn end(&mut self) -> Result<()> {
        self.check_usable()?;
        let result = self.finish();
        self.failed = result.is_err();
        result
    }

    fn tracks(&self) -> &BTreeMap<u32, Track> {
        self.parser.tracks()
    }
}
