//! Incremental MPEG transport stream demultiplexing.
//!
//! [`TsDemuxer`] slices 188-byte packets out of the appended bytes,
//! resynchronising on the sync byte when it is lost, learns the program
//! layout from the PAT and PMT, and routes every elementary stream PID
//! through a [`PesStream`] into its payload reader. Each PID becomes one
//! [`Track`] whose id is the PID.
//!
//! Data that opens with an ADTS or MPEG audio frame header (optionally
//! behind an ID3v2 tag) is treated as a raw elementary stream instead and
//! lands on track 1.

mod packet;
mod pes;
mod psi;

pub use packet::{
    AdaptationField, Packet, PacketHeader, NULL_PID, PACKET_SIZE, PAT_PID, SYNC_BYTE,
};
pub use pes::{
    decode_timestamp, encode_timestamp, unwrap_timestamp, PesHeader, PesStream, PES_TIMESCALE,
    TIMESTAMP_WRAP,
};
pub use psi::{parse_pat, parse_pmt, PatEntry, Pmt, PmtStream};

use std::collections::BTreeMap;

use tracing::{debug, trace, warn};

use crate::demux::{ContainerKind, Demuxer};
use crate::es::{
    stream_type_info, AdtsHeader, EsEvent, EsReader, MpegAudioHeader, PayloadReader,
    StreamTypeInfo,
};
use crate::track::Track;
use crate::{Error, Result};

/// Bytes scanned for a sync byte before giving up on the input.
pub const SYNC_SEARCH_LIMIT: usize = 16 * PACKET_SIZE;

/// Track id of a raw elementary stream.
pub const RAW_TRACK_ID: u32 = 1;

const ID3_HEADER: usize = 10;

/// What the start of the input looks like.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sniff {
    NeedMore,
    /// Transport stream from this offset.
    Transport(usize),
    /// ID3v2 tag of this many bytes.
    Id3(usize),
    Raw(StreamTypeInfo),
    NoSync,
}

/// Total length of an ID3v2 tag, header and footer included.
pub fn id3_tag_len(data: &[u8]) -> Option<usize> {
    let header = data.get(..ID3_HEADER)?;
    if &header[..3] != b"ID3" {
        return None;
    }
    let size = header[6..10]
        .iter()
        .fold(0usize, |acc, &b| acc << 7 | (b & 0x7F) as usize);
    let footer = if header[5] & 0x10 != 0 { ID3_HEADER } else { 0 };
    Some(ID3_HEADER + size + footer)
}

fn sniff(data: &[u8]) -> Sniff {
    match data {
        [] | [0xFF] | [b'I'] | [b'I', b'D'] => Sniff::NeedMore,
        [SYNC_BYTE, ..] => Sniff::Transport(0),
        [b'I', b'D', b'3', ..] => id3_tag_len(data).map_or(Sniff::NeedMore, Sniff::Id3),
        [b0, b1, ..] if AdtsHeader::is_sync(*b0, *b1) => Sniff::Raw(stream_type_info(0x0F)),
        [b0, b1, ..] if MpegAudioHeader::is_sync(*b0, *b1) => {
            Sniff::Raw(stream_type_info(0x03))
        }
        _ => match data.iter().position(|&b| b == SYNC_BYTE) {
            Some(at) => Sniff::Transport(at),
            None if data.len() >= SYNC_SEARCH_LIMIT => Sniff::NoSync,
            None => Sniff::NeedMore,
        },
    }
}

#[derive(Debug)]
enum Mode {
    Undetermined,
    Transport,
    Raw(EsReader),
}

/// Program layout, per-PID reassembly and the resulting tracks.
#[derive(Debug, Default)]
struct Programs {
    pmt_pid: Option<u16>,
    streams: BTreeMap<u16, PesStream>,
    tracks: BTreeMap<u32, Track>,
    packet_count: u64,
    resyncs: u64,
}

impl Programs {
    fn handle_packet(&mut self, data: &[u8]) {
        self.packet_count += 1;
        let packet = match Packet::parse(data) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(packet = self.packet_count, "dropping packet: {}", e);
                return;
            }
        };
        let header = packet.header;
        trace!(
            pid = header.pid,
            unit_start = header.payload_unit_start,
            len = packet.payload.len(),
            "packet"
        );

        if header.transport_error {
            debug!(pid = header.pid, "transport error indicator set, dropping packet");
            return;
        }
        if !header.has_payload {
            return;
        }

        match header.pid {
            PAT_PID => self.handle_pat(&packet),
            NULL_PID => {}
            pid if Some(pid) == self.pmt_pid => self.handle_pmt(&packet),
            pid => self.handle_pes(pid, &packet),
        }
    }

    fn handle_pat(&mut self, packet: &Packet<'_>) {
        if !packet.header.payload_unit_start {
            return;
        }
        match parse_pat(packet.payload) {
            Ok(entries) => {
                let Some(program) = entries.first() else {
                    return;
                };
                if self.pmt_pid != Some(program.pmt_pid) {
                    debug!(
                        program = program.program_number,
                        pmt_pid = program.pmt_pid,
                        "program map PID"
                    );
                    self.pmt_pid = Some(program.pmt_pid);
                }
            }
            Err(e) => warn!("ignoring PAT: {}", e),
        }
    }

    fn handle_pmt(&mut self, packet: &Packet<'_>) {
        if !packet.header.payload_unit_start {
            return;
        }
        let pmt = match parse_pmt(packet.payload) {
            Ok(pmt) => pmt,
            Err(e) => {
                warn!("ignoring PMT: {}", e);
                return;
            }
        };

        for stream in pmt.streams {
            if self.streams.contains_key(&stream.pid) {
                continue;
            }
            let info = stream_type_info(stream.stream_type);
            debug!(
                pid = stream.pid,
                stream_type = stream.stream_type,
                kind = %info.kind,
                mime = info.mime_type,
                "elementary stream"
            );
            let mut track = Track::new(stream.pid as u32, info.kind, info.mime_type);
            track.timescale = Some(PES_TIMESCALE);
            self.tracks.insert(stream.pid as u32, track);
            self.streams
                .insert(stream.pid, PesStream::new(info.codec.reader(false)));
        }
    }

    fn handle_pes(&mut self, pid: u16, packet: &Packet<'_>) {
        let Some(stream) = self.streams.get_mut(&pid) else {
            trace!(pid, "packet for unmapped PID");
            return;
        };
        let mut events = Vec::new();
        stream.push_packet(packet.header.payload_unit_start, packet.payload, &mut events);
        if let Some(track) = self.tracks.get_mut(&(pid as u32)) {
            apply_events(track, events);
        }
    }

    fn flush(&mut self) {
        for (pid, stream) in self.streams.iter_mut() {
            let mut events = Vec::new();
            stream.flush(&mut events);
            if let Some(track) = self.tracks.get_mut(&(*pid as u32)) {
                apply_events(track, events);
            }
        }
    }
}

/// Record reader output on its track.
fn apply_events(track: &mut Track, events: Vec<EsEvent>) {
    for event in events {
        match event {
            EsEvent::Frame(frame) => track.push_frame(frame),
            EsEvent::Config(config) => {
                if track.config != config {
                    debug!(track_id = track.id, ?config, "codec configuration");
                    track.config = config;
                }
            }
        }
    }
}

/// Push-driven MPEG-TS (or raw audio elementary stream) demultiplexer.
#[derive(Debug)]
pub struct TsDemuxer {
    buffer: Vec<u8>,
    /// Bytes at the front of `buffer` already demultiplexed.
    consumed: usize,
    /// Absolute source offset of `buffer[0]`.
    offset: u64,
    mode: Mode,
    programs: Programs,
    failed: bool,
}

impl Default for TsDemuxer {
    fn default() -> Self {
        Self::new()
    }
}

impl TsDemuxer {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            consumed: 0,
            offset: 0,
            mode: Mode::Undetermined,
            programs: Programs::default(),
            failed: false,
        }
    }

    /// Transport packets processed so far.
    pub fn packet_count(&self) -> u64 {
        self.programs.packet_count
    }

    /// Times packet sync was lost and searched for again.
    pub fn resync_count(&self) -> u64 {
        self.programs.resyncs
    }

    /// PID of the program map table, once the PAT has been seen.
    pub fn pmt_pid(&self) -> Option<u16> {
        self.programs.pmt_pid
    }

    /// Whether the input turned out to be a raw elementary stream.
    pub fn is_raw(&self) -> bool {
        matches!(self.mode, Mode::Raw(_))
    }

    /// Bytes held but not demultiplexed yet.
    pub fn buffered(&self) -> usize {
        self.buffer.len() - self.consumed
    }

    /// Drop the fully consumed front of the buffer, returning its length.
    pub fn prune(&mut self) -> usize {
        let n = self.consumed;
        if n > 0 {
            self.buffer.drain(..n);
            self.offset += n as u64;
            self.consumed = 0;
        }
        n
    }

    fn check_usable(&self) -> Result<()> {
        if self.failed {
            return Err(Error::NoSyncByte {
                scanned: self.buffer.len(),
            });
        }
        Ok(())
    }

    /// Settle the container type from the buffered bytes.
    fn detect(&mut self) -> Result<()> {
        while let Mode::Undetermined = self.mode {
            let data = &self.buffer[self.consumed..];
            match sniff(data) {
                Sniff::NeedMore => return Ok(()),
                Sniff::NoSync => {
                    return Err(Error::NoSyncByte {
                        scanned: data.len(),
                    })
                }
                Sniff::Id3(len) => {
                    if data.len() < len {
                        return Ok(());
                    }
                    debug!(len, "skipping ID3v2 tag");
                    self.consumed += len;
                }
                Sniff::Transport(at) => {
                    debug!(offset = self.offset + (self.consumed + at) as u64, "MPEG-TS detected");
                    self.consumed += at;
                    self.mode = Mode::Transport;
                }
                Sniff::Raw(info) => {
                    let start = self.offset + self.consumed as u64;
                    debug!(offset = start, mime = info.mime_type, "raw elementary stream detected");
                    let mut reader = info.codec.reader(true);
                    reader.skip_input(start);
                    reader.push(data);
                    self.consumed = self.buffer.len();

                    let track = Track::new(RAW_TRACK_ID, info.kind, info.mime_type);
                    self.programs.tracks.insert(RAW_TRACK_ID, track);
                    self.mode = Mode::Raw(reader);
                }
            }
        }
        Ok(())
    }

    fn demux_packets(&mut self) {
        while let Some(data) = self.buffer.get(self.consumed..) {
            if data.len() < PACKET_SIZE {
                break;
            }
            if data[0] != SYNC_BYTE {
                let skip = data
                    .iter()
                    .position(|&b| b == SYNC_BYTE)
                    .unwrap_or(data.len());
                warn!(
                    offset = self.offset + self.consumed as u64,
                    skip, "lost packet sync"
                );
                self.programs.resyncs += 1;
                self.consumed += skip;
                continue;
            }
            self.programs.handle_packet(&data[..PACKET_SIZE]);
            self.consumed += PACKET_SIZE;
        }
    }

    fn drive_raw(&mut self, flush: bool) {
        let Mode::Raw(reader) = &mut self.mode else {
            return;
        };
        let mut events = Vec::new();
        if flush {
            reader.flush(0, &mut events);
        } else {
            reader.consume(0, &mut events);
        }
        if let Some(track) = self.programs.tracks.get_mut(&RAW_TRACK_ID) {
            apply_events(track, events);
        }
    }

    fn run(&mut self, data: &[u8]) -> Result<()> {
        if let Mode::Raw(reader) = &mut self.mode {
            reader.push(data);
        } else {
            self.buffer.extend_from_slice(data);
            self.detect()?;
        }

        match self.mode {
            Mode::Undetermined => {}
            Mode::Transport => self.demux_packets(),
            Mode::Raw(_) => self.drive_raw(false),
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        match self.mode {
            Mode::Undetermined => {
                if self.buffered() > 0 {
                    return Err(Error::NoSyncByte {
                        scanned: self.buffered(),
                    });
                }
            }
            Mode::Transport => {
                if self.buffered() > 0 {
                    warn!(len = self.buffered(), "partial packet at end of stream");
                }
                self.programs.flush();
            }
            Mode::Raw(_) => self.drive_raw(true),
        }

        for track in self.programs.tracks.values_mut() {
            track.update();
        }
        Ok(())
    }
}

impl Demuxer for TsDemuxer {
    fn kind(&self) -> ContainerKind {
        match self.mode {
            Mode::Raw(_) => ContainerKind::RawAudio,
            _ => ContainerKind::MpegTs,
        }
    }

    fn append(&mut self, data: &[u8]) -> Result<()> {
        self.check_usable()?;
        let result = self.run(data);
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
        &self.programs.tracks
    }

    fn prune(&mut self) -> usize {
        TsDemuxer::prune(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sniff() {
        assert_eq!(sniff(&[]), Sniff::NeedMore);
        assert_eq!(sniff(&[SYNC_BYTE]), Sniff::Transport(0));
        assert_eq!(sniff(&[0x00, 0x12, SYNC_BYTE]), Sniff::Transport(2));
        assert_eq!(sniff(&[0xFF]), Sniff::NeedMore);
        assert!(matches!(sniff(&[0xFF, 0xF1, 0x00]), Sniff::Raw(i) if i.stream_type == 0x0F));
        assert!(matches!(sniff(&[0xFF, 0xFB, 0x90]), Sniff::Raw(i) if i.stream_type == 0x03));
        assert_eq!(sniff(&[0u8; SYNC_SEARCH_LIMIT]), Sniff::NoSync);
        assert_eq!(sniff(b"ID3"), Sniff::NeedMore);
    }

    #[test]
    fn test_id3_tag_len() {
        let tag = [b'I', b'D', b'3', 4, 0, 0x00, 0x00, 0x00, 0x02, 0x01];
        assert_eq!(id3_tag_len(&tag), Some(10 + 257));
        let mut with_footer = tag;
        with_footer[5] = 0x10;
        assert_eq!(id3_tag_len(&with_footer), Some(20 + 257));
        assert_eq!(id3_tag_len(b"ID3"), None);
    }

    #[test]
    fn test_no_sync_is_an_error() {
        let mut demuxer = TsDemuxer::new();
        let result = demuxer.append(&[0u8; SYNC_SEARCH_LIMIT]);
        assert!(matches!(result, Err(Error::NoSyncByte { .. })));
        assert!(demuxer.append(&[SYNC_BYTE]).is_err());
    }

    #[test]
    fn test_short_garbage_fails_at_end() {
        let mut demuxer = TsDemuxer::new();
        demuxer.append(&[0x00, 0x01, 0x02]).unwrap();
        assert!(matches!(demuxer.end(), Err(Error::NoSyncByte { scanned: 3 })));
    }

    #[test]
    fn test_empty_input_has_no_tracks() {
        let mut demuxer = TsDemuxer::new();
        demuxer.end().unwrap();
        assert!(demuxer.tracks().is_empty());
    }

    #[test]
    fn test_prune_reclaims_consumed_packets() {
        let mut demuxer = TsDemuxer::new();
        let mut packet = vec![SYNC_BYTE, 0x1F, 0xFF, 0x10];
        packet.resize(PACKET_SIZE, 0xFF);
        let mut data = packet.clone();
        data.extend_from_slice(&packet[..100]);

        demuxer.append(&data).unwrap();
        assert_eq!(demuxer.packet_count(), 1);
        assert_eq!(demuxer.prune(), PACKET_SIZE);
        assert_eq!(demuxer.buffered(), 100);
        assert_eq!(demuxer.prune(), 0);
    }
}
