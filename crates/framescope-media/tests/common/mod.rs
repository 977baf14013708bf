//! Builders for small synthetic MP4 and MPEG-TS inputs.

#![allow(dead_code)]

use framescope_media::ts::{encode_timestamp, PACKET_SIZE, SYNC_BYTE};

pub const PMT_PID: u16 = 0x1000;
pub const VIDEO_PID: u16 = 0x100;
pub const AUDIO_PID: u16 = 0x101;

const TS_PAYLOAD: usize = PACKET_SIZE - 4;

/// AAC-LC, 8 kHz mono ADTS frame of `len` bytes without CRC.
pub fn adts_frame(len: usize) -> Vec<u8> {
    let sf = 11u8;
    let ch = 1u8;
    let fullness = 0x7FFu16;
    let mut v = vec![
        0xFF,
        0xF1,
        (1 << 6) | (sf << 2) | (ch >> 2),
        ((ch & 3) << 6) | ((len >> 11) as u8 & 0x03),
        ((len >> 3) & 0xFF) as u8,
        (((len & 7) as u8) << 5) | (fullness >> 6) as u8,
        ((fullness & 0x3F) as u8) << 2,
    ];
    v.resize(len, 0xAA);
    v
}

/// One Annex-B access unit: an access unit delimiter and a single slice.
pub fn h264_access_unit(idr: bool) -> Vec<u8> {
    let mut v = vec![0x00, 0x00, 0x00, 0x01, 0x09, 0xF0];
    if idr {
        v.extend_from_slice(&[0x00, 0x00, 0x00, 0x01, 0x65, 0x88, 0x80]);
    } else {
        v.extend_from_slice(&[0x00, 0x00, 0x00, 0x01, 0x41, 0x9A, 0x00]);
    }
    v
}

/// A single transport packet; short payloads are padded with adaptation
/// field stuffing.
pub fn ts_packet(pid: u16, unit_start: bool, cc: u8, payload: &[u8]) -> Vec<u8> {
    assert!(payload.len() <= TS_PAYLOAD);
    let mut packet = Vec::with_capacity(PACKET_SIZE);
    packet.push(SYNC_BYTE);
    packet.push(((unit_start as u8) << 6) | (pid >> 8) as u8 & 0x1F);
    packet.push(pid as u8);

    if payload.len() == TS_PAYLOAD {
        packet.push(0x10 | (cc & 0x0F));
    } else {
        packet.push(0x30 | (cc & 0x0F));
        let af_len = TS_PAYLOAD - 1 - payload.len();
        packet.push(af_len as u8);
        if af_len > 0 {
            packet.push(0x00);
            packet.resize(packet.len() + af_len - 1, 0xFF);
        }
    }
    packet.extend_from_slice(payload);
    assert_eq!(packet.len(), PACKET_SIZE);
    packet
}

/// Wrap a PSI section body in a pointer field, header and dummy CRC, padded
/// to a full packet payload.
fn psi_payload(table_id: u8, extension: u16, body: &[u8]) -> Vec<u8> {
    let section_length = 5 + body.len() + 4;
    let mut v = vec![
        0x00,
        table_id,
        0xB0 | (section_length >> 8) as u8,
        section_length as u8,
        (extension >> 8) as u8,
        extension as u8,
        0xC1,
        0x00,
        0x00,
    ];
    v.extend_from_slice(body);
    v.extend_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
    v.resize(TS_PAYLOAD, 0xFF);
    v
}

pub fn pat_packet(pmt_pid: u16) -> Vec<u8> {
    let body = [0x00, 0x01, 0xE0 | (pmt_pid >> 8) as u8, pmt_pid as u8];
    ts_packet(0, true, 0, &psi_payload(0x00, 1, &body))
}

/// PMT for program 1 listing `(stream_type, pid)` pairs.
pub fn pmt_packet(pmt_pid: u16, streams: &[(u8, u16)]) -> Vec<u8> {
    let pcr_pid = streams.first().map_or(0x1FFF, |s| s.1);
    let mut body = vec![0xE0 | (pcr_pid >> 8) as u8, pcr_pid as u8, 0xF0, 0x00];
    for &(stream_type, pid) in streams {
        body.extend_from_slice(&[stream_type, 0xE0 | (pid >> 8) as u8, pid as u8, 0xF0, 0x00]);
    }
    ts_packet(pmt_pid, true, 0, &psi_payload(0x02, 1, &body))
}

/// A PES packet carrying `data` with a PTS and optional DTS in 90 kHz ticks.
pub fn pes_packet(stream_id: u8, pts: u64, dts: Option<u64>, data: &[u8]) -> Vec<u8> {
    let mut fields = Vec::new();
    let flags = match dts {
        Some(dts) => {
            fields.extend_from_slice(&encode_timestamp(0b0011, pts));
            fields.extend_from_slice(&encode_timestamp(0b0001, dts));
            0xC0
        }
        None => {
            fields.extend_from_slice(&encode_timestamp(0b0010, pts));
            0x80
        }
    };
    let packet_length = if stream_id >= 0xE0 {
        0
    } else {
        3 + fields.len() + data.len()
    };
    let mut v = vec![
        0x00,
        0x00,
        0x01,
        stream_id,
        (packet_length >> 8) as u8,
        packet_length as u8,
        0x80,
        flags,
        fields.len() as u8,
    ];
    v.extend_from_slice(&fields);
    v.extend_from_slice(data);
    v
}

/// Split a PES packet over as many transport packets as it needs.
pub fn packetize(pid: u16, pes: &[u8], cc: &mut u8) -> Vec<u8> {
    let mut out = Vec::new();
    for (i, chunk) in pes.chunks(TS_PAYLOAD).enumerate() {
        out.extend(ts_packet(pid, i == 0, *cc, chunk));
        *cc = cc.wrapping_add(1) & 0x0F;
    }
    out
}

/// A program with one H.264 and one AAC stream.
///
/// Video: `video_units` access units, 30 fps starting at DTS 90000 with
/// PTS 9000 ticks later. Audio: one PES per `audio_per_pes` ADTS frames of
/// 100 bytes, starting at PTS 90000.
pub fn build_ts(video_units: usize, audio_pes: usize, audio_per_pes: usize) -> Vec<u8> {
    let mut out = pat_packet(PMT_PID);
    out.extend(pmt_packet(PMT_PID, &[(0x1B, VIDEO_PID), (0x0F, AUDIO_PID)]));

    let (mut video_cc, mut audio_cc) = (0u8, 0u8);
    let mut audio_left = audio_pes;
    for i in 0..video_units.max(audio_pes) {
        if i < video_units {
            let dts = 90_000 + 3_000 * i as u64;
            let pes = pes_packet(0xE0, dts + 9_000, Some(dts), &h264_access_unit(i == 0));
            out.extend(packetize(VIDEO_PID, &pes, &mut video_cc));
        }
        if audio_left > 0 {
            // 1024 samples per frame at 8 kHz is 11520 ticks.
            let pts = 90_000 + (audio_pes - audio_left) as u64 * audio_per_pes as u64 * 11_520;
            let frames: Vec<u8> = (0..audio_per_pes).flat_map(|_| adts_frame(100)).collect();
            let pes = pes_packet(0xC0, pts, None, &frames);
            out.extend(packetize(AUDIO_PID, &pes, &mut audio_cc));
            audio_left -= 1;
        }
    }
    out
}

pub fn mp4_box(box_type: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut v = ((payload.len() + 8) as u32).to_be_bytes().to_vec();
    v.extend_from_slice(box_type);
    v.extend_from_slice(payload);
    v
}

pub fn full_box(box_type: &[u8; 4], version: u8, flags: u32, payload: &[u8]) -> Vec<u8> {
    let mut body = vec![version, (flags >> 16) as u8, (flags >> 8) as u8, flags as u8];
    body.extend_from_slice(payload);
    mp4_box(box_type, &body)
}

fn u32s(values: &[u32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_be_bytes()).collect()
}

pub fn ftyp() -> Vec<u8> {
    let mut body = b"isom".to_vec();
    body.extend_from_slice(&[0, 0, 2, 0]);
    body.extend_from_slice(b"isomiso2avc1mp41");
    mp4_box(b"ftyp", &body)
}

pub fn tkhd(track_id: u32) -> Vec<u8> {
    let mut body = u32s(&[0, 0, track_id, 0, 0]);
    body.resize(body.len() + 8 + 2 + 2 + 2 + 2 + 36, 0);
    body.extend(u32s(&[320 << 16, 240 << 16]));
    full_box(b"tkhd", 0, 3, &body)
}

pub fn mdhd(timescale: u32) -> Vec<u8> {
    let mut body = u32s(&[0, 0, timescale, 0]);
    // "und"
    body.extend_from_slice(&[0x55, 0xC4, 0, 0]);
    full_box(b"mdhd", 0, 0, &body)
}

pub fn hdlr(handler: &[u8; 4]) -> Vec<u8> {
    let mut body = vec![0; 4];
    body.extend_from_slice(handler);
    body.resize(body.len() + 12, 0);
    body.extend_from_slice(b"handler\0");
    full_box(b"hdlr", 0, 0, &body)
}

/// Minimal sample tables for a video track.
pub struct SampleTable {
    pub stts: Vec<(u32, u32)>,
    pub stss: Option<Vec<u32>>,
    pub stsc: Vec<(u32, u32)>,
    pub sizes: Vec<u32>,
    pub chunk_offsets: Vec<u32>,
    pub ctts: Option<Vec<(u32, i32)>>,
}

impl SampleTable {
    pub fn to_box(&self) -> Vec<u8> {
        self.to_box_with_entry(None)
    }

    /// `stbl` whose `stsd` holds `entry`, if any.
    pub fn to_box_with_entry(&self, entry: Option<&[u8]>) -> Vec<u8> {
        let mut stsd = u32s(&[entry.is_some() as u32]);
        stsd.extend_from_slice(entry.unwrap_or_default());
        let mut stbl = full_box(b"stsd", 0, 0, &stsd);

        let mut stts = u32s(&[self.stts.len() as u32]);
        for &(count, delta) in &self.stts {
            stts.extend(u32s(&[count, delta]));
        }
        stbl.extend(full_box(b"stts", 0, 0, &stts));

        if let Some(ctts) = &self.ctts {
            let mut body = u32s(&[ctts.len() as u32]);
            for &(count, offset) in ctts {
                body.extend(u32s(&[count, offset as u32]));
            }
            stbl.extend(full_box(b"ctts", 0, 0, &body));
        }

        if let Some(stss) = &self.stss {
            let mut body = u32s(&[stss.len() as u32]);
            body.extend(u32s(stss));
            stbl.extend(full_box(b"stss", 0, 0, &body));
        }

        let mut stsc = u32s(&[self.stsc.len() as u32]);
        for &(first_chunk, per_chunk) in &self.stsc {
            stsc.extend(u32s(&[first_chunk, per_chunk, 1]));
        }
        stbl.extend(full_box(b"stsc", 0, 0, &stsc));

        let mut stsz = u32s(&[0, self.sizes.len() as u32]);
        stsz.extend(u32s(&self.sizes));
        stbl.extend(full_box(b"stsz", 0, 0, &stsz));

        let mut stco = u32s(&[self.chunk_offsets.len() as u32]);
        stco.extend(u32s(&self.chunk_offsets));
        stbl.extend(full_box(b"stco", 0, 0, &stco));

        mp4_box(b"stbl", &stbl)
    }
}

/// 48 kHz stereo `mp4a` sample entry wrapping `esds`.
pub fn mp4a(esds: &[u8]) -> Vec<u8> {
    let mut body = vec![0u8; 6];
    body.extend_from_slice(&1u16.to_be_bytes());
    body.extend_from_slice(&[0; 8]);
    body.extend_from_slice(&2u16.to_be_bytes());
    body.extend_from_slice(&16u16.to_be_bytes());
    body.extend_from_slice(&[0; 4]);
    body.extend(u32s(&[48_000 << 16]));
    body.extend_from_slice(esds);
    mp4_box(b"mp4a", &body)
}

pub fn trak(track_id: u32, timescale: u32, handler: &[u8; 4], table: &SampleTable) -> Vec<u8> {
    let minf = mp4_box(b"minf", &table.to_box());
    let mut mdia = mdhd(timescale);
    mdia.extend(hdlr(handler));
    mdia.extend(minf);

    let mut body = tkhd(track_id);
    body.extend(mp4_box(b"mdia", &mdia));
    mp4_box(b"trak", &body)
}

pub fn moov(traks: &[Vec<u8>]) -> Vec<u8> {
    let mut mvhd = u32s(&[0, 0, 1000, 0]);
    mvhd.resize(mvhd.len() + 80, 0);
    let mut body = full_box(b"mvhd", 0, 0, &mvhd);
    for trak in traks {
        body.extend_from_slice(trak);
    }
    mp4_box(b"moov", &body)
}

/// `ftyp`, `moov` with one 30 fps video track (timescale 90000) and an
/// `mdat` whose samples sit where the chunk offsets say.
pub fn progressive_mp4() -> Vec<u8> {
    // Placeholder offsets are patched once the moov size is known.
    let build = |mdat_start: u32| {
        let table = SampleTable {
            stts: vec![(6, 3_000)],
            stss: Some(vec![1, 4]),
            stsc: vec![(1, 2), (3, 1)],
            sizes: vec![100, 50, 60, 120, 40, 30],
            chunk_offsets: vec![mdat_start, mdat_start + 150, mdat_start + 330, mdat_start + 370],
            ctts: Some(vec![(1, 6_000), (5, 3_000)]),
        };
        let mut file = ftyp();
        file.extend(moov(&[trak(1, 90_000, b"vide", &table)]));
        file
    };

    let head_len = build(0).len() as u32;
    let mut file = build(head_len + 8);
    file.extend(mp4_box(b"mdat", &[0u8; 400]));
    file
}

/// Fragmented file: `ftyp`, `moov` with `mvex/trex` and no samples, then
/// `fragments` movie fragments of three samples each.
pub fn fragmented_mp4(fragments: u32) -> Vec<u8> {
    let empty = SampleTable {
        stts: vec![],
        stss: None,
        stsc: vec![],
        sizes: vec![],
        chunk_offsets: vec![],
        ctts: None,
    };
    let trex = full_box(b"trex", 0, 0, &u32s(&[1, 1, 1_000, 0, 0x0001_0000]));
    let mut moov_box = moov(&[trak(1, 1_000, b"vide", &empty)]);
    let mvex = mp4_box(b"mvex", &trex);
    // Append mvex inside moov and fix up its size.
    moov_box.extend_from_slice(&mvex);
    let len = moov_box.len() as u32;
    moov_box[..4].copy_from_slice(&len.to_be_bytes());

    let mut file = ftyp();
    file.extend(moov_box);
    for n in 0..fragments {
        file.extend(fragment(n + 1, n as u64 * 3_000));
    }
    file
}

/// One `moof` + `mdat` pair with three samples of 10, 20 and 30 bytes.
pub fn fragment(sequence: u32, decode_time: u64) -> Vec<u8> {
    let build = |data_offset: i32| {
        let mfhd = full_box(b"mfhd", 0, 0, &u32s(&[sequence]));
        // default-base-is-moof
        let tfhd = full_box(b"tfhd", 0, 0x02_0000, &u32s(&[1]));
        let tfdt = full_box(b"tfdt", 1, 0, &decode_time.to_be_bytes());
        // data offset, first sample flags, per-sample size
        let mut trun = u32s(&[3, data_offset as u32, 0]);
        trun.extend(u32s(&[10, 20, 30]));
        let trun = full_box(b"trun", 0, 0x000205, &trun);

        let mut traf = tfhd;
        traf.extend(tfdt);
        traf.extend(trun);
        let mut moof = mfhd;
        moof.extend(mp4_box(b"traf", &traf));
        mp4_box(b"moof", &moof)
    };

    let moof_len = build(0).len() as i32;
    let mut out = build(moof_len + 8);
    out.extend(mp4_box(b"mdat", &[0u8; 60]));
    out
}
