//! Benchmarks for transport stream and MP4 demultiplexing
//!
//! Measures throughput over synthetic inputs at several append sizes.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use framescope_media::{demux_all, DemuxOptions, Demuxer, Mp4Demuxer, TsDemuxer};

#[path = "../tests/common/mod.rs"]
mod common;

fn bench_ts_demux(c: &mut Criterion) {
    let stream = common::build_ts(900, 300, 4);
    let mut group = c.benchmark_group("ts_demux");
    group.throughput(Throughput::Bytes(stream.len() as u64));

    for chunk_size in [188, 4 * 1024, 64 * 1024] {
        group.bench_with_input(
            BenchmarkId::new("chunk", chunk_size),
            &chunk_size,
            |b, &chunk_size| {
                b.iter(|| {
                    let mut demuxer = TsDemuxer::new();
                    demux_all(&mut demuxer, black_box(&stream), chunk_size).unwrap();
                    black_box(demuxer.tracks().len())
                })
            },
        );
    }

    group.finish();
}

fn bench_raw_adts(c: &mut Criterion) {
    let data: Vec<u8> = (0..5_000).flat_map(|_| common::adts_frame(200)).collect();
    let mut group = c.benchmark_group("raw_adts");
    group.throughput(Throughput::Bytes(data.len() as u64));

    group.bench_function("single_append", |b| {
        b.iter(|| {
            let mut demuxer = TsDemuxer::new();
            demux_all(&mut demuxer, black_box(&data), data.len()).unwrap();
            black_box(demuxer.tracks().len())
        })
    });

    group.finish();
}

fn bench_mp4_fragments(c: &mut Criterion) {
    let file = common::fragmented_mp4(500);
    let mut group = c.benchmark_group("mp4_demux");
    group.throughput(Throughput::Bytes(file.len() as u64));

    group.bench_with_input(BenchmarkId::new("fragments", 500), &file, |b, file| {
        b.iter(|| {
            let mut demuxer = Mp4Demuxer::new(DemuxOptions {
                keep_box_tree: false,
                ..Default::default()
            });
            demux_all(&mut demuxer, black_box(file), 16 * 1024).unwrap();
            black_box(demuxer.tracks().len())
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_ts_demux,
    bench_raw_adts,
    bench_mp4_fragments
);
criterion_main!(benches);
