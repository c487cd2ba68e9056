use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use rust_acq::core::{SampleType, VideoFrame, VideoFrameMetadata, VideoFrameTimestamps};
use rust_acq::properties::StorageDimension;
use rust_acq::storage::blosc::{BloscCodec, BloscCompressor};
use rust_acq::storage::chunk::{ChunkLayout, FrameChunker};
use rust_acq::storage::multiscale::downsample_half;

const WIDTH: u32 = 1920;
const HEIGHT: u32 = 1080;
const FRAME_BYTES: usize = (WIDTH * HEIGHT) as usize;

fn hd_frame(id: u64) -> VideoFrame {
    // A gradient compresses like real sensor data, unlike all-zeros.
    let data: Vec<u8> = (0..FRAME_BYTES).map(|i| (i % 251) as u8).collect();
    VideoFrame {
        metadata: VideoFrameMetadata {
            frame_id: id,
            timestamps: VideoFrameTimestamps::default(),
        },
        shape: (WIDTH, HEIGHT),
        sample_type: SampleType::U8,
        data: Bytes::from(data),
    }
}

fn hd_layout(append_chunk: u32) -> ChunkLayout {
    let dims = vec![
        StorageDimension::space("x", WIDTH, WIDTH / 2),
        StorageDimension::space("y", HEIGHT, HEIGHT / 2),
        StorageDimension::time("t", 0, append_chunk),
    ];
    ChunkLayout::new(&dims, (WIDTH, HEIGHT), SampleType::U8).expect("valid layout")
}

fn benchmark_chunker_ingest(c: &mut Criterion) {
    let frame = hd_frame(0);
    let mut group = c.benchmark_group("chunker");
    group.throughput(Throughput::Bytes(FRAME_BYTES as u64));
    group.bench_function("write_frame_hd", |b| {
        let mut chunker = FrameChunker::new(hd_layout(64));
        b.iter(|| {
            let flushed = chunker.write_frame(black_box(&frame)).expect("write");
            black_box(flushed);
        });
    });
    group.finish();
}

fn benchmark_blosc_encode(c: &mut Criterion) {
    let frame = hd_frame(0);
    let mut group = c.benchmark_group("blosc");
    group.throughput(Throughput::Bytes(FRAME_BYTES as u64));
    for (name, compressor) in [("zstd", BloscCompressor::Zstd), ("lz4", BloscCompressor::Lz4)] {
        let codec = BloscCodec::byte_shuffle(compressor);
        group.bench_function(name, |b| {
            b.iter(|| {
                let encoded = codec.encode(black_box(&frame.data), 1).expect("encode");
                black_box(encoded);
            });
        });
    }
    group.finish();
}

fn benchmark_downsample(c: &mut Criterion) {
    let frame = hd_frame(0);
    let mut group = c.benchmark_group("multiscale");
    group.throughput(Throughput::Bytes(FRAME_BYTES as u64));
    group.bench_function("downsample_half_hd", |b| {
        b.iter(|| {
            let half = downsample_half(black_box(&frame));
            black_box(half);
        });
    });
    group.finish();
}

fn criterion_benchmark(c: &mut Criterion) {
    benchmark_chunker_ingest(c);
    benchmark_blosc_encode(c);
    benchmark_downsample(c);
}

criterion_group!(name = benches; config = Criterion::default().sample_size(50); targets = criterion_benchmark);
criterion_main!(benches);
