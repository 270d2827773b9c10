//! 프레임 인코더/조립기 벤치마크
//!
//! 사용법:
//!   cargo bench --bench frame_encoder

use std::hint::black_box;

use bytes::{Bytes, BytesMut};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use notiflow::frame::encode_end_into;
use notiflow::{AckMode, FrameEncoder, Reassembler, DEFAULT_CHUNK_SIZE};

fn payload(len: usize) -> Bytes {
    Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>())
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_encode");

    for len in [4 * 1024, 64 * 1024] {
        let data = payload(len);
        group.throughput(Throughput::Bytes(len as u64));
        group.bench_with_input(BenchmarkId::from_parameter(len), &data, |b, data| {
            let mut scratch = BytesMut::with_capacity(DEFAULT_CHUNK_SIZE + 2);
            b.iter(|| {
                let encoder = FrameEncoder::new(data.clone(), DEFAULT_CHUNK_SIZE).unwrap();
                encoder.header().encode_into(&mut scratch).unwrap();
                for frame in encoder.frames() {
                    frame.encode_into(&mut scratch);
                    black_box(&scratch);
                }
            });
        });
    }

    group.finish();
}

fn bench_reassemble(c: &mut Criterion) {
    let len = 64 * 1024;
    let encoder = FrameEncoder::new(payload(len), DEFAULT_CHUNK_SIZE).unwrap();

    let mut wire = Vec::new();
    let mut buf = BytesMut::new();
    encoder.header().encode_into(&mut buf).unwrap();
    wire.push(buf.split().freeze());
    for frame in encoder.frames() {
        frame.encode_into(&mut buf);
        wire.push(buf.split().freeze());
    }
    encode_end_into(&mut buf);
    wire.push(buf.split().freeze());

    let mut group = c.benchmark_group("reassemble");
    group.throughput(Throughput::Bytes(len as u64));
    group.bench_function("64KiB", |b| {
        b.iter(|| {
            let mut reassembler = Reassembler::new(AckMode::PerFrame);
            for frame in &wire {
                black_box(reassembler.push(frame.clone()).unwrap());
            }
        });
    });
    group.finish();
}

criterion_group!(benches, bench_encode, bench_reassemble);
criterion_main!(benches);
