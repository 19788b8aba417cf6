//! Framing benchmarks: reassembly and outbound chunking
//!
//! Measures the in-memory cost of the buffer chain without any sockets:
//! - reassembling messages fed in receive-sized pieces
//! - walking an outbound frame chunk by chunk

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use weft::buffer::BufferPool;
use weft::framing::{encode, Messages, OutboundFrame, Reassembler};

const MESSAGE_SIZES: &[usize] = &[16, 256, 1024, 16384];
const BUFFER_SIZES: &[usize] = &[256, 1024, 16384];
const MESSAGE_COUNT: usize = 1_000;

fn wire_stream(size: usize) -> Vec<u8> {
    let payload = vec![b'x'; size];
    let frame = encode(&payload).unwrap();
    let mut stream = Vec::with_capacity(frame.len() * MESSAGE_COUNT);
    for _ in 0..MESSAGE_COUNT {
        stream.extend_from_slice(&frame);
    }
    stream
}

fn reassemble(c: &mut Criterion) {
    weft::dev_tracing::init_tracing();
    let mut group = c.benchmark_group("framing/reassemble");

    for &buffer_size in BUFFER_SIZES {
        for &size in MESSAGE_SIZES {
            let stream = wire_stream(size);
            group.throughput(Throughput::Bytes(stream.len() as u64));
            group.bench_with_input(
                BenchmarkId::new(format!("buffer_{buffer_size}"), size),
                &stream,
                |b, stream| {
                    let pool = BufferPool::new(buffer_size, 16);
                    let mut reassembler = Reassembler::new(&pool);
                    let mut messages = Messages::new();
                    b.iter(|| {
                        messages.clear();
                        for piece in stream.chunks(buffer_size) {
                            reassembler.feed(piece, &mut messages).unwrap();
                        }
                        let delivered = messages.len();
                        assert_eq!(delivered, MESSAGE_COUNT);
                        black_box(delivered)
                    });
                },
            );
        }
    }
    group.finish();
}

fn chunk_outbound(c: &mut Criterion) {
    let mut group = c.benchmark_group("framing/outbound");

    for &size in MESSAGE_SIZES {
        let wire = encode(&vec![b'y'; size]).unwrap();
        group.throughput(Throughput::Bytes(wire.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &wire, |b, wire| {
            b.iter(|| {
                let mut frame = OutboundFrame::new(wire.clone(), 1024);
                let mut chunks = 0;
                loop {
                    let n = black_box(frame.chunk()).len();
                    chunks += 1;
                    if frame.advance(n) {
                        break;
                    }
                }
                black_box(chunks)
            });
        });
    }
    group.finish();
}

criterion_group!(benches, reassemble, chunk_outbound);
criterion_main!(benches);
