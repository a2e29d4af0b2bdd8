//! Frame encoding and reassembly benchmarks.

use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use spibridge_protocol::{opcodes, Command, CommandDecoder, Reassembler, Response};

fn response_bytes(size: usize) -> BytesMut {
    Response::ok(vec![0xA5u8; size]).encode().unwrap()
}

fn bench_command_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("command_encode");

    for size in [0, 256, 4096] {
        let mut write = vec![0x00, 0x10, 0x00];
        write.resize(3 + size, 0x5A);
        let cmd = Command::write(opcodes::PAGE_PROGRAM, write).with_wait_busy();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &cmd, |b, cmd| {
            b.iter(|| black_box(cmd.encode().unwrap()));
        });
    }

    group.finish();
}

fn bench_command_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("command_decode");

    for size in [0, 256, 4096] {
        let cmd = Command::write(opcodes::PAGE_PROGRAM, vec![0x5Au8; size]);
        let encoded = cmd.encode().unwrap();

        group.throughput(Throughput::Bytes(encoded.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &encoded, |b, encoded| {
            b.iter(|| {
                let mut decoder = CommandDecoder::new();
                decoder.extend(encoded);
                black_box(decoder.decode_command().unwrap())
            });
        });
    }

    group.finish();
}

fn bench_reassembly_single_chunk(c: &mut Criterion) {
    let mut group = c.benchmark_group("reassembly_single_chunk");

    for size in [3usize, 256, 4096] {
        let wire = response_bytes(size);

        group.throughput(Throughput::Bytes(wire.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &wire, |b, wire| {
            b.iter(|| {
                let mut reassembler = Reassembler::new();
                reassembler.feed(wire);
                black_box(reassembler.try_frame(size as u16).unwrap())
            });
        });
    }

    group.finish();
}

fn bench_reassembly_fragmented(c: &mut Criterion) {
    let mut group = c.benchmark_group("reassembly_fragmented");
    let size = 4096usize;
    let wire = response_bytes(size);

    // Serial adapters tend to deliver small bursts.
    for chunk in [1usize, 16, 64] {
        group.throughput(Throughput::Bytes(wire.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(chunk), &chunk, |b, &chunk| {
            b.iter(|| {
                let mut reassembler = Reassembler::new();
                let mut frame = None;
                for piece in wire.chunks(chunk) {
                    reassembler.feed(piece);
                    frame = reassembler.try_frame(size as u16);
                }
                black_box(frame.unwrap())
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_command_encode,
    bench_command_decode,
    bench_reassembly_single_chunk,
    bench_reassembly_fragmented,
);
criterion_main!(benches);
