//! Benchmarks for the region buffer hot path.
//!
//! - push/pop of one audio chunk through the blocking API
//! - read region open/close as the drain loop does it
//! - async push/pop on a current-thread runtime
//! - AudioPacket encode for a full chunk
//!
//! Run with: cargo bench --bench region_buffer

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use mic_relay::buffer::RegionBuffer;
use mic_relay::constants::{BUFFER_CAPACITY, CHUNK_SIZE};
use mic_relay::protocol::{AudioFormat, AudioPacket};

/// Push one chunk then pop it back, across chunk sizes
fn bench_push_pop(c: &mut Criterion) {
    let mut group = c.benchmark_group("push_pop");

    for size in [256usize, 1024, 4096] {
        let buffer = RegionBuffer::new(BUFFER_CAPACITY).unwrap();
        let data = vec![0x5au8; size];
        let mut out = vec![0u8; size];

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                let pushed = buffer.blocking_push(black_box(&data));
                let popped = buffer.blocking_pop(&mut out);
                black_box((pushed, popped))
            })
        });
    }
    group.finish();
}

/// Open a read region, close it fully, refill (drain loop pattern)
fn bench_read_region_cycle(c: &mut Criterion) {
    let buffer = RegionBuffer::new(BUFFER_CAPACITY).unwrap();
    let chunk = vec![1u8; CHUNK_SIZE];

    c.bench_function("read_region_cycle", |b| {
        b.iter(|| {
            buffer.blocking_push(&chunk);
            let region = buffer.blocking_open_read_region(CHUNK_SIZE);
            let len = region.len();
            black_box(region.as_slice());
            region.close(len);
        })
    });
}

/// Wrapped reads: the write position sits near the end of storage
fn bench_wrapped_read(c: &mut Criterion) {
    let buffer = RegionBuffer::new(BUFFER_CAPACITY).unwrap();
    let chunk = vec![2u8; CHUNK_SIZE];
    let mut out = vec![0u8; CHUNK_SIZE];

    // offset the ring so every other chunk straddles the end
    buffer.blocking_push(&vec![0u8; CHUNK_SIZE / 2]);
    buffer.blocking_pop(&mut out[..CHUNK_SIZE / 2]);

    c.bench_function("wrapped_read", |b| {
        b.iter(|| {
            buffer.blocking_push(&chunk);
            black_box(buffer.blocking_pop(&mut out))
        })
    });
}

/// Async push/pop as the session tasks use it
fn bench_async_push_pop(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
    let buffer = RegionBuffer::new(BUFFER_CAPACITY).unwrap();
    let chunk = vec![3u8; CHUNK_SIZE];
    let mut out = vec![0u8; CHUNK_SIZE];

    let mut group = c.benchmark_group("async");
    group.throughput(Throughput::Bytes(CHUNK_SIZE as u64));
    group.bench_function("push_pop", |b| {
        b.iter(|| {
            runtime.block_on(async {
                buffer.push(&chunk).await;
                black_box(buffer.pop(&mut out).await)
            })
        })
    });
    group.finish();
}

fn bench_packet_encode(c: &mut Criterion) {
    let packet = AudioPacket {
        buffer: vec![7u8; CHUNK_SIZE],
        sample_rate: 16000,
        channel_count: 1,
        audio_format: AudioFormat::I16,
    };

    c.bench_function("audio_packet_encode", |b| {
        b.iter(|| black_box(packet.encode().unwrap()))
    });
}

criterion_group!(
    benches,
    bench_push_pop,
    bench_read_region_cycle,
    bench_wrapped_read,
    bench_async_push_pop,
    bench_packet_encode,
);
criterion_main!(benches);
