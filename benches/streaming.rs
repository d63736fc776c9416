//! Criterion benchmarks for the streaming hot paths.
//!
//! Key metrics:
//! - Ring buffer push/pop throughput for typical block sizes
//! - Multiplexing of output data into raw codes
//! - Demultiplexing of raw input blocks into physical values
//!
//! Run with: cargo bench --bench streaming

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use daq_stream::device::{demultiplex, multiplex, ChannelScaling};
use daq_stream::ring::ring_buffer;
use daq_stream::signal::SignalDescriptor;
use daq_stream::sim::SimConfig;
use std::thread;

/// Push then pop one block through a ring sized for ten blocks.
fn ring_block_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_block");

    for block in [64usize, 1024, 16 * 1024] {
        let (mut writer, mut reader) = ring_buffer(block * 10);
        let data = vec![0x5555u16; block];
        let mut out = vec![0u16; block];

        group.throughput(Throughput::Elements(block as u64));
        group.bench_with_input(BenchmarkId::new("push_pop", block), &block, |b, _| {
            b.iter(|| {
                writer.push_partial(black_box(&data));
                black_box(reader.pop_into(&mut out));
            });
        });
    }

    group.finish();
}

/// Producer and consumer on separate threads, as pump and board run.
fn ring_concurrent(c: &mut Criterion) {
    const TOTAL: usize = 1 << 20;
    const BLOCK: usize = 1024;

    let mut group = c.benchmark_group("ring_concurrent");
    group.throughput(Throughput::Elements(TOTAL as u64));
    group.bench_function("spsc_1M_samples", |b| {
        b.iter(|| {
            let (mut writer, mut reader) = ring_buffer(BLOCK * 16);
            let producer = thread::spawn(move || {
                let data = vec![1u16; BLOCK];
                let mut sent = 0;
                while sent < TOTAL {
                    sent += writer.push_partial(&data[..BLOCK.min(TOTAL - sent)]);
                }
            });
            let mut out = vec![0u16; BLOCK];
            let mut received = 0;
            while received < TOTAL {
                received += reader.pop_into(&mut out);
            }
            producer.join().unwrap();
            black_box(received)
        });
    });
    group.finish();
}

fn conversion(c: &mut Criterion) {
    let caps = SimConfig::default().capabilities();
    let range = *caps.widest_range().unwrap();
    let mut group = c.benchmark_group("conversion");

    for channels in [1usize, 4] {
        let scans = 10_000;
        let sigs: Vec<SignalDescriptor> = (0..channels as u32)
            .map(|ch| {
                SignalDescriptor::new(ch)
                    .with_data((0..scans).map(|i| (i as f32 * 0.001).sin()).collect())
            })
            .collect();
        let refs: Vec<&SignalDescriptor> = sigs.iter().collect();
        let scalings: Vec<ChannelScaling> = sigs
            .iter()
            .map(|s| ChannelScaling::new(&caps, s, range))
            .collect();
        let raw = multiplex(&refs, &scalings, scans);

        group.throughput(Throughput::Elements((scans * channels) as u64));
        group.bench_with_input(BenchmarkId::new("multiplex", channels), &channels, |b, _| {
            b.iter(|| black_box(multiplex(&refs, &scalings, scans)));
        });
        group.bench_with_input(BenchmarkId::new("demultiplex", channels), &channels, |b, _| {
            b.iter(|| black_box(demultiplex(black_box(&raw), &scalings)));
        });
    }

    group.finish();
}

criterion_group!(benches, ring_block_throughput, ring_concurrent, conversion);
criterion_main!(benches);
