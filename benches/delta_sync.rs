//! Delta Sync Benchmarks
//!
//! Throughput of block signing, the rolling delta scan and reconstruction.
//!
//! Run with: `cargo bench --bench delta_sync`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::time::Duration;

use sanchay_vault::delta::{
    apply_instructions, compute_delta, FileSignature, RollingChecksum, DEFAULT_BLOCK_SIZE,
};

/// Deterministic pseudo-random file contents
fn sample_file(len: usize) -> Vec<u8> {
    let mut seed = 0x9e37_79b9u32;
    (0..len)
        .map(|_| {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            seed as u8
        })
        .collect()
}

/// Copy of `data` with a few small edits spread through it
fn edited(data: &[u8]) -> Vec<u8> {
    let mut out = data.to_vec();
    for at in [data.len() / 5, data.len() / 2, data.len() * 4 / 5] {
        out.splice(at..at + 16, b"edited paragraph text".iter().copied());
    }
    out
}

fn bench_signature(c: &mut Criterion) {
    let mut group = c.benchmark_group("signature");
    group.measurement_time(Duration::from_secs(10));

    for size in [1 << 20, 8 << 20] {
        let data = sample_file(size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &data, |b, data| {
            b.iter(|| FileSignature::compute(black_box(data), DEFAULT_BLOCK_SIZE))
        });
    }

    group.finish();
}

fn bench_rolling(c: &mut Criterion) {
    let data = sample_file(1 << 20);
    let mut group = c.benchmark_group("rolling_checksum");
    group.throughput(Throughput::Bytes((data.len() - DEFAULT_BLOCK_SIZE) as u64));

    group.bench_function("roll_1mb", |b| {
        b.iter(|| {
            let mut rolling = RollingChecksum::new(&data[..DEFAULT_BLOCK_SIZE]);
            for i in DEFAULT_BLOCK_SIZE..data.len() {
                rolling.roll(data[i - DEFAULT_BLOCK_SIZE], data[i]);
            }
            black_box(rolling.value())
        })
    });

    group.finish();
}

fn bench_delta(c: &mut Criterion) {
    let original = sample_file(4 << 20);
    let modified = edited(&original);
    let signature = FileSignature::compute(&original, DEFAULT_BLOCK_SIZE);
    let original_blocks: Vec<Vec<u8>> = original
        .chunks(DEFAULT_BLOCK_SIZE)
        .map(|b| b.to_vec())
        .collect();

    let mut group = c.benchmark_group("delta");
    group.measurement_time(Duration::from_secs(10));
    group.sample_size(20);
    group.throughput(Throughput::Bytes(modified.len() as u64));

    group.bench_function("compute_4mb_small_edits", |b| {
        b.iter(|| compute_delta(black_box(&modified), &signature))
    });

    let delta = compute_delta(&modified, &signature);
    group.bench_function("apply_4mb_small_edits", |b| {
        b.iter(|| apply_instructions(&original_blocks, black_box(&delta.instructions), &delta.new_blocks))
    });

    group.finish();
}

criterion_group!(benches, bench_signature, bench_rolling, bench_delta);
criterion_main!(benches);
