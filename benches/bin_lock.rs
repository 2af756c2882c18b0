//! Benchmark for the per-bin reader/writer lock array
//!
//! Target: independent bins should scale near-linearly with thread count,
//! since contention only exists within a bin, never across bins.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use std::sync::Arc;
use std::thread;
use tazer::binlock::BinLockTable;

fn bench_single_bin_reads(c: &mut Criterion) {
    let mut group = c.benchmark_group("bin_lock");
    group.throughput(Throughput::Elements(1));

    let table = BinLockTable::new(1);
    group.bench_function("single_bin_read", |b| {
        b.iter(|| {
            let _guard = table.read(black_box(0));
        });
    });

    group.finish();
}

fn bench_write_then_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("bin_lock");
    group.throughput(Throughput::Elements(1));

    let table = BinLockTable::new(64);
    group.bench_function("write_then_read_same_bin", |b| {
        b.iter(|| {
            {
                let _guard = table.write(black_box(3));
            }
            let _guard = table.read(black_box(3));
        });
    });

    group.finish();
}

fn bench_independent_bins_scale(c: &mut Criterion) {
    let mut group = c.benchmark_group("bin_lock");
    group.throughput(Throughput::Elements(8));

    let table = Arc::new(BinLockTable::new(8));
    group.bench_function("eight_threads_distinct_bins", |b| {
        b.iter(|| {
            let handles: Vec<_> = (0..8)
                .map(|bin| {
                    let table = table.clone();
                    thread::spawn(move || {
                        let _guard = table.write(bin);
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }
        });
    });

    group.finish();
}

criterion_group!(benches, bench_single_bin_reads, bench_write_then_read, bench_independent_bins_scale);
criterion_main!(benches);
