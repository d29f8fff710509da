//! Benchmarks for claiming and releasing pool buffers, and for the primitives underneath.

#![allow(
    missing_docs,
    reason = "No need for API documentation in benchmark code"
)]

use std::hint::black_box;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use criterion::{Criterion, criterion_group, criterion_main};
use spin_pool::{ConcurrentBufferPool, ConcurrentList, PackedIndexProvider, RwSpinLock};

criterion_group!(benches, entrypoint);
criterion_main!(benches);

const TIMEOUT: Duration = Duration::from_secs(1);

fn entrypoint(c: &mut Criterion) {
    let mut group = c.benchmark_group("sp_claim");

    group.bench_function("claim_release", |b| {
        let pool = ConcurrentBufferPool::new();

        b.iter(|| {
            let claim = pool.claim_buffer::<u8>().unwrap();
            black_box(claim.index());
            claim.release().unwrap();
        });
    });

    group.bench_function("claim_fill_release", |b| {
        let pool = ConcurrentBufferPool::new();
        let payload = [0xA5_u8; 128];

        b.iter(|| {
            let mut claim = pool.claim_buffer::<u8>().unwrap();
            claim.extend_from_slice(black_box(&payload)).unwrap();
            claim.release().unwrap();
        });
    });

    group.bench_function("claim_release_contended", |b| {
        let pool = Arc::new(
            ConcurrentBufferPool::builder()
                .lock_timeout(TIMEOUT)
                .build(),
        );

        b.iter_custom(|iterations| {
            let workers = (0..4)
                .map(|_| {
                    let pool = Arc::clone(&pool);

                    thread::spawn(move || {
                        let started = Instant::now();

                        for _ in 0..iterations {
                            let claim = pool.claim_buffer::<u64>().unwrap();
                            claim.release().unwrap();
                        }

                        started.elapsed()
                    })
                })
                .collect::<Vec<_>>();

            workers
                .into_iter()
                .map(|worker| worker.join().unwrap())
                .max()
                .unwrap_or_default()
        });
    });

    group.finish();

    let mut group = c.benchmark_group("sp_primitives");

    group.bench_function("index_fetch_return", |b| {
        let provider = PackedIndexProvider::new();

        b.iter(|| {
            let index = provider.fetch_index().unwrap();
            provider.return_index(black_box(index)).unwrap();
        });
    });

    group.bench_function("lock_read", |b| {
        let lock = RwSpinLock::new(42_usize);

        b.iter(|| *lock.read(TIMEOUT).unwrap());
    });

    group.bench_function("lock_write", |b| {
        let lock = RwSpinLock::new(0_usize);

        b.iter(|| {
            let mut value = lock.write(TIMEOUT).unwrap();
            *value = value.wrapping_add(1);
        });
    });

    group.bench_function("list_push_clear", |b| {
        let list = ConcurrentList::new();

        b.iter(|| {
            let mut writer = list.write(TIMEOUT).unwrap();
            for value in 0..64_u32 {
                writer.push(value).unwrap();
            }
            writer.clear();
        });
    });

    group.finish();
}
