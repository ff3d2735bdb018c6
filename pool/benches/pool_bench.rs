//! Acquire/release throughput, single-threaded and under contention.

use std::sync::Arc;
use std::thread;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use slotpool::{ConcurrentPool, Pool};

#[repr(C)]
#[allow(dead_code)]
struct Node {
    value: u64,
    left: *mut Node,
    right: *mut Node,
}

fn single_threaded_acquire_release(c: &mut Criterion) {
    let mut pool = Pool::<Node>::new().unwrap();
    c.bench_function("single/acquire_release_cycle", |b| {
        b.iter(|| {
            let slot = unsafe { pool.acquire() }.unwrap();
            unsafe { pool.release(slot) };
        })
    });
}

fn single_threaded_fresh_acquire(c: &mut Criterion) {
    c.bench_function("single/fresh_acquire", |b| {
        b.iter_batched(
            || Pool::<Node>::new().unwrap(),
            |mut pool| {
                for _ in 0..256 {
                    unsafe { pool.acquire() }.unwrap();
                }
            },
            criterion::BatchSize::SmallInput,
        )
    });
}

fn concurrent_acquire_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("concurrent/acquire_release_cycle");
    for threads in [1usize, 2, 4, 8] {
        group.bench_with_input(BenchmarkId::from_parameter(threads), &threads, |b, &threads| {
            let pool = Arc::new(ConcurrentPool::<Node>::new().unwrap());
            b.iter(|| {
                let handles: Vec<_> = (0..threads)
                    .map(|_| {
                        let pool = Arc::clone(&pool);
                        thread::spawn(move || {
                            for _ in 0..1_000 {
                                let slot = pool.acquire().unwrap();
                                unsafe { pool.release(slot) };
                            }
                        })
                    })
                    .collect();
                for handle in handles {
                    handle.join().unwrap();
                }
            })
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    single_threaded_acquire_release,
    single_threaded_fresh_acquire,
    concurrent_acquire_release
);
criterion_main!(benches);
