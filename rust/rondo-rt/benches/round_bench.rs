//! Round-throughput benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::atomic::{AtomicU64, Ordering};

use rondo_rt::{Builder, Lockable, Mode};

/// Disjoint items: pure scheduling overhead, no arbitration losses.
fn bench_disjoint(c: &mut Criterion) {
    const N: usize = 10_000;
    let resources: Vec<Lockable> = (0..N).map(|_| Lockable::new()).collect();

    let mut group = c.benchmark_group("disjoint");
    for workers in [1usize, 2, 4] {
        group.bench_with_input(BenchmarkId::from_parameter(workers), &workers, |b, &w| {
            b.iter(|| {
                let total = AtomicU64::new(0);
                let report = Builder::new(
                    |v: &usize, facing| facing.acquire(&resources[*v], Mode::Write),
                    |v, _facing| {
                        total.fetch_add(*v as u64, Ordering::Relaxed);
                        Ok(())
                    },
                )
                .workers(w)
                .id_fn(|v| *v)
                .run(0..N)
                .unwrap();
                black_box((report.total_committed(), total.into_inner()))
            });
        });
    }
    group.finish();
}

/// Heavy contention: every item fights over a handful of resources.
fn bench_contended(c: &mut Criterion) {
    const N: usize = 2_000;
    const GROUPS: usize = 8;
    let resources: Vec<Lockable> = (0..GROUPS).map(|_| Lockable::new()).collect();

    let mut group = c.benchmark_group("contended");
    for workers in [1usize, 4] {
        group.bench_with_input(BenchmarkId::from_parameter(workers), &workers, |b, &w| {
            b.iter(|| {
                let report = Builder::new(
                    |v: &usize, facing| facing.acquire(&resources[*v % GROUPS], Mode::Write),
                    |_v, _facing| Ok(()),
                )
                .workers(w)
                .id_fn(|v| *v)
                .run(0..N)
                .unwrap();
                black_box(report.total_committed())
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_disjoint, bench_contended);
criterion_main!(benches);
