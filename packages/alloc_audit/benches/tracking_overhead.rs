//! Benchmarks to measure the compute overhead of `alloc_audit` bookkeeping.
//!
//! Each allocation reported to the memory manager is paired with its deallocation, so the
//! tables stay at a steady size and only the per-request cost is measured.

#![allow(
    missing_docs,
    reason = "No need for API documentation in benchmark code"
)]

use std::hint::black_box;

use alloc_audit::{Address, AllocationKind, MemoryManager, RecordFilter, SourceLocation, TableKind};
use criterion::{Criterion, criterion_group, criterion_main};

criterion_group!(benches, entrypoint);
criterion_main!(benches);

const SITE: SourceLocation = SourceLocation::new("bench.rs", 1);

// Live blocks present in the table during measurements.
const BACKGROUND_BLOCKS: usize = 10_000;

fn populated(manager: MemoryManager) -> MemoryManager {
    for index in 1..=BACKGROUND_BLOCKS {
        manager.on_alloc(
            Address::new(index * 64),
            64,
            SITE,
            AllocationKind::Object,
        );
    }

    manager
}

fn entrypoint(c: &mut Criterion) {
    let mut group = c.benchmark_group("alloc_audit_overhead");

    let probe = Address::new((BACKGROUND_BLOCKS + 1) * 64);

    for (name, table_kind) in [("hash", TableKind::Hash), ("array", TableKind::Array)] {
        let manager = populated(MemoryManager::builder().table_kind(table_kind).build());

        group.bench_function(format!("alloc_dealloc_{name}"), |b| {
            b.iter(|| {
                manager.on_alloc(black_box(probe), 32, SITE, AllocationKind::Object);
                black_box(manager.on_dealloc(black_box(probe), SITE, AllocationKind::Object));
            });
        });
    }

    let without_history = populated(
        MemoryManager::builder()
            .record_deallocations(false)
            .build(),
    );

    group.bench_function("alloc_dealloc_without_history", |b| {
        b.iter(|| {
            without_history.on_alloc(black_box(probe), 32, SITE, AllocationKind::Object);
            black_box(without_history.on_dealloc(black_box(probe), SITE, AllocationKind::Object));
        });
    });

    let manager = populated(MemoryManager::builder().build());

    group.bench_function("live_bytes", |b| {
        b.iter(|| black_box(manager.live_bytes()));
    });

    group.bench_function("memory_stats", |b| {
        b.iter(|| black_box(manager.memory_stats()));
    });

    group.bench_function("enumerate_live_filtered", |b| {
        let filter = RecordFilter::new().min_size(128);

        b.iter(|| {
            let mut count = 0_usize;
            manager.enumerate_live(&filter, |_| count += 1);
            black_box(count)
        });
    });

    group.finish();
}
