//! Audits the allocations of a small program and prints what it leaked.
//!
//! Settings come from `ALLOC_AUDIT_*` environment variables, for example
//! `ALLOC_AUDIT_SHRED=0xDD` to overwrite freed memory. Anomalies and lifecycle events are
//! emitted as `tracing` events.
//!
//! Run with: `cargo run --example leak_report`

use std::collections::HashMap;
use std::hint::black_box;
use std::sync::LazyLock;

use alloc_audit::{
    Address, AllocationKind, Allocator, LogAnomalies, ManagerBuilder, MemoryManager,
    RecordFilter, SourceLocation,
};
use tracing_subscriber::filter::LevelFilter;

#[global_allocator]
static ALLOCATOR: Allocator<std::alloc::System> = Allocator::system();

static MANAGER: LazyLock<MemoryManager> =
    LazyLock::new(|| ManagerBuilder::from_env().build_uninitialized());

fn main() {
    tracing_subscriber::fmt()
        .with_max_level(LevelFilter::DEBUG)
        .init();

    ALLOCATOR.attach(&MANAGER);

    // Memory that is released properly does not show up in the report.
    let mut words: HashMap<String, usize> = HashMap::new();
    for word in "the quick brown fox jumps over the lazy dog".split(' ') {
        *words.entry(word.to_string()).or_default() += 1;
    }
    black_box(&words);
    drop(words);

    // Memory that is never released does.
    let cache: &'static mut Vec<u64> = Box::leak(Box::new(Vec::with_capacity(512)));
    cache.push(42);

    println!("=== Statistics ===");
    MANAGER.print_memory_stats();

    println!("=== Leaked blocks of 1 KiB or more ===");
    MANAGER.enumerate_live(&RecordFilter::new().min_size(1024), |record| {
        println!("{} bytes at {}", record.size(), record.address());
    });

    // Interception layers that know the allocation site report requests themselves.
    println!("=== Anomalies reported by an instrumented layer ===");
    let instrumented = MemoryManager::builder().handler(LogAnomalies::default()).build();

    let site = SourceLocation::caller();
    instrumented.on_alloc(Address::new(0x1000), 64, site, AllocationKind::Array);
    instrumented.on_dealloc(Address::new(0x1000), SourceLocation::caller(), AllocationKind::Object);
    instrumented.on_dealloc(Address::new(0x1000), SourceLocation::caller(), AllocationKind::Array);
    instrumented.on_dealloc(Address::new(0x2000), SourceLocation::caller(), AllocationKind::Object);

    MANAGER
        .shutdown()
        .expect("exit statistics file could not be written");
}
