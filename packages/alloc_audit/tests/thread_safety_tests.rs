//! Thread safety integration tests for `alloc_audit`.
//!
//! These tests verify that one memory manager can be shared by many threads reporting
//! requests at the same time.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use alloc_audit::{Address, AllocationKind, Anomaly, MemoryManager, SourceLocation};

const THREADS: usize = 8;
const BLOCKS_PER_THREAD: usize = 1_000;

fn address(thread: usize, block: usize) -> Address {
    Address::new((thread * BLOCKS_PER_THREAD + block + 1) * 16)
}

#[test]
fn concurrent_requests_keep_totals_consistent() {
    let anomalies = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&anomalies);

    let manager = Arc::new(
        MemoryManager::builder()
            .handler(move |_: &Anomaly| {
                counter.fetch_add(1, Ordering::Relaxed);
            })
            .build(),
    );
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|thread| {
            let manager = Arc::clone(&manager);
            let barrier = Arc::clone(&barrier);

            thread::spawn(move || {
                barrier.wait();

                for block in 0..BLOCKS_PER_THREAD {
                    manager.on_alloc(
                        address(thread, block),
                        block + 1,
                        SourceLocation::caller(),
                        AllocationKind::Object,
                    );
                }

                // Free every other block.
                for block in (0..BLOCKS_PER_THREAD).step_by(2) {
                    assert!(manager.on_dealloc(
                        address(thread, block),
                        SourceLocation::caller(),
                        AllocationKind::Object,
                    ));
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let kept_per_thread: usize = (0..BLOCKS_PER_THREAD)
        .skip(1)
        .step_by(2)
        .map(|block| block + 1)
        .sum();

    assert_eq!(anomalies.load(Ordering::Relaxed), 0);
    assert_eq!(manager.live_count(), THREADS * BLOCKS_PER_THREAD / 2);
    assert_eq!(manager.live_bytes(), THREADS * kept_per_thread);
    assert_eq!(manager.retired_count(), THREADS * BLOCKS_PER_THREAD / 2);
    assert_eq!(
        manager.memory_stats().allocation_count(),
        (THREADS * BLOCKS_PER_THREAD) as u64
    );
}

#[test]
fn manager_can_be_moved_between_threads() {
    let manager = MemoryManager::builder().build();
    manager.on_alloc(
        Address::new(0x10),
        8,
        SourceLocation::caller(),
        AllocationKind::Object,
    );

    let manager = thread::spawn(move || {
        assert!(manager.on_dealloc(
            Address::new(0x10),
            SourceLocation::caller(),
            AllocationKind::Object,
        ));
        manager
    })
    .join()
    .unwrap();

    assert_eq!(manager.live_count(), 0);
}

#[test]
fn internal_scope_applies_across_threads() {
    let manager = Arc::new(MemoryManager::builder().build());

    {
        let _scope = manager.internal_scope();

        let worker = Arc::clone(&manager);
        thread::spawn(move || {
            worker.on_alloc(
                Address::new(0x20),
                8,
                SourceLocation::caller(),
                AllocationKind::Object,
            );
        })
        .join()
        .unwrap();
    }

    assert!(manager
        .live_record(Address::new(0x20))
        .unwrap()
        .is_manager_memory());
}
