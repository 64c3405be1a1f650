//! The memory manager behind the process-wide allocator.

#![cfg(not(miri))] // Miri replaces the global allocator, so cannot be used here.

use std::hint::black_box;
use std::sync::LazyLock;
use std::thread;

use alloc_audit::{Address, Allocator, MemoryManager, RecordFilter};

#[global_allocator]
static ALLOCATOR: Allocator<std::alloc::System> = Allocator::system();

const FILL: u8 = 0x5A;

static MANAGER: LazyLock<&'static MemoryManager> = LazyLock::new(|| {
    let manager: &'static MemoryManager = Box::leak(Box::new(
        MemoryManager::builder()
            .fill_new_blocks(FILL)
            .build_uninitialized(),
    ));

    ALLOCATOR.attach(manager);
    manager
});

fn manager() -> &'static MemoryManager {
    *MANAGER
}

#[test]
fn boxed_value_is_live_until_dropped() {
    let manager = manager();

    let boxed = black_box(Box::new([7_u64; 32]));
    let address = Address::from_ptr(&raw const *boxed);

    let record = manager.live_record(address).unwrap();
    assert_eq!(record.size(), 256);
    assert!(!record.is_manager_memory());

    let retired_before = manager.retired_count();
    drop(boxed);

    assert!(manager.retired_count() > retired_before);
}

#[test]
fn zeroed_blocks_are_not_filled() {
    manager();

    let zeroed = black_box(vec![0_u8; 4096]);

    assert!(zeroed.iter().all(|byte| *byte == 0));
}

#[test]
fn manager_storage_is_bookkeeping() {
    let manager = manager();

    let stats = manager.memory_stats();

    // The record table storage reserved at activation at the very least.
    assert!(stats.internal_count() > 0);
    assert!(stats.internal_bytes() > 0);
}

#[test]
fn grown_vector_follows_its_block() {
    let manager = manager();

    let mut values: Vec<u32> = Vec::with_capacity(1);
    for value in 0..1000 {
        values.push(value);
    }

    let record = manager
        .live_record(Address::from_ptr(values.as_ptr()))
        .unwrap();
    assert_eq!(record.size(), values.capacity() * size_of::<u32>());
}

#[test]
fn other_threads_are_tracked() {
    let manager = manager();

    let address = thread::spawn(|| {
        let leaked: &'static mut [u8; 100] = Box::leak(Box::new([1_u8; 100]));
        Address::from_ptr(&raw const *leaked)
    })
    .join()
    .unwrap();

    assert_eq!(manager.live_record(address).unwrap().size(), 100);

    let mut found = false;
    manager.enumerate_live(&RecordFilter::new().min_size(100), |record| {
        found |= record.address() == address;
    });
    assert!(found);
}
