#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Process-wide auditing of memory allocations.
//!
//! A [`MemoryManager`] keeps a record of every live block reported to it and checks each
//! deallocation against those records. Misuse is reported as an [`Anomaly`] to the registered
//! [`AnomalyHandler`]s:
//!
//! - a block allocated at an address that is already live
//! - a block freed twice
//! - an address freed that was never allocated
//! - a block freed as a different [`AllocationKind`] than it was allocated as
//!
//! At any point, the live blocks can be listed as a leak report, summarized in a size
//! histogram or served to external diagnostic tools through a line-based debug protocol
//! (see [`MemoryManager::handle_debug_request()`]).
//!
//! The core types are:
//! - [`MemoryManager`] - Tracks requests and detects anomalies
//! - [`ManagerBuilder`] - Configures a memory manager, in code or from environment variables
//! - [`RecordTable`] - Storage for live records, with [`HashRecordTable`] as the default
//! - [`Allocator`] - A Rust memory allocator wrapper that feeds a memory manager
//!
//! This package is a development tool. Tracking every request through one lock costs far more
//! than the allocation itself.
//!
//! # Reporting requests directly
//!
//! Allocation layers that know more than the Rust allocator does, such as the allocation site
//! or whether a block holds an array, report requests themselves:
//!
//! ```
//! use alloc_audit::{Address, AllocationKind, Anomaly, MemoryManager, SourceLocation};
//!
//! let manager = MemoryManager::builder()
//!     .handler(|anomaly: &Anomaly| eprintln!("{anomaly}"))
//!     .build();
//!
//! manager.on_alloc(
//!     Address::new(0x1000),
//!     256,
//!     SourceLocation::caller(),
//!     AllocationKind::Array,
//! );
//!
//! // Freed as an object although allocated as an array: reported, but still freed.
//! manager.on_dealloc(Address::new(0x1000), SourceLocation::caller(), AllocationKind::Object);
//!
//! assert_eq!(manager.live_count(), 0);
//! ```
//!
//! # Auditing the whole process
//!
//! ```
//! use std::sync::LazyLock;
//!
//! use alloc_audit::{Allocator, ManagerBuilder, MemoryManager};
//!
//! #[global_allocator]
//! static ALLOCATOR: Allocator<std::alloc::System> = Allocator::system();
//!
//! static MANAGER: LazyLock<MemoryManager> =
//!     LazyLock::new(|| ManagerBuilder::from_env().build_uninitialized());
//!
//! fn main() {
//!     ALLOCATOR.attach(&MANAGER);
//!
//!     let _leaked = Box::leak(Box::new([0_u8; 100]));
//!
//!     MANAGER.print_allocated();
//!     MANAGER.shutdown().unwrap();
//! }
//! ```
//!
//! # Miri compatibility
//!
//! Miri replaces the global allocator with its own logic, so you cannot execute code that uses
//! [`Allocator`] under Miri. The memory manager itself works under Miri.

mod allocator;
mod anomaly;
mod array_table;
mod builder;
mod error;
mod filter;
mod hash_table;
mod histogram;
mod manager;
mod pending;
mod record;
mod report;
mod retired;
mod table;
mod wire;

pub use allocator::*;
pub use anomaly::*;
pub use array_table::*;
pub use builder::*;
pub use error::*;
pub use filter::*;
pub use hash_table::*;
pub use histogram::*;
pub use manager::*;
pub use record::*;
pub use report::*;
pub use retired::*;
pub use table::*;
pub use wire::*;
