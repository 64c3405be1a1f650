use std::cell::{Cell, RefCell};
use std::fmt;
use std::sync::atomic::{self, AtomicU32};

use parking_lot::ReentrantMutex;
use tracing::{debug, info, trace, warn};

use crate::builder::ManagerConfig;
use crate::pending::{PendingRequest, PendingRequests};
use crate::wire::{write_header, write_record_stream, write_running_stats};
use crate::{
    Address, AllocatedReport, AllocationKind, AllocationRecord, Anomaly, AnomalyHandler,
    ManagerBuilder, MemoryStats, MessageKind, RecordFilter, RecordTable, Result,
    RetiredRecords, RunningStats, SizeHistogram, SourceLocation, read_message,
};

/// Lifecycle of a [`MemoryManager`].
#[expect(
    clippy::exhaustive_enums,
    reason = "the lifecycle is fixed, new phases would change every caller"
)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ManagerPhase {
    /// Built but not yet accepting allocation requests.
    Uninitialized,

    /// Tracking allocation requests.
    Active,

    /// Producing exit statistics. Allocation requests are no longer accepted.
    ShuttingDown,

    /// Shut down. Every operation except [`MemoryManager::phase()`] panics.
    Terminated,
}

/// Tracks every allocation and deallocation reported to it and detects misuse of memory.
///
/// The memory manager is fed by an interception layer through [`on_alloc()`][Self::on_alloc]
/// and [`on_dealloc()`][Self::on_dealloc]. The [`Allocator`][crate::Allocator] is one such
/// layer, for the Rust global allocator. Detected misuse is reported to the registered
/// [`AnomalyHandler`]s and the live records can be inspected and reported at any time.
///
/// # Thread safety
///
/// All operations are serialized by one reentrant lock. The thread holding the lock may call
/// back into the memory manager, which is what happens when tracking a request needs to
/// allocate memory itself. Such nested requests are flagged as memory manager bookkeeping.
/// If they arrive while a record table is in use, they are parked and recorded once the
/// table has been released.
///
/// # Examples
///
/// ```
/// use alloc_audit::{Address, AllocationKind, Anomaly, MemoryManager, SourceLocation};
///
/// let manager = MemoryManager::builder()
///     .handler(|anomaly: &Anomaly| eprintln!("{anomaly}"))
///     .build();
///
/// let site = SourceLocation::new("main.rs", 10);
/// manager.on_alloc(Address::new(0x1000), 64, site, AllocationKind::Object);
///
/// assert!(manager.on_dealloc(Address::new(0x1000), site, AllocationKind::Object));
/// assert_eq!(manager.live_count(), 0);
///
/// // Freeing the same block again is detected as a double free.
/// assert!(!manager.on_dealloc(Address::new(0x1000), site, AllocationKind::Object));
/// ```
pub struct MemoryManager {
    inner: ReentrantMutex<Inner>,

    config: ManagerConfig,

    // Number of open internal scopes. While non-zero, all new records are bookkeeping.
    internal_scopes: AtomicU32,
}

struct Inner {
    phase: Cell<ManagerPhase>,

    // Number of memory manager calls on the stack of the thread holding the lock.
    depth: Cell<u32>,

    next_id: Cell<u32>,

    // Whether allocations are recorded. Once off, deallocations are trusted.
    tracking_allocations: Cell<bool>,

    pending: RefCell<PendingRequests>,

    state: RefCell<State>,

    handlers: RefCell<Vec<Box<dyn AnomalyHandler>>>,
}

struct State {
    table: Option<Box<dyn RecordTable>>,

    // Present while deletion tracking is enabled.
    retired: Option<RetiredRecords>,

    // Freed blocks whose records were not retained.
    discarded_retired: usize,

    check_double_allocation: bool,

    snapshot_id: u32,
}

impl MemoryManager {
    /// Creates a builder for a memory manager.
    #[must_use]
    pub fn builder() -> ManagerBuilder {
        ManagerBuilder::new()
    }

    pub(crate) fn new(
        config: ManagerConfig,
        table: Option<Box<dyn RecordTable>>,
        handlers: Vec<Box<dyn AnomalyHandler>>,
    ) -> Self {
        let tracking_allocations = table.is_some();
        let retired = (tracking_allocations && config.record_deallocations)
            .then(RetiredRecords::new);

        let state = State {
            table,
            retired,
            discarded_retired: 0,
            check_double_allocation: config.check_double_allocation,
            snapshot_id: 0,
        };

        Self {
            inner: ReentrantMutex::new(Inner {
                phase: Cell::new(ManagerPhase::Uninitialized),
                depth: Cell::new(0),
                next_id: Cell::new(0),
                tracking_allocations: Cell::new(tracking_allocations),
                pending: RefCell::new(PendingRequests::new()),
                state: RefCell::new(state),
                handlers: RefCell::new(handlers),
            }),
            config,
            internal_scopes: AtomicU32::new(0),
        }
    }

    /// The current lifecycle phase.
    #[must_use]
    pub fn phase(&self) -> ManagerPhase {
        self.inner.lock().phase.get()
    }

    /// Starts accepting allocation requests.
    ///
    /// The initial table capacity is reserved right away. If an [`Allocator`][crate::Allocator]
    /// is attached, this storage is recorded as memory manager bookkeeping.
    ///
    /// # Panics
    ///
    /// Panics if the memory manager is not [`ManagerPhase::Uninitialized`].
    pub fn activate(&self) {
        let inner = self.inner.lock();

        let phase = inner.phase.get();
        assert!(
            phase == ManagerPhase::Uninitialized,
            "memory manager activated while {phase:?}"
        );

        inner.phase.set(ManagerPhase::Active);

        inner.guarded(|| {
            if let Some(table) = inner.state.borrow_mut().table.as_mut() {
                table.reserve(self.config.initial_capacity);
            }

            debug!(
                initial_capacity = self.config.initial_capacity,
                "memory manager activated"
            );
        });
    }

    /// Records an allocation.
    ///
    /// If a block is already live at the same address, it is replaced and reported as
    /// [`Anomaly::MultipleAllocation`] unless double allocation checks are disabled.
    ///
    /// # Panics
    ///
    /// Panics if the memory manager is not [`ManagerPhase::Active`], if the address is null,
    /// if the size is zero or if the file name of the site is empty.
    pub fn on_alloc(
        &self,
        address: Address,
        size: usize,
        site: SourceLocation,
        kind: AllocationKind,
    ) {
        let inner = self.inner.lock();
        inner.assert_active();

        if !inner.tracking_allocations.get() {
            return;
        }

        let internal = self.internal_scopes.load(atomic::Ordering::Relaxed) > 0;

        inner.guarded(|| {
            let id = inner.take_id();
            let nested = inner.is_nested();

            if nested {
                if inner.tables_busy() {
                    inner.pending.borrow_mut().push(PendingRequest::Allocation {
                        id,
                        address,
                        size,
                        site,
                        kind,
                    });
                    return;
                }

                // Requests parked earlier must not be overtaken.
                inner.drain_pending();
            }

            inner.record_allocation(AllocationRecord::new(
                id,
                address,
                size,
                site,
                kind,
                internal || nested,
            ));
        });
    }

    /// Records a deallocation and returns whether it matched a live block.
    ///
    /// Freeing a block as a different kind than it was allocated as is reported but still
    /// frees the block. Freeing an address without a live block is reported as
    /// [`Anomaly::MultipleDeletion`] if the address has a freed record and as
    /// [`Anomaly::UnallocatedDeletion`] otherwise, and returns `false`.
    ///
    /// Freeing the null address is always accepted. After
    /// [`cancel_allocation_tracking()`][Self::cancel_allocation_tracking] every deallocation
    /// is accepted.
    ///
    /// A deallocation requested while this thread is inside a record table method, such as
    /// a custom [`RecordTable`] releasing its own storage, cannot be checked yet. It is
    /// accepted and returns `true`, and any anomaly is reported once the table method has
    /// returned. Requests from anomaly handlers and report visitors are checked right away.
    ///
    /// # Panics
    ///
    /// Panics if the memory manager is not [`ManagerPhase::Active`] or if the file name of the
    /// site is empty.
    pub fn on_dealloc(&self, address: Address, site: SourceLocation, kind: AllocationKind) -> bool {
        self.dealloc_request(address, site, kind, false)
    }

    /// Records a deallocation of a block that may predate the memory manager.
    ///
    /// Addresses with neither a live nor a retained freed record are ignored and `false` is
    /// returned. Requests made from inside a record table method are accepted and checked
    /// once the table method has returned.
    pub(crate) fn on_dealloc_if_seen(&self, address: Address) -> bool {
        self.dealloc_request(
            address,
            SourceLocation::UNKNOWN,
            AllocationKind::Object,
            true,
        )
    }

    fn dealloc_request(
        &self,
        address: Address,
        site: SourceLocation,
        kind: AllocationKind,
        only_if_seen: bool,
    ) -> bool {
        let inner = self.inner.lock();
        inner.assert_active();

        if address.is_null() || !inner.tracking_allocations.get() {
            return true;
        }

        inner.guarded(|| {
            if inner.is_nested() {
                if inner.tables_busy() {
                    inner.pending.borrow_mut().push(PendingRequest::Deallocation {
                        address,
                        site,
                        kind,
                        only_if_seen,
                    });
                    return true;
                }

                inner.drain_pending();
            }

            inner.record_deallocation(address, site, kind, only_if_seen)
        })
    }

    /// Stops recording allocations for the rest of the run and discards all records.
    ///
    /// Afterwards, every deallocation is accepted without checks.
    ///
    /// # Panics
    ///
    /// Panics if the memory manager is terminated.
    pub fn cancel_allocation_tracking(&self) {
        let inner = self.inner.lock();
        inner.assert_usable();

        inner.guarded(|| {
            inner.tracking_allocations.set(false);

            let (table, retired) = {
                let mut state = inner.state.borrow_mut();
                let table = state.table.take();
                let retired = state.retired.take();

                if let Some(retired) = &retired {
                    state.discard_retired(retired.len());
                }

                (table, retired)
            };

            let discarded = table.as_ref().map_or(0, |table| table.len());
            drop(table);
            drop(retired);

            info!(discarded, "allocation tracking cancelled");
        });
    }

    /// Stops retaining records of freed blocks, keeping only their count.
    ///
    /// Repeated deallocation can no longer be told apart from deallocation of never allocated
    /// memory. Both are reported as [`Anomaly::UnallocatedDeletion`].
    ///
    /// # Panics
    ///
    /// Panics if the memory manager is terminated.
    pub fn cancel_deletion_tracking(&self) {
        let inner = self.inner.lock();
        inner.assert_usable();

        inner.guarded(|| {
            let retired = {
                let mut state = inner.state.borrow_mut();
                let retired = state.retired.take();

                if let Some(retired) = &retired {
                    state.discard_retired(retired.len());
                }

                retired
            };

            if let Some(retired) = retired {
                info!(discarded = retired.len(), "deletion tracking cancelled");
            }
        });
    }

    /// Starts retaining records of freed blocks again.
    ///
    /// Blocks freed while deletion tracking was off have no records, so freeing them again
    /// is reported as [`Anomaly::UnallocatedDeletion`]. Has no effect while allocation
    /// tracking is off.
    ///
    /// # Panics
    ///
    /// Panics if the memory manager is terminated.
    pub fn enable_deletion_tracking(&self) {
        let inner = self.inner.lock();
        inner.assert_usable();

        if !inner.tracking_allocations.get() {
            return;
        }

        inner.guarded(|| {
            let mut state = inner.state.borrow_mut();

            if state.retired.is_none() {
                state.retired = Some(RetiredRecords::new());
                info!("deletion tracking enabled");
            }
        });
    }

    /// Whether records of freed blocks are retained.
    #[must_use]
    pub fn is_tracking_deletions(&self) -> bool {
        self.with_state(|state| state.retired.is_some())
    }

    /// Whether allocations are recorded.
    #[must_use]
    pub fn is_tracking_allocations(&self) -> bool {
        let inner = self.inner.lock();
        inner.assert_usable();
        inner.tracking_allocations.get()
    }

    /// Opens a scope during which every recorded allocation is flagged as memory manager
    /// bookkeeping, on any thread.
    ///
    /// Use this around diagnostic code whose allocations should not show up in leak reports.
    #[must_use]
    pub fn internal_scope(&self) -> InternalScope<'_> {
        self.internal_scopes
            .fetch_add(1, atomic::Ordering::Relaxed);

        InternalScope { manager: self }
    }

    /// Number of live blocks. O(1).
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.with_state(State::live_count)
    }

    /// Total size of the live blocks. O(1).
    #[must_use]
    pub fn live_bytes(&self) -> usize {
        self.with_state(|state| state.table.as_ref().map_or(0, |table| table.total_bytes()))
    }

    /// Number of freed blocks, whether their records are retained or only counted. O(1).
    #[must_use]
    pub fn retired_count(&self) -> usize {
        self.with_state(State::retired_count)
    }

    /// Number of live and freed blocks. O(1).
    #[must_use]
    pub fn total_count(&self) -> usize {
        self.with_state(|state| state.live_count().saturating_add(state.retired_count()))
    }

    /// The live record at `address`, if there is one.
    #[must_use]
    pub fn live_record(&self, address: Address) -> Option<AllocationRecord> {
        self.with_state(|state| state.table.as_ref()?.get(address))
    }

    /// The most recent freed record at `address`, if freed records are retained.
    #[must_use]
    pub fn retired_record(&self, address: Address) -> Option<AllocationRecord> {
        self.with_state(|state| state.retired.as_ref()?.find_most_recent(address))
    }

    /// Gathers point-in-time statistics. O(n) in the number of live blocks.
    #[must_use]
    pub fn memory_stats(&self) -> MemoryStats {
        let inner = self.inner.lock();
        inner.assert_usable();

        let lost_requests = inner.pending.borrow().lost();
        let allocation_count = u64::from(inner.next_id.get());

        inner.guarded(|| {
            let state = inner.state.borrow();

            let mut internal_count = 0_usize;
            let mut internal_bytes = 0_usize;
            let mut histogram = SizeHistogram::new();

            if let Some(table) = state.table.as_ref() {
                for record in table.records() {
                    histogram.add(record.size());

                    if record.is_manager_memory() {
                        internal_count = internal_count.saturating_add(1);
                        internal_bytes = internal_bytes.saturating_add(record.size());
                    }
                }
            }

            MemoryStats::new(
                state.live_count(),
                state.table.as_ref().map_or(0, |table| table.total_bytes()),
                internal_count,
                internal_bytes,
                state.retired_count(),
                allocation_count,
                lost_requests,
                histogram,
            )
        })
    }

    /// Counts the live blocks per size bucket. O(n) in the number of live blocks.
    #[must_use]
    pub fn size_histogram(&self) -> SizeHistogram {
        self.with_state(|state| {
            state
                .table
                .as_ref()
                .map(|table| table.size_histogram())
                .unwrap_or_default()
        })
    }

    /// Calls `visit` for every live record that passes the filter, in allocation order.
    ///
    /// The records are copied before the first call, so `visit` may use the memory manager
    /// freely. Blocks allocated or freed during the visit do not affect it.
    pub fn enumerate_live(&self, filter: &RecordFilter, mut visit: impl FnMut(&AllocationRecord)) {
        for record in &self.collect_live(|record| filter.matches(record)) {
            visit(record);
        }
    }

    /// Calls `visit` for every retained record of a freed block, in allocation order.
    ///
    /// The records are copied before the first call, so `visit` may use the memory manager
    /// freely.
    pub fn enumerate_retired(&self, mut visit: impl FnMut(&AllocationRecord)) {
        let records = {
            let inner = self.inner.lock();
            inner.assert_usable();

            inner.guarded(|| {
                let state = inner.state.borrow();
                let Some(retired) = state.retired.as_ref() else {
                    return Vec::new();
                };

                let mut records = Vec::with_capacity(retired.len());
                records.extend(retired.records().copied());
                records.sort_unstable_by_key(AllocationRecord::id);
                records
            })
        };

        for record in &records {
            visit(record);
        }
    }

    /// Sets the report mark of every live record that passes the filter and returns how many
    /// records were marked.
    pub fn mark_live(&self, filter: &RecordFilter, mark: u8) -> usize {
        let inner = self.inner.lock();
        inner.assert_usable();

        inner.guarded(|| {
            let mut state = inner.state.borrow_mut();
            let Some(table) = state.table.as_mut() else {
                return 0;
            };

            let mut marked = 0_usize;
            table.for_each_mut(&mut |record: &mut AllocationRecord| {
                if filter.matches(record) {
                    record.set_mark(mark);
                    marked = marked.saturating_add(1);
                }
            });

            marked
        })
    }

    /// Lists the live blocks, optionally including memory manager bookkeeping.
    #[must_use]
    pub fn allocated_report(&self, include_internal: bool) -> AllocatedReport {
        let filter = RecordFilter::new().include_internal(include_internal);

        AllocatedReport::new(self.collect_live(|record| filter.matches(record)))
    }

    /// Prints the live blocks that are not memory manager bookkeeping to stdout.
    #[cfg_attr(test, mutants::skip)] // Only prints to stdout.
    pub fn print_allocated(&self) {
        self.allocated_report(false).print_to_stdout();
    }

    /// Prints point-in-time statistics to stdout.
    #[cfg_attr(test, mutants::skip)] // Only prints to stdout.
    pub fn print_memory_stats(&self) {
        self.memory_stats().print_to_stdout();
    }

    /// Remembers the next allocation id as the start of a snapshot.
    ///
    /// [`snapshot_diff()`][Self::snapshot_diff] lists the live blocks allocated since.
    pub fn save_snapshot(&self) {
        let inner = self.inner.lock();
        inner.assert_usable();

        let snapshot_id = inner.next_id.get();
        inner.state.borrow_mut().snapshot_id = snapshot_id;

        debug!(snapshot_id, "snapshot saved");
    }

    /// Lists the live blocks that were allocated since the last saved snapshot and pass the
    /// filter, in allocation order.
    #[must_use]
    pub fn snapshot_diff(&self, filter: &RecordFilter) -> Vec<AllocationRecord> {
        let snapshot_id = self.with_state(|state| state.snapshot_id);

        self.collect_live(|record| record.id() >= snapshot_id && filter.matches(record))
    }

    /// Counts, totals and size histogram of the live blocks, as sent to external tools.
    #[must_use]
    pub fn running_stats(&self) -> RunningStats {
        self.with_state(|state| {
            RunningStats::new(
                state.live_count(),
                state.table.as_ref().map_or(0, |table| table.total_bytes()),
                state.retired_count(),
                state
                    .table
                    .as_ref()
                    .map(|table| table.size_histogram())
                    .unwrap_or_default(),
            )
        })
    }

    /// Answers a debug protocol request from an external diagnostic tool.
    ///
    /// Requests carrying a filter may omit it, in which case the default [`RecordFilter`]
    /// applies. See [`request()`][crate::request] for building requests.
    ///
    /// # Errors
    ///
    /// Fails if the request is malformed or from an incompatible protocol version.
    pub fn handle_debug_request(&self, request: &str) -> Result<String> {
        let (kind, body) = read_message(request)?;

        let read_filter = || {
            if body.trim().is_empty() {
                Ok(RecordFilter::new())
            } else {
                RecordFilter::read(body)
            }
        };

        trace!(kind = ?kind, "handling debug request");

        let mut response = String::new();
        write_header(&mut response, kind);

        match kind {
            MessageKind::RunningStats => {
                write_running_stats(&mut response, &self.running_stats());
            }
            MessageKind::ExitStats => self.write_exit_stats_body(&mut response),
            MessageKind::Records => {
                let filter = read_filter()?;
                write_record_stream(
                    &mut response,
                    &self.collect_live(|record| filter.matches(record)),
                );
            }
            MessageKind::SaveSnapshot => self.save_snapshot(),
            MessageKind::SnapshotDiff => {
                let filter = read_filter()?;
                write_record_stream(&mut response, &self.snapshot_diff(&filter));
            }
        }

        Ok(response)
    }

    /// Shuts the memory manager down, producing the configured exit statistics.
    ///
    /// The memory manager is terminated afterwards, even if writing the exit statistics fails.
    ///
    /// # Errors
    ///
    /// Fails if the exit statistics file cannot be written.
    ///
    /// # Panics
    ///
    /// Panics if the memory manager is already shutting down or terminated.
    pub fn shutdown(&self) -> Result<()> {
        let inner = self.inner.lock();

        let phase = inner.phase.get();
        assert!(
            matches!(phase, ManagerPhase::Uninitialized | ManagerPhase::Active),
            "memory manager shut down while {phase:?}"
        );

        inner.phase.set(ManagerPhase::ShuttingDown);
        let _terminate = scopeguard::guard((), |()| {
            inner.phase.set(ManagerPhase::Terminated);
        });

        debug!(
            live_count = self.live_count(),
            live_bytes = self.live_bytes(),
            "memory manager shutting down"
        );

        if self.config.print_exit_stats {
            self.print_memory_stats();
            self.allocated_report(self.config.print_internal_stats)
                .print_to_stdout();
        }

        if let Some(path) = &self.config.exit_stats_path {
            let mut contents = String::new();
            write_header(&mut contents, MessageKind::ExitStats);
            self.write_exit_stats_body(&mut contents);

            std::fs::write(path, contents).inspect_err(|error| {
                warn!(path = %path.display(), %error, "failed to write exit statistics");
            })?;
        }

        Ok(())
    }

    pub(crate) fn fill_pattern(&self) -> Option<u8> {
        self.config.fill_pattern
    }

    pub(crate) fn shred_pattern(&self) -> Option<u8> {
        self.config.shred_pattern
    }

    /// Runs `f` while holding the memory manager lock.
    pub(crate) fn locked<R>(&self, f: impl FnOnce() -> R) -> R {
        let _inner = self.inner.lock();
        f()
    }

    fn write_exit_stats_body(&self, out: &mut String) {
        write_running_stats(out, &self.running_stats());

        let everything = RecordFilter::new().include_internal(true);
        write_record_stream(out, &self.collect_live(|record| everything.matches(record)));
    }

    fn with_state<R>(&self, f: impl FnOnce(&State) -> R) -> R {
        let inner = self.inner.lock();
        inner.assert_usable();

        // Table iterators are boxed, so even reads may allocate.
        inner.guarded(|| {
            let state = inner.state.borrow();
            f(&state)
        })
    }

    fn collect_live(&self, predicate: impl Fn(&AllocationRecord) -> bool) -> Vec<AllocationRecord> {
        let inner = self.inner.lock();
        inner.assert_usable();

        inner.guarded(|| {
            let state = inner.state.borrow();
            let Some(table) = state.table.as_ref() else {
                return Vec::new();
            };

            let mut records = Vec::with_capacity(table.len());
            records.extend(table.records().filter(|record| predicate(*record)).copied());
            records.sort_unstable_by_key(AllocationRecord::id);
            records
        })
    }
}

impl fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();

        f.debug_struct("MemoryManager")
            .field("phase", &inner.phase.get())
            .field("depth", &inner.depth.get())
            .field("next_id", &inner.next_id.get())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn assert_usable(&self) {
        assert!(
            self.phase.get() != ManagerPhase::Terminated,
            "memory manager used after it was terminated"
        );
    }

    fn assert_active(&self) {
        let phase = self.phase.get();
        assert!(
            phase == ManagerPhase::Active,
            "allocation request reached the memory manager while it is {phase:?}"
        );
    }

    /// Runs `f` one recursion level deeper. Requests parked by nested calls are recorded
    /// by the outermost call before it returns.
    fn guarded<R>(&self, f: impl FnOnce() -> R) -> R {
        let depth = self
            .depth
            .get()
            .checked_add(1)
            .expect("memory manager recursion cannot be this deep");
        self.depth.set(depth);

        let _leave = scopeguard::guard((), |()| {
            self.depth.set(
                self.depth
                    .get()
                    .checked_sub(1)
                    .expect("every recursion level is entered before it is left"),
            );
        });

        let result = f();

        if depth == 1 {
            self.drain_pending();
        }

        result
    }

    fn is_nested(&self) -> bool {
        self.depth.get() > 1
    }

    /// Whether the record tables are borrowed further up the stack of this thread, in which
    /// case a request can only be parked.
    fn tables_busy(&self) -> bool {
        self.state.try_borrow_mut().is_err()
    }

    fn take_id(&self) -> u32 {
        let id = self.next_id.get();
        self.next_id.set(
            id.checked_add(1)
                .expect("allocation ids exhausted, the memory manager cannot continue"),
        );
        id
    }

    fn drain_pending(&self) {
        loop {
            // The queue must not stay borrowed while a request is recorded.
            let next = self.pending.borrow_mut().pop();
            let Some(request) = next else {
                break;
            };

            match request {
                PendingRequest::Allocation {
                    id,
                    address,
                    size,
                    site,
                    kind,
                } => {
                    self.record_allocation(AllocationRecord::new(
                        id, address, size, site, kind, true,
                    ));
                }
                PendingRequest::Deallocation {
                    address,
                    site,
                    kind,
                    only_if_seen,
                } => {
                    self.record_deallocation(address, site, kind, only_if_seen);
                }
            }

            let lost = self.pending.borrow_mut().take_unreported_lost();
            if lost > 0 {
                warn!(lost, "nested allocation requests overflowed the pending queue");
            }
        }
    }

    fn record_allocation(&self, record: AllocationRecord) {
        let prior = {
            let mut state = self.state.borrow_mut();
            let check_double_allocation = state.check_double_allocation;

            let Some(table) = state.table.as_mut() else {
                return;
            };

            table.insert(record, check_double_allocation)
        };

        if let Some(prior) = prior {
            self.dispatch(&Anomaly::MultipleAllocation { new: record, prior });
        }
    }

    fn record_deallocation(
        &self,
        address: Address,
        site: SourceLocation,
        kind: AllocationKind,
        only_if_seen: bool,
    ) -> bool {
        if only_if_seen && !self.state.borrow().has_seen(address) {
            return false;
        }

        let (handled, anomaly) = self.state.borrow_mut().deallocate(address, site, kind);

        if let Some(anomaly) = anomaly {
            self.dispatch(&anomaly);
        }

        handled
    }

    fn dispatch(&self, anomaly: &Anomaly) {
        trace!(kind = anomaly.name(), "dispatching anomaly");

        // A handler that itself triggers an anomaly cannot be called again.
        let Ok(mut handlers) = self.handlers.try_borrow_mut() else {
            warn!(kind = anomaly.name(), "{anomaly}");
            return;
        };

        for handler in handlers.iter_mut() {
            handler.handle(anomaly);
        }
    }
}

impl State {
    fn live_count(&self) -> usize {
        self.table.as_ref().map_or(0, |table| table.len())
    }

    fn retired_count(&self) -> usize {
        let retained = self.retired.as_ref().map_or(0, RetiredRecords::len);
        self.discarded_retired.saturating_add(retained)
    }

    fn has_seen(&self, address: Address) -> bool {
        self.table.as_ref().is_some_and(|table| table.contains(address))
            || self
                .retired
                .as_ref()
                .is_some_and(|retired| retired.find_most_recent(address).is_some())
    }

    fn discard_retired(&mut self, count: usize) {
        self.discarded_retired = self.discarded_retired.saturating_add(count);
    }

    fn deallocate(
        &mut self,
        address: Address,
        site: SourceLocation,
        kind: AllocationKind,
    ) -> (bool, Option<Anomaly>) {
        let Some(table) = self.table.as_mut() else {
            return (true, None);
        };

        if let Some(mut record) = table.remove(address) {
            record.set_deallocation_site(site, kind);

            let anomaly = match (record.allocation_kind(), kind) {
                (AllocationKind::Object, AllocationKind::Array) => {
                    Some(Anomaly::ObjectDeletedAsArray { record })
                }
                (AllocationKind::Array, AllocationKind::Object) => {
                    Some(Anomaly::ArrayDeletedAsObject { record })
                }
                _ => None,
            };

            match self.retired.as_mut() {
                Some(retired) => retired.insert(record),
                None => self.discard_retired(1),
            }

            return (true, anomaly);
        }

        let anomaly = match self
            .retired
            .as_ref()
            .and_then(|retired| retired.find_most_recent(address))
        {
            Some(prior) => Anomaly::MultipleDeletion { prior, site, kind },
            None => Anomaly::UnallocatedDeletion {
                address,
                site,
                kind,
            },
        };

        (false, Some(anomaly))
    }
}

/// While alive, every allocation recorded by the memory manager is flagged as memory manager
/// bookkeeping.
///
/// Created by [`MemoryManager::internal_scope()`].
#[derive(Debug)]
#[must_use = "the scope ends when this is dropped"]
pub struct InternalScope<'a> {
    manager: &'a MemoryManager,
}

impl Drop for InternalScope<'_> {
    fn drop(&mut self) {
        self.manager
            .internal_scopes
            .fetch_sub(1, atomic::Ordering::Relaxed);
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::{Arc, Mutex};

    use static_assertions::assert_impl_all;

    use super::*;
    use crate::MockAnomalyHandler;

    assert_impl_all!(MemoryManager: Send, Sync);

    const A: SourceLocation = SourceLocation::new("a.c", 10);
    const B: SourceLocation = SourceLocation::new("a.c", 20);

    fn recording_manager() -> (MemoryManager, Arc<Mutex<Vec<Anomaly>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        let manager = MemoryManager::builder()
            .handler(move |anomaly: &Anomaly| sink.lock().unwrap().push(*anomaly))
            .build();

        (manager, seen)
    }

    #[test]
    fn builder_produces_active_manager() {
        let manager = MemoryManager::builder().build();

        assert_eq!(manager.phase(), ManagerPhase::Active);
        assert!(manager.is_tracking_allocations());
        assert!(manager.is_tracking_deletions());
    }

    #[test]
    fn uninitialized_manager_activates() {
        let manager = MemoryManager::builder().build_uninitialized();
        assert_eq!(manager.phase(), ManagerPhase::Uninitialized);

        manager.activate();

        assert_eq!(manager.phase(), ManagerPhase::Active);
    }

    #[test]
    #[should_panic]
    fn allocation_before_activation_panics() {
        let manager = MemoryManager::builder().build_uninitialized();

        manager.on_alloc(Address::new(0x10), 1, A, AllocationKind::Object);
    }

    #[test]
    #[should_panic]
    fn double_activation_panics() {
        let manager = MemoryManager::builder().build();

        manager.activate();
    }

    #[test]
    fn ids_increase_in_allocation_order() {
        let manager = MemoryManager::builder().build();

        manager.on_alloc(Address::new(0x10), 1, A, AllocationKind::Object);
        manager.on_alloc(Address::new(0x20), 1, A, AllocationKind::Object);

        let first = manager.live_record(Address::new(0x10)).unwrap();
        let second = manager.live_record(Address::new(0x20)).unwrap();

        assert!(first.id() < second.id());
        assert_eq!(manager.memory_stats().allocation_count(), 2);
    }

    #[test]
    fn matched_pair_fires_nothing() {
        let mut handler = MockAnomalyHandler::new();
        handler.expect_handle().never();

        let manager = MemoryManager::builder().handler(handler).build();

        manager.on_alloc(Address::new(0x1000), 64, A, AllocationKind::Object);
        assert!(manager.on_dealloc(Address::new(0x1000), B, AllocationKind::Object));

        assert_eq!(manager.live_count(), 0);
        assert_eq!(manager.live_bytes(), 0);
        assert_eq!(manager.retired_count(), 1);
        assert_eq!(manager.total_count(), 1);
    }

    #[test]
    fn double_allocation_replaces_and_reports() {
        let (manager, seen) = recording_manager();

        manager.on_alloc(Address::new(0x10), 8, A, AllocationKind::Object);
        manager.on_alloc(Address::new(0x10), 16, B, AllocationKind::Object);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let Anomaly::MultipleAllocation { new, prior } = seen[0] else {
            panic!("unexpected anomaly {:?}", seen[0]);
        };
        assert_eq!(prior.size(), 8);
        assert_eq!(new.size(), 16);

        assert_eq!(manager.live_record(Address::new(0x10)).unwrap().size(), 16);
        assert_eq!(manager.live_bytes(), 16);
    }

    #[test]
    fn double_allocation_check_can_be_disabled() {
        let mut handler = MockAnomalyHandler::new();
        handler.expect_handle().never();

        let manager = MemoryManager::builder()
            .check_double_allocation(false)
            .handler(handler)
            .build();

        manager.on_alloc(Address::new(0x10), 8, A, AllocationKind::Object);
        manager.on_alloc(Address::new(0x10), 16, B, AllocationKind::Object);

        assert_eq!(manager.live_count(), 1);
    }

    #[test]
    fn without_deletion_records_double_free_is_unallocated() {
        let (manager, seen) = recording_manager();
        manager.cancel_deletion_tracking();

        manager.on_alloc(Address::new(0x10), 8, A, AllocationKind::Object);
        assert!(manager.on_dealloc(Address::new(0x10), B, AllocationKind::Object));
        assert!(!manager.on_dealloc(Address::new(0x10), B, AllocationKind::Object));

        let seen = seen.lock().unwrap();
        assert!(matches!(
            seen.as_slice(),
            [Anomaly::UnallocatedDeletion { .. }]
        ));
        assert_eq!(manager.retired_count(), 1);
    }

    #[test]
    fn cancelling_deletion_tracking_keeps_count() {
        let manager = MemoryManager::builder().build();

        for address in 1..=3_usize {
            manager.on_alloc(Address::new(address), 1, A, AllocationKind::Object);
            manager.on_dealloc(Address::new(address), B, AllocationKind::Object);
        }

        assert_eq!(manager.retired_count(), 3);

        manager.cancel_deletion_tracking();

        assert!(!manager.is_tracking_deletions());
        assert_eq!(manager.retired_count(), 3);
        assert!(manager.retired_record(Address::new(1)).is_none());
    }

    #[test]
    fn reenabled_deletion_tracking_starts_empty() {
        let (manager, seen) = recording_manager();

        manager.on_alloc(Address::new(0x10), 8, A, AllocationKind::Object);
        manager.on_dealloc(Address::new(0x10), B, AllocationKind::Object);

        manager.cancel_deletion_tracking();
        manager.enable_deletion_tracking();
        assert!(manager.is_tracking_deletions());

        // History from before the cancellation is gone.
        manager.on_dealloc(Address::new(0x10), B, AllocationKind::Object);

        assert!(matches!(
            seen.lock().unwrap().as_slice(),
            [Anomaly::UnallocatedDeletion { .. }]
        ));
    }

    #[test]
    fn cancelled_allocation_tracking_trusts_deallocations() {
        let (manager, seen) = recording_manager();

        manager.on_alloc(Address::new(0x10), 8, A, AllocationKind::Object);
        manager.cancel_allocation_tracking();

        assert!(!manager.is_tracking_allocations());
        assert_eq!(manager.live_count(), 0);

        manager.on_alloc(Address::new(0x20), 8, A, AllocationKind::Object);
        assert!(manager.on_dealloc(Address::new(0x999), B, AllocationKind::Object));

        assert_eq!(manager.live_count(), 0);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn allocations_not_recorded_when_disabled() {
        let manager = MemoryManager::builder().record_allocations(false).build();

        manager.on_alloc(Address::new(0x10), 8, A, AllocationKind::Object);

        assert_eq!(manager.live_count(), 0);
        assert!(manager.on_dealloc(Address::new(0x10), B, AllocationKind::Object));
        assert!(!manager.is_tracking_deletions());
    }

    #[test]
    fn null_deallocation_is_accepted() {
        let mut handler = MockAnomalyHandler::new();
        handler.expect_handle().never();

        let manager = MemoryManager::builder().handler(handler).build();

        assert!(manager.on_dealloc(Address::NULL, B, AllocationKind::Object));
    }

    #[test]
    fn internal_scope_flags_records() {
        let manager = MemoryManager::builder().build();

        {
            let _scope = manager.internal_scope();
            manager.on_alloc(Address::new(0x10), 8, A, AllocationKind::Object);
        }

        manager.on_alloc(Address::new(0x20), 8, A, AllocationKind::Object);

        assert!(manager.live_record(Address::new(0x10)).unwrap().is_manager_memory());
        assert!(!manager.live_record(Address::new(0x20)).unwrap().is_manager_memory());

        let stats = manager.memory_stats();
        assert_eq!(stats.internal_count(), 1);
        assert_eq!(stats.internal_bytes(), 8);

        let report = manager.allocated_report(false);
        assert_eq!(report.records().len(), 1);
        assert_eq!(report.records()[0].address(), Address::new(0x20));
        assert_eq!(manager.allocated_report(true).records().len(), 2);
    }

    #[test]
    fn enumerate_live_applies_filter_in_id_order() {
        let manager = MemoryManager::builder().build();

        manager.on_alloc(Address::new(0x30), 100, A, AllocationKind::Object);
        manager.on_alloc(Address::new(0x10), 5, A, AllocationKind::Object);
        manager.on_alloc(Address::new(0x20), 200, A, AllocationKind::Array);

        let mut visited = Vec::new();
        manager.enumerate_live(&RecordFilter::new().min_size(100), |record| {
            visited.push(record.address());
        });

        assert_eq!(visited, [Address::new(0x30), Address::new(0x20)]);
    }

    #[test]
    fn enumerate_live_visitor_may_use_manager() {
        let manager = MemoryManager::builder().build();
        manager.on_alloc(Address::new(0x10), 5, A, AllocationKind::Object);

        manager.enumerate_live(&RecordFilter::new(), |record| {
            assert!(manager.on_dealloc(record.address(), B, AllocationKind::Object));
        });

        assert_eq!(manager.live_count(), 0);
    }

    #[test]
    fn enumerate_retired_lists_freed_blocks() {
        let manager = MemoryManager::builder().build();

        manager.on_alloc(Address::new(0x10), 5, A, AllocationKind::Object);
        manager.on_dealloc(Address::new(0x10), B, AllocationKind::Object);

        let mut visited = Vec::new();
        manager.enumerate_retired(|record| visited.push(*record));

        assert_eq!(visited.len(), 1);
        assert_eq!(visited[0].deallocated_at(), Some(B));
    }

    #[test]
    fn mark_live_marks_matching_records() {
        let manager = MemoryManager::builder().build();

        manager.on_alloc(Address::new(0x10), 5, A, AllocationKind::Object);
        manager.on_alloc(Address::new(0x20), 50, A, AllocationKind::Object);

        let marked = manager.mark_live(&RecordFilter::new().min_size(10), 1);

        assert_eq!(marked, 1);
        assert_eq!(manager.live_record(Address::new(0x10)).unwrap().mark(), 0);
        assert_eq!(manager.live_record(Address::new(0x20)).unwrap().mark(), 1);
    }

    #[test]
    fn snapshot_diff_lists_new_live_blocks() {
        let manager = MemoryManager::builder().build();

        manager.on_alloc(Address::new(0x10), 5, A, AllocationKind::Object);
        manager.save_snapshot();
        manager.on_alloc(Address::new(0x20), 5, A, AllocationKind::Object);
        manager.on_alloc(Address::new(0x30), 5, A, AllocationKind::Object);
        manager.on_dealloc(Address::new(0x30), B, AllocationKind::Object);

        let diff = manager.snapshot_diff(&RecordFilter::new());

        assert_eq!(diff.len(), 1);
        assert_eq!(diff[0].address(), Address::new(0x20));
    }

    #[test]
    fn histogram_covers_live_blocks() {
        let manager = MemoryManager::builder().build();

        for (index, size) in [1_usize, 2, 3, 1000, 1 << 30].into_iter().enumerate() {
            manager.on_alloc(
                Address::new((index + 1) * 0x100),
                size,
                A,
                AllocationKind::Object,
            );
        }

        let histogram = manager.size_histogram();

        assert_eq!(histogram.total(), 5);
        assert_eq!(histogram, *manager.memory_stats().histogram());
    }

    #[test]
    fn handler_may_query_manager() {
        let manager = Arc::new(Mutex::new(None::<Arc<MemoryManager>>));
        let observed = Arc::new(Mutex::new(None));

        let manager_slot = Arc::clone(&manager);
        let observed_slot = Arc::clone(&observed);

        let built = Arc::new(
            MemoryManager::builder()
                .handler(move |_: &Anomaly| {
                    let manager = manager_slot.lock().unwrap().clone().unwrap();
                    *observed_slot.lock().unwrap() = Some(manager.live_count());
                })
                .build(),
        );
        *manager.lock().unwrap() = Some(Arc::clone(&built));

        built.on_alloc(Address::new(0x10), 8, A, AllocationKind::Object);
        built.on_dealloc(Address::new(0x99), B, AllocationKind::Object);

        assert_eq!(*observed.lock().unwrap(), Some(1));

        // Break the reference cycle.
        manager.lock().unwrap().take();
    }

    #[test]
    fn shutdown_terminates() {
        let manager = MemoryManager::builder().build();

        manager.shutdown().unwrap();

        assert_eq!(manager.phase(), ManagerPhase::Terminated);
    }

    #[test]
    #[should_panic]
    fn use_after_shutdown_panics() {
        let manager = MemoryManager::builder().build();
        manager.shutdown().unwrap();

        _ = manager.live_count();
    }

    #[test]
    fn debug_request_for_running_stats() {
        let manager = MemoryManager::builder().build();
        manager.on_alloc(Address::new(0x10), 8, A, AllocationKind::Object);

        let response = manager
            .handle_debug_request(&crate::request(MessageKind::RunningStats, None))
            .unwrap();

        let (kind, body) = read_message(&response).unwrap();
        assert_eq!(kind, MessageKind::RunningStats);

        let stats = crate::read_running_stats(body).unwrap();
        assert_eq!(stats.live_count(), 1);
        assert_eq!(stats.live_bytes(), 8);
    }

    #[test]
    fn malformed_debug_request_is_rejected() {
        let manager = MemoryManager::builder().build();

        assert!(manager.handle_debug_request("1 9").is_err());
        assert!(manager.handle_debug_request("7 0").is_err());
        assert!(manager.handle_debug_request("1 3 T x").is_err());
    }
}
