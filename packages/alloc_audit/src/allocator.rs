//! Global allocator that feeds every heap request of the process to a memory manager.

use std::alloc::{GlobalAlloc, Layout};
use std::cell::Cell;
use std::fmt;
use std::ptr;
use std::sync::atomic::{self, AtomicPtr};

use crate::{Address, AllocationKind, ManagerPhase, MemoryManager, SourceLocation};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum HookState {
    Idle,

    // Waiting for the memory manager lock. Anything allocated now (e.g. by the lock's parking
    // machinery) bypasses the memory manager.
    Acquiring,

    // This thread holds the memory manager lock and may call into it directly.
    Holding,
}

thread_local! {
    static HOOK_STATE: Cell<HookState> = const { Cell::new(HookState::Idle) };
}

/// A memory allocator that reports every allocation and deallocation to a [`MemoryManager`].
///
/// The allocator wraps any [`GlobalAlloc`] implementation and forwards all requests to it.
/// Until a memory manager is [attached][Self::attach], nothing is tracked.
///
/// Memory allocated by the memory manager for its own bookkeeping is recorded too, flagged as
/// such, so that it can be told apart from the memory of the program.
///
/// Blocks allocated before the memory manager was attached are unknown to it. Freeing them is
/// not reported as an anomaly.
///
/// # Examples
///
/// ```
/// use std::sync::LazyLock;
///
/// use alloc_audit::{Allocator, MemoryManager};
///
/// #[global_allocator]
/// static ALLOCATOR: Allocator<std::alloc::System> = Allocator::system();
///
/// static MANAGER: LazyLock<MemoryManager> =
///     LazyLock::new(|| MemoryManager::builder().build_uninitialized());
///
/// fn main() {
///     ALLOCATOR.attach(&MANAGER);
///
///     let data = vec![1_u64, 2, 3];
///     assert!(MANAGER.live_bytes() >= 24);
///
///     drop(data);
///     ALLOCATOR.detach();
/// }
/// ```
pub struct Allocator<A: GlobalAlloc> {
    inner: A,
    manager: AtomicPtr<MemoryManager>,
}

impl<A: GlobalAlloc> fmt::Debug for Allocator<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocator")
            .field("inner", &"<allocator>")
            .field(
                "attached",
                &!self.manager.load(atomic::Ordering::Relaxed).is_null(),
            )
            .finish()
    }
}

impl Allocator<std::alloc::System> {
    /// Creates a tracking allocator on top of the system allocator.
    #[must_use]
    #[inline]
    pub const fn system() -> Self {
        Self::new(std::alloc::System)
    }
}

impl<A: GlobalAlloc> Allocator<A> {
    /// Creates a tracking allocator on top of the provided allocator.
    #[must_use]
    #[inline]
    pub const fn new(allocator: A) -> Self {
        Self {
            inner: allocator,
            manager: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Starts reporting requests to the memory manager, activating it if necessary.
    ///
    /// The memory manager has to live for the rest of the process because blocks it tracks
    /// can be freed at any later point.
    pub fn attach(&self, manager: &'static MemoryManager) {
        manager.locked(|| {
            self.manager
                .store(ptr::from_ref(manager).cast_mut(), atomic::Ordering::Release);

            if manager.phase() == ManagerPhase::Uninitialized {
                manager.activate();
            }
        });
    }

    /// Stops reporting requests to the memory manager.
    pub fn detach(&self) {
        self.manager
            .store(ptr::null_mut(), atomic::Ordering::Release);
    }

    /// Runs `op` with the memory manager if requests are to be reported to it right now.
    ///
    /// While `op` runs with a memory manager, this thread holds the memory manager lock, so the
    /// inner allocation and its record cannot be separated by requests from other threads.
    fn hooked<R>(&self, op: impl FnOnce(Option<&MemoryManager>) -> R) -> R {
        let manager = self.manager.load(atomic::Ordering::Acquire);

        // SAFETY: Only `&'static MemoryManager` is ever stored, see `attach()`.
        let Some(manager) = (unsafe { manager.as_ref() }) else {
            return op(None);
        };

        // Thread-local storage is gone while the thread is being torn down.
        let Ok(state) = HOOK_STATE.try_with(Cell::get) else {
            return op(None);
        };

        match state {
            HookState::Acquiring => op(None),
            HookState::Holding => op(active(manager)),
            HookState::Idle => {
                HOOK_STATE.set(HookState::Acquiring);
                let _restore = scopeguard::guard((), |()| HOOK_STATE.set(HookState::Idle));

                manager.locked(|| {
                    HOOK_STATE.set(HookState::Holding);
                    op(active(manager))
                })
            }
        }
    }
}

fn active(manager: &MemoryManager) -> Option<&MemoryManager> {
    (manager.phase() == ManagerPhase::Active).then_some(manager)
}

fn track_alloc(manager: &MemoryManager, ptr: *mut u8, size: usize) {
    manager.on_alloc(
        Address::from_ptr(ptr),
        size.max(1),
        SourceLocation::UNKNOWN,
        AllocationKind::Object,
    );
}

// Returns whether the block was tracked. Blocks from before the memory manager was attached
// have never been seen and are left alone.
fn track_dealloc(manager: &MemoryManager, ptr: *mut u8) -> bool {
    manager.on_dealloc_if_seen(Address::from_ptr(ptr))
}

// SAFETY: We delegate all allocation operations to the underlying allocator,
// which already implements GlobalAlloc safely, while adding tracking functionality.
// Filling and shredding only ever write within the block being handed out or returned.
unsafe impl<A: GlobalAlloc> GlobalAlloc for Allocator<A> {
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.hooked(|manager| {
            // SAFETY: We forward the call to the underlying allocator which implements GlobalAlloc.
            let ptr = unsafe { self.inner.alloc(layout) };

            let Some(manager) = manager.filter(|_| !ptr.is_null()) else {
                return ptr;
            };

            track_alloc(manager, ptr, layout.size());

            if let Some(pattern) = manager.fill_pattern() {
                // SAFETY: The block was just allocated with this layout.
                unsafe { ptr.write_bytes(pattern, layout.size()) };
            }

            ptr
        })
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        self.hooked(|manager| {
            let shred_pattern = manager
                .filter(|manager| track_dealloc(manager, ptr))
                .and_then(MemoryManager::shred_pattern);

            if let Some(pattern) = shred_pattern {
                // SAFETY: The caller guarantees the block is allocated with this layout and
                // no longer in use.
                unsafe { ptr.write_bytes(pattern, layout.size()) };
            }

            // SAFETY: We forward the call to the underlying allocator which implements GlobalAlloc.
            unsafe { self.inner.dealloc(ptr, layout) };
        });
    }

    #[inline]
    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        self.hooked(|manager| {
            // SAFETY: We forward the call to the underlying allocator which implements GlobalAlloc.
            let ptr = unsafe { self.inner.alloc_zeroed(layout) };

            if let Some(manager) = manager.filter(|_| !ptr.is_null()) {
                track_alloc(manager, ptr, layout.size());
            }

            ptr
        })
    }

    #[inline]
    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        self.hooked(|manager| {
            // SAFETY: We forward the call to the underlying allocator which implements GlobalAlloc.
            let new_ptr = unsafe { self.inner.realloc(ptr, layout, new_size) };

            // On failure the old block stays allocated and nothing changes.
            let Some(manager) = manager.filter(|_| !new_ptr.is_null()) else {
                return new_ptr;
            };

            track_dealloc(manager, ptr);
            track_alloc(manager, new_ptr, new_size);

            let grown = new_size.saturating_sub(layout.size());
            if let Some(pattern) = manager.fill_pattern().filter(|_| grown > 0) {
                // SAFETY: The block is `new_size` bytes long, the first `layout.size()`
                // of which hold the preserved contents.
                unsafe { new_ptr.add(layout.size()).write_bytes(pattern, grown) };
            }

            new_ptr
        })
    }
}
