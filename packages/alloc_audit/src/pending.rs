use heapless::Deque;

use crate::{Address, AllocationKind, SourceLocation};

/// How many nested requests can wait for the outermost memory manager call to finish.
///
/// A table growth is one allocation and one deallocation. Reports growing their buffers add a
/// few dozen more, so this leaves ample room.
pub(crate) const PENDING_CAPACITY: usize = 256;

/// A request that arrived while the memory manager was already busy on the same thread.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum PendingRequest {
    Allocation {
        id: u32,
        address: Address,
        size: usize,
        site: SourceLocation,
        kind: AllocationKind,
    },
    Deallocation {
        address: Address,
        site: SourceLocation,
        kind: AllocationKind,
        only_if_seen: bool,
    },
}

/// Nested requests in arrival order, kept in fixed storage so that parking a request never
/// allocates.
#[derive(Debug)]
pub(crate) struct PendingRequests {
    queue: Deque<PendingRequest, PENDING_CAPACITY>,

    // Requests that did not fit into the queue and were never recorded.
    lost: u64,

    // Lost requests that have not been reported in a log event yet.
    unreported_lost: u64,
}

impl PendingRequests {
    pub(crate) const fn new() -> Self {
        Self {
            queue: Deque::new(),
            lost: 0,
            unreported_lost: 0,
        }
    }

    pub(crate) fn push(&mut self, request: PendingRequest) {
        if self.queue.push_back(request).is_err() {
            self.lost = self.lost.saturating_add(1);
            self.unreported_lost = self.unreported_lost.saturating_add(1);
        }
    }

    pub(crate) fn pop(&mut self) -> Option<PendingRequest> {
        self.queue.pop_front()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    pub(crate) const fn lost(&self) -> u64 {
        self.lost
    }

    /// Returns the number of requests lost since the previous call.
    pub(crate) fn take_unreported_lost(&mut self) -> u64 {
        std::mem::take(&mut self.unreported_lost)
    }
}
