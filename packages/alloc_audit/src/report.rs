//! Human-readable memory manager reports.

use std::fmt;

use crate::{AllocationRecord, SizeHistogram};

/// Point-in-time statistics of a [`MemoryManager`][crate::MemoryManager].
///
/// # Examples
///
/// ```
/// use alloc_audit::{Address, AllocationKind, MemoryManager, SourceLocation};
///
/// let manager = MemoryManager::builder().build();
/// manager.on_alloc(
///     Address::new(0x1000),
///     64,
///     SourceLocation::caller(),
///     AllocationKind::Object,
/// );
///
/// let stats = manager.memory_stats();
/// assert_eq!(stats.live_count(), 1);
/// assert_eq!(stats.live_bytes(), 64);
/// ```
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MemoryStats {
    live_count: usize,
    live_bytes: usize,
    internal_count: usize,
    internal_bytes: usize,
    retired_count: usize,
    allocation_count: u64,
    lost_requests: u64,
    histogram: SizeHistogram,
}

impl MemoryStats {
    #[expect(clippy::too_many_arguments, reason = "private constructor of a plain data type")]
    pub(crate) const fn new(
        live_count: usize,
        live_bytes: usize,
        internal_count: usize,
        internal_bytes: usize,
        retired_count: usize,
        allocation_count: u64,
        lost_requests: u64,
        histogram: SizeHistogram,
    ) -> Self {
        Self {
            live_count,
            live_bytes,
            internal_count,
            internal_bytes,
            retired_count,
            allocation_count,
            lost_requests,
            histogram,
        }
    }

    /// Number of live blocks, including memory manager bookkeeping.
    #[must_use]
    pub const fn live_count(&self) -> usize {
        self.live_count
    }

    /// Total size of the live blocks, including memory manager bookkeeping.
    #[must_use]
    pub const fn live_bytes(&self) -> usize {
        self.live_bytes
    }

    /// Number of live blocks that are memory manager bookkeeping.
    #[must_use]
    pub const fn internal_count(&self) -> usize {
        self.internal_count
    }

    /// Total size of the live blocks that are memory manager bookkeeping.
    #[must_use]
    pub const fn internal_bytes(&self) -> usize {
        self.internal_bytes
    }

    /// Number of freed blocks, whether their records are retained or only counted.
    #[must_use]
    pub const fn retired_count(&self) -> usize {
        self.retired_count
    }

    /// Number of live and freed blocks.
    #[must_use]
    pub const fn total_count(&self) -> usize {
        self.live_count.saturating_add(self.retired_count)
    }

    /// Number of allocation ids handed out so far.
    #[must_use]
    pub const fn allocation_count(&self) -> u64 {
        self.allocation_count
    }

    /// Number of nested requests that could not be recorded.
    ///
    /// A non-zero value means that some records are missing or stale, which can lead to
    /// spurious anomaly reports.
    #[must_use]
    pub const fn lost_requests(&self) -> u64 {
        self.lost_requests
    }

    /// Size histogram of the live blocks.
    #[must_use]
    pub const fn histogram(&self) -> &SizeHistogram {
        &self.histogram
    }

    /// Prints the statistics to stdout.
    #[cfg_attr(test, mutants::skip)] // Only prints to stdout.
    pub fn print_to_stdout(&self) {
        println!("{self}");
    }
}

impl fmt::Display for MemoryStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Live blocks: {} ({} bytes)",
            self.live_count, self.live_bytes
        )?;
        writeln!(
            f,
            "  of which memory manager: {} ({} bytes)",
            self.internal_count, self.internal_bytes
        )?;
        writeln!(f, "Freed blocks: {}", self.retired_count)?;
        writeln!(f, "Allocations: {}", self.allocation_count)?;

        if self.lost_requests > 0 {
            writeln!(f, "Unrecorded nested requests: {}", self.lost_requests)?;
        }

        if self.histogram.total() > 0 {
            writeln!(f, "Live block sizes:")?;
            write!(f, "{}", self.histogram)?;
        }

        Ok(())
    }
}

/// The live blocks of a [`MemoryManager`][crate::MemoryManager], ordered by allocation id.
///
/// Used as a leak report: blocks still live at the end of a run were never freed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AllocatedReport {
    records: Vec<AllocationRecord>,
    total_bytes: usize,
}

impl AllocatedReport {
    pub(crate) fn new(records: Vec<AllocationRecord>) -> Self {
        let total_bytes = records
            .iter()
            .map(AllocationRecord::size)
            .fold(0_usize, usize::saturating_add);

        Self {
            records,
            total_bytes,
        }
    }

    /// The reported blocks, ordered by allocation id.
    #[must_use]
    pub fn records(&self) -> &[AllocationRecord] {
        &self.records
    }

    /// Total size of the reported blocks.
    #[must_use]
    pub const fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Whether the report contains no blocks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Prints the report to stdout.
    #[cfg_attr(test, mutants::skip)] // Only prints to stdout.
    pub fn print_to_stdout(&self) {
        println!("{self}");
    }
}

impl fmt::Display for AllocatedReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for record in &self.records {
            writeln!(
                f,
                "#{} {} {} bytes {} allocated at {}",
                record.id(),
                record.address(),
                record.size(),
                record.allocation_kind(),
                record.allocated_at()
            )?;

            match record.deallocated_at() {
                None => writeln!(f, "    verified: not freed")?,
                Some(site) => writeln!(f, "    INCONSISTENT: live block was freed at {site}")?,
            }
        }

        writeln!(
            f,
            "Total: {} blocks, {} bytes",
            self.records.len(),
            self.total_bytes
        )
    }
}
