//! Allocation records and the small value types they are made of.

use std::fmt;
use std::panic::Location;

/// The raw address of a tracked memory block.
///
/// The address is only ever used as an identity key. It is never dereferenced.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Address(usize);

impl Address {
    /// The null address. No record can ever be created for it.
    pub const NULL: Self = Self(0);

    /// Creates an address from its integer value.
    #[must_use]
    #[inline]
    pub const fn new(value: usize) -> Self {
        Self(value)
    }

    /// Creates an address from any raw pointer, discarding provenance and metadata.
    #[must_use]
    #[inline]
    pub fn from_ptr<T: ?Sized>(ptr: *const T) -> Self {
        Self(ptr.cast::<()>().addr())
    }

    /// The integer value of the address.
    #[must_use]
    #[inline]
    pub const fn get(self) -> usize {
        self.0
    }

    /// Whether this is the null address.
    #[must_use]
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A location in the source code of the traced program.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct SourceLocation {
    file: &'static str,
    line: u32,
}

impl SourceLocation {
    /// Placeholder used when the interception layer cannot see the call site,
    /// which is always the case for requests arriving through the global allocator.
    pub const UNKNOWN: Self = Self {
        file: "<UNKNOWN>",
        line: 0,
    };

    /// Creates a source location from a file name and a line number.
    #[must_use]
    pub const fn new(file: &'static str, line: u32) -> Self {
        Self { file, line }
    }

    /// The location of the caller of the function that invokes this.
    ///
    /// Use from `#[track_caller]` functions to attribute allocations to the code that
    /// requested them rather than to the allocation helper itself.
    #[must_use]
    #[track_caller]
    pub fn caller() -> Self {
        let location = Location::caller();

        Self {
            file: location.file(),
            line: location.line(),
        }
    }

    /// The source file.
    #[must_use]
    pub const fn file(&self) -> &'static str {
        self.file
    }

    /// The line within the source file. Zero if unknown.
    #[must_use]
    pub const fn line(&self) -> u32 {
        self.line
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// Whether a block was allocated or freed as a single object or as an array.
#[expect(
    clippy::exhaustive_enums,
    reason = "a block is either one object or an array, nothing else"
)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum AllocationKind {
    /// A single object (`new` / `delete`).
    Object,

    /// An array of objects (`new[]` / `delete[]`).
    Array,
}

impl AllocationKind {
    /// Maps the "is array" flag used by C-style interception layers to a kind.
    #[must_use]
    pub const fn from_array_flag(is_array: bool) -> Self {
        if is_array { Self::Array } else { Self::Object }
    }

    /// Whether this is [`AllocationKind::Array`].
    #[must_use]
    pub const fn is_array(self) -> bool {
        matches!(self, Self::Array)
    }
}

impl fmt::Display for AllocationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Object => write!(f, "object"),
            Self::Array => write!(f, "array"),
        }
    }
}

/// Describes one allocation tracked by the memory manager.
///
/// Records are created when an allocation is intercepted and are mutated exactly once
/// afterwards, when the matching deallocation is intercepted. From then on they are either
/// retained as retired records or discarded.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AllocationRecord {
    id: u32,
    address: Address,
    size: usize,
    allocated_at: SourceLocation,
    allocation_kind: AllocationKind,
    deallocated_at: Option<SourceLocation>,
    deallocation_kind: Option<AllocationKind>,
    manager_memory: bool,
    mark: u8,
}

impl AllocationRecord {
    /// Creates a record for a freshly intercepted allocation.
    ///
    /// # Panics
    ///
    /// Panics if the address is null, the size is zero or the file name of the allocation
    /// site is empty. Any of these indicates a broken interception layer.
    #[must_use]
    pub fn new(
        id: u32,
        address: Address,
        size: usize,
        allocated_at: SourceLocation,
        allocation_kind: AllocationKind,
        manager_memory: bool,
    ) -> Self {
        assert!(!address.is_null(), "allocation record requires a non-null address");
        assert!(size != 0, "allocation record requires a non-zero size");
        assert!(
            !allocated_at.file().is_empty(),
            "allocation record requires a non-empty allocation file"
        );

        Self {
            id,
            address,
            size,
            allocated_at,
            allocation_kind,
            deallocated_at: None,
            deallocation_kind: None,
            manager_memory,
            mark: 0,
        }
    }

    /// Sequence number assigned when the allocation was intercepted.
    #[must_use]
    pub const fn id(&self) -> u32 {
        self.id
    }

    /// Address of the block.
    #[must_use]
    pub const fn address(&self) -> Address {
        self.address
    }

    /// Size of the block in bytes.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Where the block was allocated.
    #[must_use]
    pub const fn allocated_at(&self) -> SourceLocation {
        self.allocated_at
    }

    /// How the block was allocated.
    #[must_use]
    pub const fn allocation_kind(&self) -> AllocationKind {
        self.allocation_kind
    }

    /// Where the block was freed, if it has been.
    #[must_use]
    pub const fn deallocated_at(&self) -> Option<SourceLocation> {
        self.deallocated_at
    }

    /// How the block was freed, if it has been.
    #[must_use]
    pub const fn deallocation_kind(&self) -> Option<AllocationKind> {
        self.deallocation_kind
    }

    /// Whether the block has a deallocation site recorded.
    #[must_use]
    pub const fn is_deleted(&self) -> bool {
        self.deallocated_at.is_some()
    }

    /// Whether the block is bookkeeping memory of the memory manager itself.
    #[must_use]
    pub const fn is_manager_memory(&self) -> bool {
        self.manager_memory
    }

    /// Scratch value for report generators. Zero for new records.
    #[must_use]
    pub const fn mark(&self) -> u8 {
        self.mark
    }

    /// Sets the scratch value for report generators.
    pub fn set_mark(&mut self, mark: u8) {
        self.mark = mark;
    }

    /// Records where and how the block was freed.
    ///
    /// # Panics
    ///
    /// Panics if the deallocation site was already set or if its file name is empty.
    pub(crate) fn set_deallocation_site(&mut self, site: SourceLocation, kind: AllocationKind) {
        assert!(
            self.deallocated_at.is_none(),
            "deallocation site of block {} (id {}) set twice",
            self.address,
            self.id
        );
        assert!(
            !site.file().is_empty(),
            "deallocation site requires a non-empty file"
        );

        self.deallocated_at = Some(site);
        self.deallocation_kind = Some(kind);
    }
}
