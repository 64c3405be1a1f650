use std::fmt::Debug;

use crate::{Address, AllocationRecord, SizeHistogram};

/// Storage for the live allocation records of a [`MemoryManager`][crate::MemoryManager],
/// keyed by block address.
///
/// The memory manager is the only component that mutates a table. Implementations may
/// allocate while being mutated; the memory manager takes care that such allocations do not
/// re-enter the same table call.
///
/// Implementations must maintain [`len()`][Self::len] and [`total_bytes()`][Self::total_bytes]
/// incrementally. Both are called on hot paths and must not scan the table.
pub trait RecordTable: Debug + Send {
    /// Inserts a record keyed by its address.
    ///
    /// If a record is already live at the same address, it is replaced by the new record.
    /// When `check_double_allocation` is set, the replaced record is returned so that the
    /// caller can report the anomaly. Otherwise the return value is always `None`.
    fn insert(
        &mut self,
        record: AllocationRecord,
        check_double_allocation: bool,
    ) -> Option<AllocationRecord>;

    /// Removes and returns the live record at `address`, if there is one.
    fn remove(&mut self, address: Address) -> Option<AllocationRecord>;

    /// Returns a copy of the live record at `address`, if there is one.
    fn get(&self, address: Address) -> Option<AllocationRecord>;

    /// Whether a live record exists at `address`.
    fn contains(&self, address: Address) -> bool {
        self.get(address).is_some()
    }

    /// Number of live records.
    fn len(&self) -> usize;

    /// Whether the table has no live records.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum of the sizes of all live records.
    fn total_bytes(&self) -> usize;

    /// Iterates over all live records in unspecified order.
    fn records(&self) -> Box<dyn Iterator<Item = &AllocationRecord> + '_>;

    /// Visits every live record with mutable access to its report mark.
    fn for_each_mut(&mut self, visit: &mut dyn FnMut(&mut AllocationRecord));

    /// Ensures room for at least `additional` more records without growing storage.
    fn reserve(&mut self, additional: usize);

    /// Counts the live records per size bucket.
    fn size_histogram(&self) -> SizeHistogram {
        let mut histogram = SizeHistogram::new();

        for record in self.records() {
            histogram.add(record.size());
        }

        histogram
    }
}

/// Selects the built-in [`RecordTable`] implementation that a memory manager creates.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum TableKind {
    /// A [`HashRecordTable`][crate::HashRecordTable]. Use this unless debugging the tables.
    #[default]
    Hash,

    /// An [`ArrayRecordTable`][crate::ArrayRecordTable] with linear lookup.
    Array,
}

impl TableKind {
    /// Creates an empty table of this kind.
    #[must_use]
    pub fn create(self) -> Box<dyn RecordTable> {
        match self {
            Self::Hash => Box::new(crate::HashRecordTable::new()),
            Self::Array => Box::new(crate::ArrayRecordTable::new()),
        }
    }
}
