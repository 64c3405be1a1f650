use hash_hasher::HashedMap;
use tracing::trace;

use crate::{Address, AllocationRecord, RecordTable};

/// Number of records a [`HashRecordTable`] makes room for when its memory manager activates.
///
/// Tracked workloads are large from the first moment, so starting small only means paying
/// for a series of rehashes during start-up.
pub const DEFAULT_TABLE_CAPACITY: usize = 4096;

/// A [`RecordTable`] backed by a hash map keyed by the raw block address.
///
/// Addresses from a general-purpose allocator are well distributed, so they are fed to the
/// map without any hash mixing. Insert, lookup and removal are amortized O(1).
///
/// Creating the table does not allocate. Storage is allocated on the first insert or on an
/// explicit [`reserve()`][RecordTable::reserve].
#[derive(Debug, Default)]
pub struct HashRecordTable {
    records: HashedMap<usize, AllocationRecord>,

    total_bytes: usize,
}

impl HashRecordTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records the table can hold without growing its storage.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.records.capacity()
    }
}

impl RecordTable for HashRecordTable {
    fn insert(
        &mut self,
        record: AllocationRecord,
        check_double_allocation: bool,
    ) -> Option<AllocationRecord> {
        let capacity_before = self.records.capacity();
        let previous = self.records.insert(record.address().get(), record);

        if self.records.capacity() != capacity_before {
            trace!(
                capacity = self.records.capacity(),
                live = self.records.len(),
                "record table grew"
            );
        }

        // The replaced block leaves the total before the new one enters it.
        if let Some(previous) = &previous {
            self.total_bytes = self
                .total_bytes
                .checked_sub(previous.size())
                .expect("tracked byte total includes every live record");
        }

        self.total_bytes = self
            .total_bytes
            .checked_add(record.size())
            .expect("tracked byte total cannot exceed the address space");

        previous.filter(|_| check_double_allocation)
    }

    fn remove(&mut self, address: Address) -> Option<AllocationRecord> {
        let record = self.records.remove(&address.get())?;

        self.total_bytes = self
            .total_bytes
            .checked_sub(record.size())
            .expect("tracked byte total includes every live record");

        Some(record)
    }

    fn get(&self, address: Address) -> Option<AllocationRecord> {
        self.records.get(&address.get()).copied()
    }

    fn contains(&self, address: Address) -> bool {
        self.records.contains_key(&address.get())
    }

    fn len(&self) -> usize {
        self.records.len()
    }

    fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    fn records(&self) -> Box<dyn Iterator<Item = &AllocationRecord> + '_> {
        Box::new(self.records.values())
    }

    fn for_each_mut(&mut self, visit: &mut dyn FnMut(&mut AllocationRecord)) {
        self.records.values_mut().for_each(visit);
    }

    fn reserve(&mut self, additional: usize) {
        self.records.reserve(additional);
    }
}
