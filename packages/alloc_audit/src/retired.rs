use hash_hasher::HashedMap;
use smallvec::SmallVec;

use crate::{Address, AllocationRecord};

/// Records of freed blocks, kept to explain later deallocations of the same address.
///
/// An address can be freed, reused and freed again many times during a run, so each address
/// maps to every record freed there, in the order they were freed.
#[derive(Debug, Default)]
pub struct RetiredRecords {
    records: HashedMap<usize, SmallVec<[AllocationRecord; 1]>>,

    len: usize,
}

impl RetiredRecords {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a freed record.
    pub fn insert(&mut self, record: AllocationRecord) {
        self.records
            .entry(record.address().get())
            .or_default()
            .push(record);

        self.len = self
            .len
            .checked_add(1)
            .expect("retired record count cannot exceed the address space");
    }

    /// Returns the record with the highest id among those freed at `address`.
    #[must_use]
    pub fn find_most_recent(&self, address: Address) -> Option<AllocationRecord> {
        self.records
            .get(&address.get())?
            .iter()
            .max_by_key(|record| record.id())
            .copied()
    }

    /// Number of retired records across all addresses.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether no records are retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Iterates over all retired records in unspecified order.
    pub fn records(&self) -> impl Iterator<Item = &AllocationRecord> {
        self.records.values().flatten()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::{AllocationKind, SourceLocation};

    fn retired(id: u32, address: usize) -> AllocationRecord {
        let mut record = AllocationRecord::new(
            id,
            Address::new(address),
            16,
            SourceLocation::new("retired.rs", 1),
            AllocationKind::Object,
            false,
        );
        record.set_deallocation_site(SourceLocation::new("retired.rs", 2), AllocationKind::Object);
        record
    }

    #[test]
    fn empty_store_finds_nothing() {
        let store = RetiredRecords::new();

        assert!(store.is_empty());
        assert!(store.find_most_recent(Address::new(0x10)).is_none());
    }

    #[test]
    fn keeps_every_record_per_address() {
        let mut store = RetiredRecords::new();

        store.insert(retired(1, 0x10));
        store.insert(retired(5, 0x10));
        store.insert(retired(3, 0x20));

        assert_eq!(store.len(), 3);
        assert_eq!(store.records().count(), 3);
    }

    #[test]
    fn most_recent_is_highest_id() {
        let mut store = RetiredRecords::new();

        store.insert(retired(9, 0x10));
        store.insert(retired(2, 0x10));
        store.insert(retired(4, 0x10));

        assert_eq!(store.find_most_recent(Address::new(0x10)).unwrap().id(), 9);
    }
}
