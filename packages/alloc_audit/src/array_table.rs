use crate::{Address, AllocationRecord, RecordTable};

/// A [`RecordTable`] that keeps records in a plain vector with linear lookup.
///
/// This is only useful for debugging the record tables themselves, as every lookup scans the
/// whole table. Prefer [`HashRecordTable`][crate::HashRecordTable].
#[derive(Debug, Default)]
pub struct ArrayRecordTable {
    records: Vec<AllocationRecord>,

    total_bytes: usize,
}

impl ArrayRecordTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, address: Address) -> Option<usize> {
        self.records
            .iter()
            .position(|record| record.address() == address)
    }
}

impl RecordTable for ArrayRecordTable {
    fn insert(
        &mut self,
        record: AllocationRecord,
        check_double_allocation: bool,
    ) -> Option<AllocationRecord> {
        let previous = self.remove(record.address());

        self.total_bytes = self
            .total_bytes
            .checked_add(record.size())
            .expect("tracked byte total cannot exceed the address space");
        self.records.push(record);

        previous.filter(|_| check_double_allocation)
    }

    fn remove(&mut self, address: Address) -> Option<AllocationRecord> {
        let index = self.position(address)?;
        let record = self.records.swap_remove(index);

        self.total_bytes = self
            .total_bytes
            .checked_sub(record.size())
            .expect("tracked byte total includes every live record");

        Some(record)
    }

    fn get(&self, address: Address) -> Option<AllocationRecord> {
        self.records
            .iter()
            .find(|record| record.address() == address)
            .copied()
    }

    fn len(&self) -> usize {
        self.records.len()
    }

    fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    fn records(&self) -> Box<dyn Iterator<Item = &AllocationRecord> + '_> {
        Box::new(self.records.iter())
    }

    fn for_each_mut(&mut self, visit: &mut dyn FnMut(&mut AllocationRecord)) {
        self.records.iter_mut().for_each(visit);
    }

    fn reserve(&mut self, additional: usize) {
        self.records.reserve(additional);
    }
}
