use std::fmt;

use tracing::warn;

use crate::{Address, AllocationKind, AllocationRecord, SourceLocation};

/// A misuse of memory detected by a [`MemoryManager`][crate::MemoryManager].
///
/// Anomalies are diagnostics. The memory manager keeps operating after reporting one.
#[expect(
    clippy::exhaustive_enums,
    reason = "handlers are expected to match every kind of anomaly"
)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Anomaly {
    /// A block was allocated at an address that already had a live block.
    ///
    /// The new record replaces the prior one in the live table.
    MultipleAllocation {
        /// The record of the new allocation.
        new: AllocationRecord,

        /// The record that was live at the same address.
        prior: AllocationRecord,
    },

    /// A block was freed again after it had already been freed.
    MultipleDeletion {
        /// The most recent retired record at the freed address.
        prior: AllocationRecord,

        /// Where the repeated deallocation happened.
        site: SourceLocation,

        /// How the repeated deallocation freed the block.
        kind: AllocationKind,
    },

    /// An address was freed that has no tracked allocation history.
    UnallocatedDeletion {
        /// The freed address.
        address: Address,

        /// Where the deallocation happened.
        site: SourceLocation,

        /// How the deallocation freed the block.
        kind: AllocationKind,
    },

    /// A block allocated as a single object was freed as an array.
    ObjectDeletedAsArray {
        /// The record of the block, with its deallocation site already set.
        record: AllocationRecord,
    },

    /// A block allocated as an array was freed as a single object.
    ArrayDeletedAsObject {
        /// The record of the block, with its deallocation site already set.
        record: AllocationRecord,
    },
}

impl Anomaly {
    /// A short name for the kind of anomaly, usable as a structured log field.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::MultipleAllocation { .. } => "multiple_allocation",
            Self::MultipleDeletion { .. } => "multiple_deletion",
            Self::UnallocatedDeletion { .. } => "unallocated_deletion",
            Self::ObjectDeletedAsArray { .. } => "object_deleted_as_array",
            Self::ArrayDeletedAsObject { .. } => "array_deleted_as_object",
        }
    }
}

impl fmt::Display for Anomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MultipleAllocation { new, prior } => write!(
                f,
                "block at {} allocated at {} while still live from allocation {} at {}",
                new.address(),
                new.allocated_at(),
                prior.id(),
                prior.allocated_at()
            ),
            Self::MultipleDeletion { prior, site, kind } => write!(
                f,
                "block at {} freed as {kind} at {site} after it was already freed at {}",
                prior.address(),
                prior
                    .deallocated_at()
                    .unwrap_or(SourceLocation::UNKNOWN)
            ),
            Self::UnallocatedDeletion {
                address,
                site,
                kind,
            } => write!(
                f,
                "block at {address} freed as {kind} at {site} was never allocated"
            ),
            Self::ObjectDeletedAsArray { record } => write!(
                f,
                "object of {} bytes allocated at {} freed as an array at {}",
                record.size(),
                record.allocated_at(),
                record
                    .deallocated_at()
                    .unwrap_or(SourceLocation::UNKNOWN)
            ),
            Self::ArrayDeletedAsObject { record } => write!(
                f,
                "array of {} bytes allocated at {} freed as an object at {}",
                record.size(),
                record.allocated_at(),
                record
                    .deallocated_at()
                    .unwrap_or(SourceLocation::UNKNOWN)
            ),
        }
    }
}

/// Receives the anomalies detected by a [`MemoryManager`][crate::MemoryManager].
///
/// Handlers are called without any table state borrowed, so they may allocate and may query
/// the memory manager that called them.
///
/// Any `FnMut(&Anomaly) + Send` closure is a handler.
#[cfg_attr(test, mockall::automock)]
pub trait AnomalyHandler: Send {
    /// Called once for every detected anomaly.
    fn handle(&mut self, anomaly: &Anomaly);
}

impl<F> AnomalyHandler for F
where
    F: FnMut(&Anomaly) + Send,
{
    fn handle(&mut self, anomaly: &Anomaly) {
        self(anomaly);
    }
}

/// Emits every anomaly as a `tracing` warning.
#[derive(Clone, Copy, Debug, Default)]
#[non_exhaustive]
pub struct LogAnomalies;

impl AnomalyHandler for LogAnomalies {
    #[cfg_attr(test, mutants::skip)] // Only emits log events.
    fn handle(&mut self, anomaly: &Anomaly) {
        warn!(kind = anomaly.name(), "{anomaly}");
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    fn record(kind: AllocationKind) -> AllocationRecord {
        AllocationRecord::new(
            4,
            Address::new(0x40),
            12,
            SourceLocation::new("x.rs", 3),
            kind,
            false,
        )
    }

    #[test]
    fn closures_are_handlers() {
        let mut seen = Vec::new();

        {
            let mut handler = |anomaly: &Anomaly| seen.push(anomaly.name());
            handler.handle(&Anomaly::UnallocatedDeletion {
                address: Address::new(0x2000),
                site: SourceLocation::new("b.rs", 5),
                kind: AllocationKind::Object,
            });
        }

        assert_eq!(seen, ["unallocated_deletion"]);
    }

    #[test]
    fn mock_handler_receives_anomaly() {
        let mut handler = MockAnomalyHandler::new();
        handler
            .expect_handle()
            .withf(|anomaly| matches!(anomaly, Anomaly::ObjectDeletedAsArray { .. }))
            .times(1)
            .return_const(());

        handler.handle(&Anomaly::ObjectDeletedAsArray {
            record: record(AllocationKind::Object),
        });
    }

    #[test]
    fn display_mentions_sites() {
        let mut freed = record(AllocationKind::Array);
        freed.set_deallocation_site(SourceLocation::new("y.rs", 9), AllocationKind::Object);

        let message = Anomaly::ArrayDeletedAsObject { record: freed }.to_string();

        assert!(message.contains("x.rs:3"));
        assert!(message.contains("y.rs:9"));

        let message = Anomaly::MultipleDeletion {
            prior: freed,
            site: SourceLocation::new("z.rs", 1),
            kind: AllocationKind::Array,
        }
        .to_string();

        assert!(message.contains("z.rs:1"));
        assert!(message.contains("0x40"));
    }

    #[test]
    fn log_handler_does_not_panic_without_subscriber() {
        LogAnomalies.handle(&Anomaly::MultipleAllocation {
            new: record(AllocationKind::Object),
            prior: record(AllocationKind::Object),
        });
    }
}
