use std::fmt;
use std::path::PathBuf;

use tracing::warn;

use crate::{
    AnomalyHandler, DEFAULT_TABLE_CAPACITY, LogAnomalies, MemoryManager, RecordTable, TableKind,
};

/// Fill pattern written into new blocks when filling is enabled without an explicit value.
pub const DEFAULT_FILL_PATTERN: u8 = 0xA7;

/// Fill pattern written into freed blocks when shredding is enabled without an explicit value.
pub const DEFAULT_SHRED_PATTERN: u8 = 0xD7;

const ENV_PREFIX: &str = "ALLOC_AUDIT_";

/// Settings that stay fixed for the lifetime of a memory manager.
#[derive(Clone, Debug)]
pub(crate) struct ManagerConfig {
    pub(crate) record_deallocations: bool,
    pub(crate) check_double_allocation: bool,
    pub(crate) initial_capacity: usize,
    pub(crate) fill_pattern: Option<u8>,
    pub(crate) shred_pattern: Option<u8>,
    pub(crate) print_exit_stats: bool,
    pub(crate) print_internal_stats: bool,
    pub(crate) exit_stats_path: Option<PathBuf>,
}

/// Creates instances of [`MemoryManager`].
///
/// Use `MemoryManager::builder()` to create a new instance of this builder, or
/// [`ManagerBuilder::from_env()`] to start from settings in environment variables.
///
/// By default, the memory manager records allocations and deallocations, checks for double
/// allocation, keeps its records in a [`HashRecordTable`][crate::HashRecordTable] and reports
/// anomalies to nobody.
pub struct ManagerBuilder {
    record_allocations: bool,
    record_deallocations: bool,
    check_double_allocation: bool,
    table_kind: TableKind,
    table: Option<Box<dyn RecordTable>>,
    initial_capacity: usize,
    handlers: Vec<Box<dyn AnomalyHandler>>,
    log_anomalies: bool,
    fill_pattern: Option<u8>,
    shred_pattern: Option<u8>,
    print_exit_stats: bool,
    print_internal_stats: bool,
    exit_stats_path: Option<PathBuf>,
}

impl fmt::Debug for ManagerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagerBuilder")
            .field("record_allocations", &self.record_allocations)
            .field("record_deallocations", &self.record_deallocations)
            .field("check_double_allocation", &self.check_double_allocation)
            .field("table_kind", &self.table_kind)
            .field("table", &self.table)
            .field("initial_capacity", &self.initial_capacity)
            .field("handlers", &self.handlers.len())
            .field("log_anomalies", &self.log_anomalies)
            .field("fill_pattern", &self.fill_pattern)
            .field("shred_pattern", &self.shred_pattern)
            .field("print_exit_stats", &self.print_exit_stats)
            .field("print_internal_stats", &self.print_internal_stats)
            .field("exit_stats_path", &self.exit_stats_path)
            .finish()
    }
}

impl ManagerBuilder {
    pub(crate) fn new() -> Self {
        Self {
            record_allocations: true,
            record_deallocations: true,
            check_double_allocation: true,
            table_kind: TableKind::default(),
            table: None,
            initial_capacity: DEFAULT_TABLE_CAPACITY,
            handlers: Vec::new(),
            log_anomalies: false,
            fill_pattern: None,
            shred_pattern: None,
            print_exit_stats: false,
            print_internal_stats: false,
            exit_stats_path: None,
        }
    }

    /// Creates a builder configured from `ALLOC_AUDIT_*` environment variables.
    ///
    /// | Variable | Meaning |
    /// |----------|---------|
    /// | `ALLOC_AUDIT_RECORD_ALLOCATED` | [`record_allocations()`][Self::record_allocations] |
    /// | `ALLOC_AUDIT_RECORD_DEALLOCATED` | [`record_deallocations()`][Self::record_deallocations] |
    /// | `ALLOC_AUDIT_CHECK_DOUBLE_ALLOCATION` | [`check_double_allocation()`][Self::check_double_allocation] |
    /// | `ALLOC_AUDIT_TABLE_TYPE` | `hashtable` or `array`, see [`table_kind()`][Self::table_kind] |
    /// | `ALLOC_AUDIT_LOG_ERRORS` | [`log_anomalies()`][Self::log_anomalies], on unless set to a false value |
    /// | `ALLOC_AUDIT_INITIALIZE` | [`fill_new_blocks()`][Self::fill_new_blocks] |
    /// | `ALLOC_AUDIT_SHRED` | [`shred_deleted_blocks()`][Self::shred_deleted_blocks] |
    /// | `ALLOC_AUDIT_PRINT_EXIT_STATS` | [`print_exit_stats()`][Self::print_exit_stats] |
    /// | `ALLOC_AUDIT_PRINT_INTERNAL_STATS` | [`print_internal_stats()`][Self::print_internal_stats] |
    /// | `ALLOC_AUDIT_EXIT_STATS_FILE` | [`exit_stats_path()`][Self::exit_stats_path] |
    ///
    /// Flags are on for `yes`, `true` or `1` and off for `no`, `false` or `0`, ignoring case.
    /// Fill patterns are off for `no`, use the default pattern when empty and otherwise take
    /// a decimal or `0x`-prefixed hexadecimal byte. Unrecognized values are logged and fall
    /// back to the default.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |suffix: &str| {
            let name = format!("{ENV_PREFIX}{suffix}");
            lookup(&name).map(|value| (name, value))
        };

        let flag = |suffix: &str, default: bool| {
            var(suffix).map_or(default, |(name, value)| parse_flag(&name, &value, default))
        };

        let builder = Self::new();

        let table_kind = var("TABLE_TYPE").map_or(TableKind::default(), |(name, value)| {
            parse_table_kind(&name, &value)
        });

        let fill_pattern = var("INITIALIZE")
            .and_then(|(name, value)| parse_pattern(&name, &value, DEFAULT_FILL_PATTERN));
        let shred_pattern = var("SHRED")
            .and_then(|(name, value)| parse_pattern(&name, &value, DEFAULT_SHRED_PATTERN));

        Self {
            record_allocations: flag("RECORD_ALLOCATED", builder.record_allocations),
            record_deallocations: flag("RECORD_DEALLOCATED", builder.record_deallocations),
            check_double_allocation: flag(
                "CHECK_DOUBLE_ALLOCATION",
                builder.check_double_allocation,
            ),
            table_kind,
            log_anomalies: flag("LOG_ERRORS", true),
            fill_pattern,
            shred_pattern,
            print_exit_stats: flag("PRINT_EXIT_STATS", builder.print_exit_stats),
            print_internal_stats: flag("PRINT_INTERNAL_STATS", builder.print_internal_stats),
            exit_stats_path: var("EXIT_STATS_FILE").map(|(_, value)| PathBuf::from(value)),
            ..builder
        }
    }

    /// Sets whether allocations are recorded at all.
    ///
    /// Without recorded allocations there is nothing to check deallocations against, so every
    /// deallocation is accepted.
    #[must_use]
    pub fn record_allocations(self, record_allocations: bool) -> Self {
        Self {
            record_allocations,
            ..self
        }
    }

    /// Sets whether records of freed blocks are retained to detect repeated deallocation.
    ///
    /// When off, freed blocks are only counted.
    #[must_use]
    pub fn record_deallocations(self, record_deallocations: bool) -> Self {
        Self {
            record_deallocations,
            ..self
        }
    }

    /// Sets whether an allocation at an address that is already live is reported as
    /// [`Anomaly::MultipleAllocation`][crate::Anomaly::MultipleAllocation].
    #[must_use]
    pub fn check_double_allocation(self, check_double_allocation: bool) -> Self {
        Self {
            check_double_allocation,
            ..self
        }
    }

    /// Selects the built-in table implementation for live records.
    ///
    /// Ignored if a table is supplied with [`table()`][Self::table].
    #[must_use]
    pub fn table_kind(self, table_kind: TableKind) -> Self {
        Self { table_kind, ..self }
    }

    /// Supplies the table for live records.
    ///
    /// # Panics
    ///
    /// Panics if the table already contains records.
    #[must_use]
    pub fn table(self, table: Box<dyn RecordTable>) -> Self {
        assert!(
            table.is_empty(),
            "the memory manager must start with an empty record table"
        );

        Self {
            table: Some(table),
            ..self
        }
    }

    /// Sets how many records the table makes room for when the memory manager activates.
    #[must_use]
    pub fn initial_capacity(self, initial_capacity: usize) -> Self {
        Self {
            initial_capacity,
            ..self
        }
    }

    /// Registers a handler that receives every detected anomaly.
    ///
    /// Handlers are called in registration order.
    ///
    /// # Example
    ///
    /// ```
    /// use alloc_audit::{Anomaly, MemoryManager};
    ///
    /// let manager = MemoryManager::builder()
    ///     .handler(|anomaly: &Anomaly| eprintln!("{anomaly}"))
    ///     .build();
    /// # _ = manager;
    /// ```
    #[must_use]
    pub fn handler(mut self, handler: impl AnomalyHandler + 'static) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }

    /// Sets whether anomalies are also emitted as `tracing` warnings.
    #[must_use]
    pub fn log_anomalies(self, log_anomalies: bool) -> Self {
        Self {
            log_anomalies,
            ..self
        }
    }

    /// Fills every new block with the pattern before handing it out through the
    /// [`Allocator`][crate::Allocator], making reads of uninitialized memory easier to spot.
    ///
    /// Zeroed allocations are never filled.
    #[must_use]
    pub fn fill_new_blocks(self, pattern: u8) -> Self {
        Self {
            fill_pattern: Some(pattern),
            ..self
        }
    }

    /// Overwrites every tracked block with the pattern when the
    /// [`Allocator`][crate::Allocator] frees it, making use after free easier to spot.
    #[must_use]
    pub fn shred_deleted_blocks(self, pattern: u8) -> Self {
        Self {
            shred_pattern: Some(pattern),
            ..self
        }
    }

    /// Sets whether [`MemoryManager::shutdown()`] prints statistics and leaked blocks to stdout.
    #[must_use]
    pub fn print_exit_stats(self, print_exit_stats: bool) -> Self {
        Self {
            print_exit_stats,
            ..self
        }
    }

    /// Sets whether printed statistics include memory manager bookkeeping.
    #[must_use]
    pub fn print_internal_stats(self, print_internal_stats: bool) -> Self {
        Self {
            print_internal_stats,
            ..self
        }
    }

    /// Sets a file that [`MemoryManager::shutdown()`] writes exit statistics to, in the debug
    /// protocol format.
    #[must_use]
    pub fn exit_stats_path(self, path: impl Into<PathBuf>) -> Self {
        Self {
            exit_stats_path: Some(path.into()),
            ..self
        }
    }

    /// Builds an active memory manager, ready to track requests.
    #[must_use]
    pub fn build(self) -> MemoryManager {
        let manager = self.build_uninitialized();
        manager.activate();
        manager
    }

    /// Builds a memory manager that does not accept requests until it is activated.
    ///
    /// Use this for a manager that is installed behind an [`Allocator`][crate::Allocator],
    /// which activates it when attached.
    #[must_use]
    pub fn build_uninitialized(self) -> MemoryManager {
        let table = self.record_allocations.then(|| {
            self.table
                .unwrap_or_else(|| self.table_kind.create())
        });

        let mut handlers = self.handlers;
        if self.log_anomalies {
            handlers.push(Box::new(LogAnomalies));
        }

        let config = ManagerConfig {
            record_deallocations: self.record_deallocations,
            check_double_allocation: self.check_double_allocation,
            initial_capacity: self.initial_capacity,
            fill_pattern: self.fill_pattern,
            shred_pattern: self.shred_pattern,
            print_exit_stats: self.print_exit_stats,
            print_internal_stats: self.print_internal_stats,
            exit_stats_path: self.exit_stats_path,
        };

        MemoryManager::new(config, table, handlers)
    }
}

fn parse_flag(name: &str, value: &str, default: bool) -> bool {
    match value.trim().to_ascii_lowercase().as_str() {
        "yes" | "true" | "1" => true,
        "no" | "false" | "0" => false,
        _ => {
            warn!(name, value, "unrecognized flag value, using default");
            default
        }
    }
}

fn parse_table_kind(name: &str, value: &str) -> TableKind {
    match value.trim().to_ascii_lowercase().as_str() {
        "hashtable" | "hash" => TableKind::Hash,
        "array" => TableKind::Array,
        _ => {
            warn!(name, value, "unrecognized table type, using hash table");
            TableKind::Hash
        }
    }
}

fn parse_pattern(name: &str, value: &str, default: u8) -> Option<u8> {
    let value = value.trim();

    if value.eq_ignore_ascii_case("no") {
        return None;
    }

    if value.is_empty() {
        return Some(default);
    }

    let parsed = match value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => value.parse(),
    };

    Some(parsed.unwrap_or_else(|_| {
        warn!(name, value, "unrecognized fill pattern, using default");
        default
    }))
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn builder_from(vars: &[(&str, &str)]) -> ManagerBuilder {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(name, value)| (format!("{ENV_PREFIX}{name}"), (*value).to_string()))
            .collect();

        ManagerBuilder::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults() {
        let builder = ManagerBuilder::new();

        assert!(builder.record_allocations);
        assert!(builder.record_deallocations);
        assert!(builder.check_double_allocation);
        assert_eq!(builder.table_kind, TableKind::Hash);
        assert_eq!(builder.initial_capacity, DEFAULT_TABLE_CAPACITY);
        assert!(!builder.log_anomalies);
        assert_eq!(builder.fill_pattern, None);
        assert_eq!(builder.shred_pattern, None);
    }

    #[test]
    fn empty_environment_keeps_defaults_but_logs() {
        let builder = builder_from(&[]);

        assert!(builder.record_allocations);
        assert!(builder.record_deallocations);
        assert!(builder.log_anomalies);
        assert_eq!(builder.fill_pattern, None);
        assert_eq!(builder.exit_stats_path, None);
    }

    #[test]
    fn environment_flags() {
        let builder = builder_from(&[
            ("RECORD_DEALLOCATED", "no"),
            ("CHECK_DOUBLE_ALLOCATION", "FALSE"),
            ("LOG_ERRORS", "0"),
            ("PRINT_EXIT_STATS", "Yes"),
            ("PRINT_INTERNAL_STATS", "1"),
            ("TABLE_TYPE", "array"),
            ("EXIT_STATS_FILE", "/tmp/stats.txt"),
        ]);

        assert!(!builder.record_deallocations);
        assert!(!builder.check_double_allocation);
        assert!(!builder.log_anomalies);
        assert!(builder.print_exit_stats);
        assert!(builder.print_internal_stats);
        assert_eq!(builder.table_kind, TableKind::Array);
        assert_eq!(
            builder.exit_stats_path,
            Some(PathBuf::from("/tmp/stats.txt"))
        );
    }

    #[test]
    fn unrecognized_values_fall_back_to_defaults() {
        let builder = builder_from(&[("RECORD_ALLOCATED", "maybe"), ("TABLE_TYPE", "tree")]);

        assert!(builder.record_allocations);
        assert_eq!(builder.table_kind, TableKind::Hash);
    }

    #[test]
    fn fill_patterns() {
        assert_eq!(
            builder_from(&[("INITIALIZE", "")]).fill_pattern,
            Some(DEFAULT_FILL_PATTERN)
        );
        assert_eq!(builder_from(&[("INITIALIZE", "no")]).fill_pattern, None);
        assert_eq!(builder_from(&[("INITIALIZE", "17")]).fill_pattern, Some(17));
        assert_eq!(builder_from(&[("SHRED", "0xEE")]).shred_pattern, Some(0xEE));
        assert_eq!(
            builder_from(&[("SHRED", "garbage")]).shred_pattern,
            Some(DEFAULT_SHRED_PATTERN)
        );
        assert_eq!(
            builder_from(&[("SHRED", "300")]).shred_pattern,
            Some(DEFAULT_SHRED_PATTERN)
        );
    }

    #[test]
    fn handlers_accumulate() {
        let builder = ManagerBuilder::new()
            .handler(|_: &crate::Anomaly| {})
            .handler(LogAnomalies);

        assert_eq!(builder.handlers.len(), 2);
    }

    #[test]
    #[should_panic]
    fn non_empty_table_is_rejected() {
        use crate::{Address, AllocationKind, AllocationRecord, HashRecordTable, SourceLocation};

        let mut table = HashRecordTable::new();
        table.insert(
            AllocationRecord::new(
                0,
                Address::new(0x10),
                1,
                SourceLocation::UNKNOWN,
                AllocationKind::Object,
                false,
            ),
            true,
        );

        _ = ManagerBuilder::new().table(Box::new(table));
    }
}
