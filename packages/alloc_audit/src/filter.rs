use crate::wire::{Fields, write_bool, write_string};
use crate::{AllocationRecord, Result};

/// Selects the records that go into a report or a record stream.
///
/// The default filter passes every record except memory manager bookkeeping.
///
/// # Examples
///
/// ```
/// use alloc_audit::RecordFilter;
///
/// let filter = RecordFilter::new().min_size(1024).file_name("parser.rs");
/// # _ = filter;
/// ```
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RecordFilter {
    include_internal: bool,
    min_size: usize,
    file_name: Option<String>,
}

impl RecordFilter {
    /// Creates a filter that passes every record except memory manager bookkeeping.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether memory manager bookkeeping passes the filter.
    #[must_use]
    pub fn include_internal(self, include_internal: bool) -> Self {
        Self {
            include_internal,
            ..self
        }
    }

    /// Sets the smallest block size that passes the filter.
    #[must_use]
    pub fn min_size(self, min_size: usize) -> Self {
        Self { min_size, ..self }
    }

    /// Passes only blocks allocated in the named file.
    ///
    /// The name matches a record if it equals the record's file or is a trailing part of the
    /// record's file path that starts right after a path separator.
    #[must_use]
    pub fn file_name(self, file_name: impl Into<String>) -> Self {
        Self {
            file_name: Some(file_name.into()),
            ..self
        }
    }

    /// Whether the record passes the filter.
    #[must_use]
    pub fn matches(&self, record: &AllocationRecord) -> bool {
        if record.is_manager_memory() && !self.include_internal {
            return false;
        }

        if record.size() < self.min_size {
            return false;
        }

        self.file_name
            .as_deref()
            .is_none_or(|name| file_matches(record.allocated_at().file(), name))
    }

    /// Appends the filter in debug protocol form: `<internal> <min_size> <has_file> ["file"]`.
    pub fn write(&self, out: &mut String) {
        write_bool(out, self.include_internal);
        out.push(' ');
        out.push_str(&self.min_size.to_string());
        out.push(' ');
        write_bool(out, self.file_name.is_some());

        if let Some(name) = &self.file_name {
            out.push(' ');
            write_string(out, name);
        }

        out.push('\n');
    }

    /// Reads a filter written by [`write()`][Self::write].
    ///
    /// # Errors
    ///
    /// Fails if a field is missing or malformed.
    pub fn read(input: &str) -> Result<Self> {
        let mut fields = Fields::new(input);

        let include_internal = fields.bool("filter internal flag")?;
        let min_size = fields.number("filter minimum size")?;
        let file_name = if fields.bool("filter file flag")? {
            Some(fields.string("filter file name")?)
        } else {
            None
        };

        Ok(Self {
            include_internal,
            min_size,
            file_name,
        })
    }
}

fn file_matches(file: &str, name: &str) -> bool {
    if file == name {
        return true;
    }

    file.strip_suffix(name)
        .is_some_and(|prefix| prefix.ends_with(['/', '\\']))
}
