//! Text encoding of the debug protocol spoken with external diagnostic tools.
//!
//! Every message starts with a header line `<version> <kind>`. Fields are separated by
//! whitespace. Booleans are `T` or `F` and strings are double-quoted with `\\`, `\"` and `\n`
//! escapes.
//!
//! A record stream is one line per record, each starting with `T`, followed by a line that is
//! just `F`. Each record line carries `<live> <array> "<file>" <line> <size> <address>`
//! followed by `<id> <internal>`. New fields are only ever appended to a record line and
//! readers ignore fields they do not know, so older tools keep working.

use std::fmt::Write as _;
use std::str::FromStr;

use crate::{
    Address, AllocationKind, AllocationRecord, Error, HISTOGRAM_BUCKET_COUNT, RecordFilter,
    Result, SizeHistogram,
};

/// Version of the debug protocol written and accepted by this package.
pub const PROTOCOL_VERSION: u32 = 1;

const ERR_STRING_WRITE: &str = "writing to a String cannot fail";

/// Kinds of messages exchanged with external diagnostic tools.
///
/// The same kind is used for a request and for the response to it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum MessageKind {
    /// Counts, byte totals and the size histogram of the live records.
    RunningStats,

    /// Statistics written when the memory manager shuts down.
    ExitStats,

    /// The live records that pass a filter.
    Records,

    /// Remember the current allocation id as the start of a snapshot.
    SaveSnapshot,

    /// The live records allocated since the last saved snapshot that pass a filter.
    SnapshotDiff,
}

impl MessageKind {
    /// The numeric code of the message kind on the wire.
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::RunningStats => 0,
            Self::ExitStats => 1,
            Self::Records => 3,
            Self::SaveSnapshot => 4,
            Self::SnapshotDiff => 5,
        }
    }

    /// Maps a numeric code back to a message kind.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownMessage`] if no message kind has this code.
    pub fn from_code(code: u32) -> Result<Self> {
        match code {
            0 => Ok(Self::RunningStats),
            1 => Ok(Self::ExitStats),
            3 => Ok(Self::Records),
            4 => Ok(Self::SaveSnapshot),
            5 => Ok(Self::SnapshotDiff),
            other => Err(Error::UnknownMessage(other)),
        }
    }
}

/// Statistics carried by a [`MessageKind::RunningStats`] or [`MessageKind::ExitStats`] message.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RunningStats {
    live_count: usize,
    live_bytes: usize,
    retired_count: usize,
    histogram: SizeHistogram,
}

impl RunningStats {
    pub(crate) const fn new(
        live_count: usize,
        live_bytes: usize,
        retired_count: usize,
        histogram: SizeHistogram,
    ) -> Self {
        Self {
            live_count,
            live_bytes,
            retired_count,
            histogram,
        }
    }

    /// Number of live records.
    #[must_use]
    pub const fn live_count(&self) -> usize {
        self.live_count
    }

    /// Total size of the live records.
    #[must_use]
    pub const fn live_bytes(&self) -> usize {
        self.live_bytes
    }

    /// Number of freed records, retained or merely counted.
    #[must_use]
    pub const fn retired_count(&self) -> usize {
        self.retired_count
    }

    /// Size histogram of the live records.
    #[must_use]
    pub const fn histogram(&self) -> &SizeHistogram {
        &self.histogram
    }
}

/// One record as read back from a record stream.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RecordSummary {
    live: bool,
    kind: AllocationKind,
    file: String,
    line: u32,
    size: usize,
    address: Address,
    id: Option<u32>,
    manager_memory: Option<bool>,
}

impl RecordSummary {
    /// Whether the block had not been freed when the stream was written.
    #[must_use]
    pub const fn is_live(&self) -> bool {
        self.live
    }

    /// How the block was allocated.
    #[must_use]
    pub const fn kind(&self) -> AllocationKind {
        self.kind
    }

    /// The file in which the block was allocated.
    #[must_use]
    pub fn file(&self) -> &str {
        &self.file
    }

    /// The line at which the block was allocated.
    #[must_use]
    pub const fn line(&self) -> u32 {
        self.line
    }

    /// Size of the block in bytes.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Address of the block.
    #[must_use]
    pub const fn address(&self) -> Address {
        self.address
    }

    /// Allocation id, if the writer included it.
    #[must_use]
    pub const fn id(&self) -> Option<u32> {
        self.id
    }

    /// Whether the block is memory manager bookkeeping, if the writer included it.
    #[must_use]
    pub const fn is_manager_memory(&self) -> Option<bool> {
        self.manager_memory
    }
}

/// Reads the header of a message and returns its kind together with the rest of the message.
///
/// # Errors
///
/// Fails if the header is missing, malformed, from another protocol version or names an
/// unknown message kind.
pub fn read_message(input: &str) -> Result<(MessageKind, &str)> {
    let mut fields = Fields::new(input);

    let version: u32 = fields.number("protocol version")?;
    if version != PROTOCOL_VERSION {
        return Err(Error::VersionMismatch {
            found: version,
            expected: PROTOCOL_VERSION,
        });
    }

    let kind = MessageKind::from_code(fields.number("message kind")?)?;

    Ok((kind, fields.rest()))
}

/// Reads a record stream up to and including its terminating `F` line.
///
/// # Errors
///
/// Fails if a record line is malformed or the terminator is missing.
pub fn read_records(input: &str) -> Result<Vec<RecordSummary>> {
    let mut records = Vec::new();

    for line in input.lines().filter(|line| !line.trim().is_empty()) {
        let mut fields = Fields::new(line);

        if !fields.bool("continuation flag")? {
            return Ok(records);
        }

        let live = fields.bool("live flag")?;
        let kind = AllocationKind::from_array_flag(fields.bool("array flag")?);
        let file = fields.string("file name")?;
        let line = fields.number("line number")?;
        let size = fields.number("size")?;
        let address = Address::new(fields.number("address")?);
        let id = fields.optional_number("allocation id")?;
        let manager_memory = fields.optional_bool("internal flag")?;

        records.push(RecordSummary {
            live,
            kind,
            file,
            line,
            size,
            address,
            id,
            manager_memory,
        });
    }

    Err(Error::UnexpectedEnd {
        what: "record stream terminator",
    })
}

/// Reads a size histogram: the bucket count followed by that many counts.
///
/// # Errors
///
/// Fails if a count is malformed or the bucket count differs from [`HISTOGRAM_BUCKET_COUNT`].
pub fn read_histogram(input: &str) -> Result<SizeHistogram> {
    read_histogram_fields(&mut Fields::new(input))
}

/// Reads the body of a running stats or exit stats message.
///
/// # Errors
///
/// Fails if any of the fields are missing or malformed.
pub fn read_running_stats(input: &str) -> Result<RunningStats> {
    let mut fields = Fields::new(input);

    let live_count = fields.number("live count")?;
    let live_bytes = fields.number("live bytes")?;
    let retired_count = fields.number("retired count")?;
    let histogram = read_histogram_fields(&mut fields)?;

    Ok(RunningStats::new(
        live_count,
        live_bytes,
        retired_count,
        histogram,
    ))
}

fn read_histogram_fields(fields: &mut Fields<'_>) -> Result<SizeHistogram> {
    let bucket_count: usize = fields.number("histogram bucket count")?;
    if bucket_count != HISTOGRAM_BUCKET_COUNT {
        return Err(Error::Malformed {
            what: "histogram bucket count",
            value: bucket_count.to_string(),
        });
    }

    let mut counts = [0; HISTOGRAM_BUCKET_COUNT];
    for count in &mut counts {
        *count = fields.number("histogram count")?;
    }

    Ok(SizeHistogram::from_counts(counts))
}

/// Builds a request message for [`MemoryManager::handle_debug_request()`].
///
/// The filter is only sent for [`MessageKind::Records`] and [`MessageKind::SnapshotDiff`].
/// Without one, the memory manager applies the default [`RecordFilter`].
///
/// # Examples
///
/// ```
/// use alloc_audit::{MemoryManager, MessageKind, RecordFilter, read_message, read_records, request};
///
/// let manager = MemoryManager::builder().build();
///
/// let filter = RecordFilter::new().min_size(1024);
/// let response = manager
///     .handle_debug_request(&request(MessageKind::Records, Some(&filter)))
///     .unwrap();
///
/// let (kind, body) = read_message(&response).unwrap();
/// assert_eq!(kind, MessageKind::Records);
/// assert!(read_records(body).unwrap().is_empty());
/// ```
///
/// [`MemoryManager::handle_debug_request()`]: crate::MemoryManager::handle_debug_request
#[must_use]
pub fn request(kind: MessageKind, filter: Option<&RecordFilter>) -> String {
    let mut out = String::new();
    write_header(&mut out, kind);

    let takes_filter = matches!(kind, MessageKind::Records | MessageKind::SnapshotDiff);
    if let Some(filter) = filter.filter(|_| takes_filter) {
        filter.write(&mut out);
    }

    out
}

/// Writes the header line of a message.
pub fn write_header(out: &mut String, kind: MessageKind) {
    writeln!(out, "{PROTOCOL_VERSION} {}", kind.code()).expect(ERR_STRING_WRITE);
}

pub(crate) fn write_bool(out: &mut String, value: bool) {
    out.push(if value { 'T' } else { 'F' });
}

pub(crate) fn write_string(out: &mut String, value: &str) {
    out.push('"');

    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            other => out.push(other),
        }
    }

    out.push('"');
}

pub(crate) fn write_record(out: &mut String, record: &AllocationRecord) {
    write_bool(out, true);
    out.push(' ');
    write_bool(out, !record.is_deleted());
    out.push(' ');
    write_bool(out, record.allocation_kind().is_array());
    out.push(' ');
    write_string(out, record.allocated_at().file());
    write!(
        out,
        " {} {} {} {} ",
        record.allocated_at().line(),
        record.size(),
        record.address().get(),
        record.id()
    )
    .expect(ERR_STRING_WRITE);
    write_bool(out, record.is_manager_memory());
    out.push('\n');
}

pub(crate) fn write_records_end(out: &mut String) {
    write_bool(out, false);
    out.push('\n');
}

pub(crate) fn write_record_stream(out: &mut String, records: &[AllocationRecord]) {
    for record in records {
        write_record(out, record);
    }

    write_records_end(out);
}

pub(crate) fn write_histogram(out: &mut String, histogram: &SizeHistogram) {
    write!(out, "{HISTOGRAM_BUCKET_COUNT}").expect(ERR_STRING_WRITE);

    for count in histogram.counts() {
        write!(out, " {count}").expect(ERR_STRING_WRITE);
    }

    out.push('\n');
}

pub(crate) fn write_running_stats(out: &mut String, stats: &RunningStats) {
    write!(
        out,
        "{} {} {} ",
        stats.live_count(),
        stats.live_bytes(),
        stats.retired_count()
    )
    .expect(ERR_STRING_WRITE);
    write_histogram(out, stats.histogram());
}

/// Cursor over the whitespace-separated fields of a message.
#[derive(Debug)]
pub(crate) struct Fields<'a> {
    rest: &'a str,
}

impl<'a> Fields<'a> {
    pub(crate) const fn new(input: &'a str) -> Self {
        Self { rest: input }
    }

    /// Everything after the current position, with leading whitespace removed.
    pub(crate) fn rest(&self) -> &'a str {
        self.rest.trim_start()
    }

    fn token(&mut self, what: &'static str) -> Result<&'a str> {
        self.try_token().ok_or(Error::UnexpectedEnd { what })
    }

    fn try_token(&mut self) -> Option<&'a str> {
        let trimmed = self.rest.trim_start();
        if trimmed.is_empty() {
            self.rest = trimmed;
            return None;
        }

        let end = trimmed
            .find(char::is_whitespace)
            .unwrap_or(trimmed.len());
        let (token, rest) = trimmed.split_at(end);
        self.rest = rest;

        Some(token)
    }

    pub(crate) fn bool(&mut self, what: &'static str) -> Result<bool> {
        parse_bool(self.token(what)?, what)
    }

    fn optional_bool(&mut self, what: &'static str) -> Result<Option<bool>> {
        self.try_token()
            .map(|token| parse_bool(token, what))
            .transpose()
    }

    pub(crate) fn number<T: FromStr>(&mut self, what: &'static str) -> Result<T> {
        parse_number(self.token(what)?, what)
    }

    fn optional_number<T: FromStr>(&mut self, what: &'static str) -> Result<Option<T>> {
        self.try_token()
            .map(|token| parse_number(token, what))
            .transpose()
    }

    pub(crate) fn string(&mut self, what: &'static str) -> Result<String> {
        let trimmed = self.rest.trim_start();

        let Some(quoted) = trimmed.strip_prefix('"') else {
            return match self.try_token() {
                Some(token) => Err(Error::Malformed {
                    what,
                    value: token.to_string(),
                }),
                None => Err(Error::UnexpectedEnd { what }),
            };
        };

        let mut value = String::new();
        let mut chars = quoted.char_indices();

        while let Some((index, c)) = chars.next() {
            match c {
                '"' => {
                    self.rest = quoted
                        .get(index.checked_add(1).expect("index is within the string")..)
                        .unwrap_or_default();
                    return Ok(value);
                }
                '\\' => match chars.next() {
                    Some((_, 'n')) => value.push('\n'),
                    Some((_, escaped @ ('\\' | '"'))) => value.push(escaped),
                    Some((_, other)) => {
                        return Err(Error::Malformed {
                            what,
                            value: format!("\\{other}"),
                        });
                    }
                    None => break,
                },
                other => value.push(other),
            }
        }

        Err(Error::UnexpectedEnd { what })
    }
}

fn parse_bool(token: &str, what: &'static str) -> Result<bool> {
    match token {
        "T" => Ok(true),
        "F" => Ok(false),
        other => Err(Error::Malformed {
            what,
            value: other.to_string(),
        }),
    }
}

fn parse_number<T: FromStr>(token: &str, what: &'static str) -> Result<T> {
    token.parse().map_err(|_| Error::Malformed {
        what,
        value: token.to_string(),
    })
}
