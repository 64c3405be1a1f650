use thiserror::Error;

/// Errors that can occur when exchanging diagnostics with external tools.
///
/// Misuse of memory by the traced program is never an error. It is reported through
/// [`AnomalyHandler`][crate::AnomalyHandler] instead.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A message was produced by an incompatible version of the debug protocol.
    #[error("debug protocol version {found} is not supported, expected {expected}")]
    VersionMismatch {
        /// The version found in the message.
        found: u32,

        /// The version this package speaks.
        expected: u32,
    },

    /// A message carried a message kind that is not part of the debug protocol.
    #[error("unknown debug message kind {0}")]
    UnknownMessage(u32),

    /// A field of a message could not be parsed.
    #[error("malformed {what}: '{value}'")]
    Malformed {
        /// The name of the field that was being read.
        what: &'static str,

        /// The text that failed to parse.
        value: String,
    },

    /// A message ended before all of its fields were read.
    #[error("unexpected end of message while reading {what}")]
    UnexpectedEnd {
        /// The name of the field that was being read.
        what: &'static str,
    },

    /// Writing the exit statistics failed.
    #[error("failed to write exit statistics")]
    Io(#[from] std::io::Error),
}

/// A specialized `Result` type for diagnostic exchange, returning the crate's
/// [`Error`] type as the error value.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::fmt::Debug;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Error: Send, Sync, Debug);

    #[test]
    fn messages_name_the_field() {
        let error = Error::Malformed {
            what: "record size",
            value: "abc".to_string(),
        };

        assert_eq!(error.to_string(), "malformed record size: 'abc'");

        let error = Error::UnexpectedEnd { what: "histogram" };

        assert!(error.to_string().contains("histogram"));
    }

    #[test]
    fn io_errors_convert() {
        let error: Error = std::io::Error::other("disk full").into();

        assert!(matches!(error, Error::Io(_)));
    }
}
