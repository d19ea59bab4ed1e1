use std::io;

use crate::format::HeaderForm;

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("malformed archive header at offset {offset}: {reason}")]
    Format { offset: u64, reason: String },

    #[error("archive I/O failed at offset {offset}")]
    Io {
        offset: u64,
        #[source]
        source: io::Error,
    },

    #[error(
        "archive content truncated at offset {offset}: expected {expected} bytes, transferred {actual}"
    )]
    Truncated {
        offset: u64,
        expected: u64,
        actual: u64,
    },

    #[error("content size of the stripped record at offset {offset} was never supplied")]
    UnsizedContent { offset: u64 },

    #[error("cannot write a {found} header into a {expected} archive")]
    FormMismatch {
        expected: HeaderForm,
        found: HeaderForm,
    },

    #[error("content written without an open archive entry")]
    NoOpenEntry,

    #[error("archive writer is already closed")]
    Closed,
}

impl ArchiveError {
    pub(crate) fn format(offset: u64, reason: impl Into<String>) -> Self {
        Self::Format {
            offset,
            reason: reason.into(),
        }
    }

    /// Stream offset the error was detected at, when known.
    pub fn offset(&self) -> Option<u64> {
        match self {
            Self::Format { offset, .. }
            | Self::Io { offset, .. }
            | Self::Truncated { offset, .. }
            | Self::UnsizedContent { offset } => Some(*offset),
            Self::FormMismatch { .. } | Self::NoOpenEntry | Self::Closed => None,
        }
    }
}
