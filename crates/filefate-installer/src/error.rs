use std::fmt;
use std::io;

use filefate_archive::ArchiveError;

/// Errors that end a run. Files already materialized stay in place.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("payload stream failed at '{path}'")]
    Archive {
        path: String,
        #[source]
        source: ArchiveError,
    },
    #[error("payload out of sequence: expected {expected}, found {found}")]
    Sequence { expected: String, found: String },
    #[error("'{path}' declares {declared} content bytes, expected {expected}")]
    ContentSize {
        path: String,
        expected: u64,
        declared: u64,
    },
    #[error("run cancelled before '{path}'")]
    Cancelled { path: String },
    #[error("registry tracks {actual} files but the manifest lists {expected}")]
    RegistrySize { expected: usize, actual: usize },
}

/// An `EngineError` together with the report of everything the run did
/// before it stopped.
#[derive(Debug)]
pub struct RunFailure {
    pub error: EngineError,
    pub report: Box<RunReport>,
}

impl RunFailure {
    pub(crate) fn new(error: EngineError, report: RunReport) -> Self {
        Self {
            error,
            report: Box::new(report),
        }
    }
}

impl fmt::Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.error, f)
    }
}

impl std::error::Error for RunFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        std::error::Error::source(&self.error)
    }
}

/// A failure confined to one manifest entry.
#[derive(Debug, thiserror::Error)]
pub enum FileError {
    #[error("{op} failed")]
    Filesystem {
        op: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("content digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },
    #[error("hard link group ended without a member carrying its content")]
    MissingHardLink,
}

impl FileError {
    pub(crate) fn fs(op: &'static str, source: io::Error) -> Self {
        Self::Filesystem { op, source }
    }

    /// Out of space or quota. Always ends the run.
    pub fn is_storage_full(&self) -> bool {
        match self {
            Self::Filesystem { source, .. } => matches!(
                source.raw_os_error(),
                Some(code) if code == libc::ENOSPC || code == libc::EDQUOT
            ),
            _ => false,
        }
    }
}

#[derive(Debug)]
pub struct FileFailure {
    pub path: String,
    pub error: FileError,
}

impl fmt::Display for FileFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.error)?;
        let mut source = std::error::Error::source(&self.error);
        while let Some(cause) = source {
            write!(f, ": {cause}")?;
            source = cause.source();
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathConflict {
    pub path: String,
    pub package: String,
}

#[derive(Debug, Default)]
pub struct RunReport {
    pub first_failure: Option<FileFailure>,
    pub aborted: bool,
    pub conflicts: Vec<PathConflict>,
    pub created: usize,
    pub backed_up: usize,
    pub skipped: usize,
    pub removed: usize,
    pub bytes_done: u64,
    pub bytes_total: u64,
}

impl RunReport {
    pub fn is_clean(&self) -> bool {
        self.first_failure.is_none() && !self.aborted
    }

    pub fn first_failed_path(&self) -> Option<&str> {
        self.first_failure
            .as_ref()
            .map(|failure| failure.path.as_str())
    }
}
