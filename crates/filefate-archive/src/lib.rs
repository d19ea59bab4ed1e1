//! Streaming codec for package payload archives.
//!
//! Payloads use the SVR4 "newc" cpio layout. Every record is a header, the
//! NUL-terminated entry name, and the entry content, with each section padded
//! to a four byte boundary measured from the start of the stream. A second,
//! compact header form ("stripped") replaces the name and metadata with an
//! index into an external file manifest; its content length is not recorded
//! and must be supplied by the caller before the content can be read.
//!
//! The codec knows nothing about filesystems: hard link conventions, file
//! types and paths are interpreted by callers.

mod error;
mod format;
mod reader;
mod writer;

pub use error::ArchiveError;
pub use format::{
    FullHeader, Header, HeaderForm, Metadata, ALIGNMENT, FULL_HEADER_LEN, MAX_NAME_LEN,
    STRIPPED_HEADER_LEN, TRAILER_NAME,
};
pub use reader::{ArchiveReader, ContentReader, PendingContent, Record};
pub use writer::ArchiveWriter;

pub type Result<T> = std::result::Result<T, ArchiveError>;
