use std::io::Write;

use tracing::{debug, warn};

use crate::error::ArchiveError;
use crate::format::{encode_full, encode_stripped, padding, trailer, Header, HeaderForm};
use crate::Result;

#[derive(Debug, Clone, Copy)]
struct OpenEntry {
    expected: u64,
    written: u64,
}

/// Sequential encoder. The stream is flushed by `close`, or on a best-effort
/// basis when the writer is dropped without being closed.
#[derive(Debug)]
pub struct ArchiveWriter<W: Write> {
    inner: W,
    form: HeaderForm,
    offset: u64,
    entry: Option<OpenEntry>,
    closed: bool,
}

impl<W: Write> ArchiveWriter<W> {
    pub fn new(inner: W, form: HeaderForm) -> Self {
        Self {
            inner,
            form,
            offset: 0,
            entry: None,
            closed: false,
        }
    }

    pub fn form(&self) -> HeaderForm {
        self.form
    }

    /// Bytes written to the stream so far.
    pub fn tell(&self) -> u64 {
        self.offset
    }

    pub fn write_header(&mut self, header: &Header) -> Result<()> {
        if self.closed {
            return Err(ArchiveError::Closed);
        }
        if header.form() != self.form {
            return Err(ArchiveError::FormMismatch {
                expected: self.form,
                found: header.form(),
            });
        }
        self.close_entry()?;

        let encoded = match header {
            Header::Full(full) => {
                debug!(
                    name = %full.name,
                    size = full.size,
                    offset = self.offset,
                    "write archive header"
                );
                encode_full(full, self.offset)?
            }
            Header::Stripped { index, size } => {
                debug!(index, size, offset = self.offset, "write stripped archive header");
                encode_stripped(*index)
            }
        };
        self.write_raw(&encoded)?;
        self.write_padding()?;
        self.entry = Some(OpenEntry {
            expected: header.content_size(),
            written: 0,
        });
        Ok(())
    }

    /// Appends content to the entry opened by the last `write_header`.
    pub fn write_content(&mut self, data: &[u8]) -> Result<()> {
        let Some(entry) = self.entry else {
            return Err(ArchiveError::NoOpenEntry);
        };
        let total = entry.written + data.len() as u64;
        if total > entry.expected {
            return Err(ArchiveError::Truncated {
                offset: self.offset,
                expected: entry.expected,
                actual: total,
            });
        }
        self.write_raw(data)?;
        self.entry = Some(OpenEntry {
            expected: entry.expected,
            written: total,
        });
        Ok(())
    }

    /// Writes the trailer and flushes. Calling it again is a no-op.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.close_entry()?;
        let encoded = encode_full(&trailer(), self.offset)?;
        self.write_raw(&encoded)?;
        self.write_padding()?;
        let offset = self.offset;
        self.inner
            .flush()
            .map_err(|source| ArchiveError::Io { offset, source })?;
        self.closed = true;
        debug!(bytes = self.offset, "closed archive");
        Ok(())
    }

    fn close_entry(&mut self) -> Result<()> {
        let Some(entry) = self.entry.take() else {
            return Ok(());
        };
        if entry.written != entry.expected {
            return Err(ArchiveError::Truncated {
                offset: self.offset,
                expected: entry.expected,
                actual: entry.written,
            });
        }
        self.write_padding()
    }

    fn write_padding(&mut self) -> Result<()> {
        let amount = padding(self.offset) as usize;
        if amount > 0 {
            self.write_raw(&[0_u8; 4][..amount])?;
        }
        Ok(())
    }

    fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        let offset = self.offset;
        self.inner
            .write_all(data)
            .map_err(|source| ArchiveError::Io { offset, source })?;
        self.offset += data.len() as u64;
        Ok(())
    }
}

impl<W: Write> Drop for ArchiveWriter<W> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(err) = self.inner.flush() {
            warn!(error = %err, "failed to flush unclosed archive writer");
        }
    }
}
