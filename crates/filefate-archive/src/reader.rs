use std::io::{self, Read};

use tracing::{debug, trace};

use crate::error::ArchiveError;
use crate::format::{
    decode_full_fields, padding, parse_hex_field, FullHeader, CRC_MAGIC, FULL_HEADER_LEN,
    MAGIC_LEN, MAX_NAME_LEN, NEWC_MAGIC, STRIPPED_HEADER_LEN, STRIPPED_MAGIC, TRAILER_NAME,
};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    Header,
    Content { size: u64, remaining: u64 },
    Unsized { offset: u64 },
    End,
}

/// Sequential decoder over a payload byte stream.
#[derive(Debug)]
pub struct ArchiveReader<R> {
    inner: R,
    offset: u64,
    state: ReadState,
}

/// One decoded record. Content must be read (or dropped) before the next
/// header can be decoded; the borrow on the reader enforces that order.
#[derive(Debug)]
pub enum Record<'a, R> {
    Full {
        header: FullHeader,
        content: ContentReader<'a, R>,
    },
    Stripped {
        index: u32,
        content: PendingContent<'a, R>,
    },
}

/// Content of a stripped record whose length is not yet known.
#[derive(Debug)]
#[must_use = "stripped content must be sized before the next header can be read"]
pub struct PendingContent<'a, R> {
    reader: &'a mut ArchiveReader<R>,
}

/// Reads exactly the declared number of content bytes of one record.
#[derive(Debug)]
pub struct ContentReader<'a, R> {
    reader: &'a mut ArchiveReader<R>,
}

impl<R: Read> ArchiveReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            offset: 0,
            state: ReadState::Header,
        }
    }

    /// Bytes consumed from the stream so far.
    pub fn tell(&self) -> u64 {
        self.offset
    }

    pub fn is_finished(&self) -> bool {
        self.state == ReadState::End
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Decodes the next header. Returns `None` once the trailer was read.
    ///
    /// Content of the previous record that was not read is skipped first.
    pub fn read_header(&mut self) -> Result<Option<Record<'_, R>>> {
        match self.state {
            ReadState::End => return Ok(None),
            ReadState::Unsized { offset } => return Err(ArchiveError::UnsizedContent { offset }),
            ReadState::Content { size, remaining } => {
                if remaining > 0 {
                    trace!(remaining, "skipping unread archive content");
                    self.skip_content(size, remaining)?;
                }
                self.skip_padding()?;
                self.state = ReadState::Header;
            }
            ReadState::Header => {}
        }

        let header_offset = self.offset;
        let mut magic = [0_u8; MAGIC_LEN];
        self.read_exact_at(&mut magic)?;

        if &magic == STRIPPED_MAGIC {
            let mut raw = [0_u8; STRIPPED_HEADER_LEN - MAGIC_LEN];
            self.read_exact_at(&mut raw)?;
            let index = parse_hex_field(&raw, "file index", header_offset)?;
            self.skip_padding()?;
            debug!(index, offset = header_offset, "read stripped archive header");
            self.state = ReadState::Unsized {
                offset: header_offset,
            };
            return Ok(Some(Record::Stripped {
                index,
                content: PendingContent { reader: self },
            }));
        }

        if &magic != NEWC_MAGIC && &magic != CRC_MAGIC {
            return Err(ArchiveError::format(
                header_offset,
                format!("bad magic {:?}", String::from_utf8_lossy(&magic)),
            ));
        }

        let mut raw = [0_u8; FULL_HEADER_LEN - MAGIC_LEN];
        self.read_exact_at(&mut raw)?;
        let (metadata, size, name_size) = decode_full_fields(&raw, header_offset)?;
        if name_size == 0 || name_size > MAX_NAME_LEN {
            return Err(ArchiveError::format(
                header_offset,
                format!("invalid name size {name_size}"),
            ));
        }

        let mut name = vec![0_u8; name_size as usize];
        self.read_exact_at(&mut name)?;
        if name.pop() != Some(0) {
            return Err(ArchiveError::format(
                header_offset,
                "entry name is not NUL terminated",
            ));
        }
        let name = String::from_utf8(name)
            .map_err(|_| ArchiveError::format(header_offset, "entry name is not valid UTF-8"))?;
        self.skip_padding()?;

        if name == TRAILER_NAME {
            debug!(offset = header_offset, "read archive trailer");
            self.state = ReadState::End;
            return Ok(None);
        }

        debug!(name = %name, size, offset = header_offset, "read archive header");
        self.state = ReadState::Content {
            size,
            remaining: size,
        };
        Ok(Some(Record::Full {
            header: FullHeader {
                name,
                metadata,
                size,
            },
            content: ContentReader { reader: self },
        }))
    }

    fn read_exact_at(&mut self, buf: &mut [u8]) -> Result<()> {
        let offset = self.offset;
        self.inner
            .read_exact(buf)
            .map_err(|source| ArchiveError::Io { offset, source })?;
        self.offset += buf.len() as u64;
        Ok(())
    }

    fn skip_padding(&mut self) -> Result<()> {
        let amount = padding(self.offset) as usize;
        if amount > 0 {
            let mut pad = [0_u8; 4];
            self.read_exact_at(&mut pad[..amount])?;
        }
        Ok(())
    }

    fn skip_content(&mut self, size: u64, remaining: u64) -> Result<()> {
        let start = self.offset;
        let copied = io::copy(&mut (&mut self.inner).take(remaining), &mut io::sink())
            .map_err(|source| ArchiveError::Io {
                offset: start,
                source,
            })?;
        self.offset += copied;
        if copied < remaining {
            return Err(ArchiveError::Truncated {
                offset: self.offset,
                expected: size,
                actual: size - remaining + copied,
            });
        }
        self.state = ReadState::Content { size, remaining: 0 };
        Ok(())
    }

    fn content_chunk(&mut self, buf: &mut [u8]) -> Result<usize> {
        let ReadState::Content { size, remaining } = self.state else {
            return Ok(0);
        };
        if remaining == 0 || buf.is_empty() {
            return Ok(0);
        }

        let want = buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
        let read = loop {
            match self.inner.read(&mut buf[..want]) {
                Ok(read) => break read,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(source) => {
                    return Err(ArchiveError::Io {
                        offset: self.offset,
                        source,
                    })
                }
            }
        };
        if read == 0 {
            return Err(ArchiveError::Truncated {
                offset: self.offset,
                expected: size,
                actual: size - remaining,
            });
        }

        self.offset += read as u64;
        self.state = ReadState::Content {
            size,
            remaining: remaining - read as u64,
        };
        Ok(read)
    }
}

impl<'a, R: Read> PendingContent<'a, R> {
    /// Supplies the content length the external manifest declares for this record.
    pub fn with_size(self, size: u64) -> ContentReader<'a, R> {
        self.reader.state = ReadState::Content {
            size,
            remaining: size,
        };
        ContentReader {
            reader: self.reader,
        }
    }

    /// Sizes the content and reads all of it into `buf`, returning the byte count.
    pub fn read_with_size(self, size: u64, buf: &mut Vec<u8>) -> Result<usize> {
        let mut content = self.with_size(size);
        let before = buf.len();
        content.read_into(buf)?;
        Ok(buf.len() - before)
    }
}

impl<R: Read> ContentReader<'_, R> {
    /// Declared content length of this record.
    pub fn size(&self) -> u64 {
        match self.reader.state {
            ReadState::Content { size, .. } => size,
            _ => 0,
        }
    }

    pub fn remaining(&self) -> u64 {
        match self.reader.state {
            ReadState::Content { remaining, .. } => remaining,
            _ => 0,
        }
    }

    /// Stream offset, as `ArchiveReader::tell`.
    pub fn tell(&self) -> u64 {
        self.reader.offset
    }

    /// Reads the next chunk of content. Returns 0 once all content was read.
    pub fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.reader.content_chunk(buf)
    }

    /// Appends the remaining content to `buf`.
    pub fn read_into(&mut self, buf: &mut Vec<u8>) -> Result<()> {
        let remaining = self.remaining();
        buf.reserve(usize::try_from(remaining).unwrap_or(0));
        let mut chunk = [0_u8; 8192];
        loop {
            let read = self.read_chunk(&mut chunk)?;
            if read == 0 {
                return Ok(());
            }
            buf.extend_from_slice(&chunk[..read]);
        }
    }

    pub fn read_to_vec(mut self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.read_into(&mut buf)?;
        Ok(buf)
    }

    /// Discards unread content and the trailing alignment padding.
    pub fn finish(self) -> Result<()> {
        let reader = self.reader;
        if let ReadState::Content { size, remaining } = reader.state {
            if remaining > 0 {
                reader.skip_content(size, remaining)?;
            }
            reader.skip_padding()?;
            reader.state = ReadState::Header;
        }
        Ok(())
    }
}

impl<R: Read> Read for ContentReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_chunk(buf).map_err(io::Error::other)
    }
}
