use std::fmt;

use crate::error::ArchiveError;
use crate::Result;

pub(crate) const NEWC_MAGIC: &[u8; 6] = b"070701";
pub(crate) const CRC_MAGIC: &[u8; 6] = b"070702";
pub(crate) const STRIPPED_MAGIC: &[u8; 6] = b"07070X";
pub(crate) const MAGIC_LEN: usize = 6;
const FIELD_LEN: usize = 8;

pub const TRAILER_NAME: &str = "TRAILER!!!";
pub const FULL_HEADER_LEN: usize = MAGIC_LEN + 13 * FIELD_LEN;
pub const STRIPPED_HEADER_LEN: usize = MAGIC_LEN + FIELD_LEN;
pub const ALIGNMENT: u64 = 4;
/// Upper bound on an entry name, including its terminating NUL.
pub const MAX_NAME_LEN: u32 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeaderForm {
    Full,
    Stripped,
}

impl HeaderForm {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Stripped => "stripped",
        }
    }
}

impl fmt::Display for HeaderForm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Numeric stat fields carried by a full header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Metadata {
    pub ino: u32,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub mtime: u32,
    pub dev_major: u32,
    pub dev_minor: u32,
    pub rdev_major: u32,
    pub rdev_minor: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullHeader {
    pub name: String,
    pub metadata: Metadata,
    pub size: u64,
}

/// A header to encode. Stripped headers carry their content size here so the
/// writer can check the content it is handed; the size is not written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Header {
    Full(FullHeader),
    Stripped { index: u32, size: u64 },
}

impl Header {
    pub fn form(&self) -> HeaderForm {
        match self {
            Self::Full(_) => HeaderForm::Full,
            Self::Stripped { .. } => HeaderForm::Stripped,
        }
    }

    pub fn content_size(&self) -> u64 {
        match self {
            Self::Full(header) => header.size,
            Self::Stripped { size, .. } => *size,
        }
    }
}

pub(crate) fn padding(offset: u64) -> u64 {
    (ALIGNMENT - offset % ALIGNMENT) % ALIGNMENT
}

pub(crate) fn trailer() -> FullHeader {
    FullHeader {
        name: TRAILER_NAME.to_string(),
        metadata: Metadata {
            nlink: 1,
            ..Metadata::default()
        },
        size: 0,
    }
}

pub(crate) fn parse_hex_field(raw: &[u8], field: &str, offset: u64) -> Result<u32> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| ArchiveError::format(offset, format!("{field} field is not ASCII")))?;
    if text.len() != FIELD_LEN || !text.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ArchiveError::format(
            offset,
            format!("{field} field '{text}' is not an 8 digit hex number"),
        ));
    }
    u32::from_str_radix(text, 16)
        .map_err(|err| ArchiveError::format(offset, format!("{field} field: {err}")))
}

/// Decodes the 13 numeric fields that follow the magic of a full header.
/// Returns the metadata, content size and name size.
pub(crate) fn decode_full_fields(raw: &[u8], offset: u64) -> Result<(Metadata, u64, u32)> {
    let field = |index: usize, name: &str| {
        let start = index * FIELD_LEN;
        parse_hex_field(&raw[start..start + FIELD_LEN], name, offset)
    };

    let metadata = Metadata {
        ino: field(0, "inode")?,
        mode: field(1, "mode")?,
        uid: field(2, "uid")?,
        gid: field(3, "gid")?,
        nlink: field(4, "nlink")?,
        mtime: field(5, "mtime")?,
        dev_major: field(7, "devmajor")?,
        dev_minor: field(8, "devminor")?,
        rdev_major: field(9, "rdevmajor")?,
        rdev_minor: field(10, "rdevminor")?,
    };
    let size = u64::from(field(6, "filesize")?);
    let name_size = field(11, "namesize")?;
    // checksum (field 12) is validated for shape only
    field(12, "checksum")?;

    Ok((metadata, size, name_size))
}

pub(crate) fn encode_full(header: &FullHeader, offset: u64) -> Result<Vec<u8>> {
    let size = u32::try_from(header.size).map_err(|_| {
        ArchiveError::format(
            offset,
            format!("content size {} does not fit a header field", header.size),
        )
    })?;
    if header.name.contains('\0') {
        return Err(ArchiveError::format(offset, "entry name contains NUL"));
    }
    let name_size = header.name.len() + 1;
    if name_size as u64 > u64::from(MAX_NAME_LEN) {
        return Err(ArchiveError::format(
            offset,
            format!("entry name is {name_size} bytes, limit is {MAX_NAME_LEN}"),
        ));
    }

    let meta = &header.metadata;
    let mut out = Vec::with_capacity(FULL_HEADER_LEN + name_size + 3);
    out.extend_from_slice(NEWC_MAGIC);
    for value in [
        meta.ino,
        meta.mode,
        meta.uid,
        meta.gid,
        meta.nlink,
        meta.mtime,
        size,
        meta.dev_major,
        meta.dev_minor,
        meta.rdev_major,
        meta.rdev_minor,
        name_size as u32,
        0,
    ] {
        out.extend_from_slice(format!("{value:08x}").as_bytes());
    }
    out.extend_from_slice(header.name.as_bytes());
    out.push(0);
    Ok(out)
}

pub(crate) fn encode_stripped(index: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(STRIPPED_HEADER_LEN);
    out.extend_from_slice(STRIPPED_MAGIC);
    out.extend_from_slice(format!("{index:08x}").as_bytes());
    out
}
