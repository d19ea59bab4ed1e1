use serde::{Deserialize, Serialize};

const S_IFMT: u32 = 0o170_000;
const S_IFSOCK: u32 = 0o140_000;
const S_IFLNK: u32 = 0o120_000;
const S_IFREG: u32 = 0o100_000;
const S_IFBLK: u32 = 0o060_000;
const S_IFDIR: u32 = 0o040_000;
const S_IFCHR: u32 = 0o020_000;
const S_IFIFO: u32 = 0o010_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
    CharDevice,
    BlockDevice,
    Fifo,
    Socket,
}

impl FileKind {
    pub fn from_mode(mode: u32) -> Option<Self> {
        match mode & S_IFMT {
            S_IFREG => Some(Self::Regular),
            S_IFDIR => Some(Self::Directory),
            S_IFLNK => Some(Self::Symlink),
            S_IFCHR => Some(Self::CharDevice),
            S_IFBLK => Some(Self::BlockDevice),
            S_IFIFO => Some(Self::Fifo),
            S_IFSOCK => Some(Self::Socket),
            _ => None,
        }
    }

    pub fn type_bits(self) -> u32 {
        match self {
            Self::Regular => S_IFREG,
            Self::Directory => S_IFDIR,
            Self::Symlink => S_IFLNK,
            Self::CharDevice => S_IFCHR,
            Self::BlockDevice => S_IFBLK,
            Self::Fifo => S_IFIFO,
            Self::Socket => S_IFSOCK,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Regular => "file",
            Self::Directory => "directory",
            Self::Symlink => "symlink",
            Self::CharDevice => "char-device",
            Self::BlockDevice => "block-device",
            Self::Fifo => "fifo",
            Self::Socket => "socket",
        }
    }

    /// Kinds the installer knows how to materialize.
    pub fn is_supported(self) -> bool {
        matches!(self, Self::Regular | Self::Directory | Self::Symlink)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FileFlags {
    pub config: bool,
    pub doc: bool,
    pub ghost: bool,
    pub missingok: bool,
    pub noreplace: bool,
}

impl FileFlags {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileEntry {
    pub path: String,
    pub mode: u32,
    #[serde(default)]
    pub uid: u32,
    #[serde(default)]
    pub gid: u32,
    #[serde(default)]
    pub mtime: u32,
    #[serde(default)]
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_group: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_to: Option<String>,
    #[serde(default, skip_serializing_if = "FileFlags::is_empty")]
    pub flags: FileFlags,
}

impl FileEntry {
    pub fn kind(&self) -> Option<FileKind> {
        FileKind::from_mode(self.mode)
    }

    pub fn is_dir(&self) -> bool {
        self.kind() == Some(FileKind::Directory)
    }

    pub fn is_regular(&self) -> bool {
        self.kind() == Some(FileKind::Regular)
    }

    pub fn is_symlink(&self) -> bool {
        self.kind() == Some(FileKind::Symlink)
    }

    pub fn permissions(&self) -> u32 {
        self.mode & 0o7777
    }

    /// Name used for this entry inside a payload archive: `/usr/bin/tool` becomes
    /// `./usr/bin/tool`.
    pub fn archive_name(&self) -> String {
        archive_name_for(&self.path)
    }

    /// Path relative to an install root, without the leading slash.
    pub fn relative_path(&self) -> &str {
        self.path.trim_start_matches('/')
    }

    /// Whether this entry has a record in the payload archive.
    pub fn in_payload(&self) -> bool {
        !self.flags.ghost
    }
}

pub(crate) fn archive_name_for(path: &str) -> String {
    format!("./{}", path.trim_start_matches('/'))
}
