mod digest;
mod entry;
mod manifest;

pub use digest::{is_sha256_hex, sha256_file_hex, sha256_hex, DigestWriter};
pub use entry::{FileEntry, FileFlags, FileKind};
pub use manifest::PackageManifest;
