use anyhow::{anyhow, bail, Context, Result};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use filefate_archive::{ArchiveWriter, FullHeader, Header, HeaderForm, Metadata};
use filefate_core::{sha256_file_hex, FileEntry, FileFlags, FileKind, PackageManifest};
use semver::Version;
use tracing::debug;
use walkdir::WalkDir;

/// Builds a manifest describing every entry below `source`. Paths are rooted
/// at `/`; regular files that share an inode inside the tree form a hard link
/// group.
pub fn scan_tree(source: &Path, name: &str, version: Version) -> Result<PackageManifest> {
    let mut files = Vec::new();
    let mut inodes: HashMap<(u64, u64), Vec<usize>> = HashMap::new();

    for item in WalkDir::new(source)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
    {
        let item = item.with_context(|| format!("failed to walk {}", source.display()))?;
        let rel = item
            .path()
            .strip_prefix(source)
            .with_context(|| format!("{} is outside the source tree", item.path().display()))?;
        let rel = rel
            .to_str()
            .ok_or_else(|| anyhow!("path is not valid UTF-8: {}", rel.display()))?;
        let metadata = fs::symlink_metadata(item.path())
            .with_context(|| format!("failed to stat {}", item.path().display()))?;

        let kind = FileKind::from_mode(metadata.mode())
            .filter(|kind| kind.is_supported())
            .ok_or_else(|| anyhow!("unsupported file type at {}", item.path().display()))?;
        let mut entry = FileEntry {
            path: format!("/{rel}"),
            mode: metadata.mode(),
            uid: metadata.uid(),
            gid: metadata.gid(),
            mtime: u32::try_from(metadata.mtime()).unwrap_or(0),
            size: 0,
            digest: None,
            link_group: None,
            link_to: None,
            flags: FileFlags::default(),
        };
        match kind {
            FileKind::Regular => {
                entry.size = metadata.len();
                entry.digest = Some(
                    sha256_file_hex(item.path())
                        .with_context(|| format!("failed to hash {}", item.path().display()))?,
                );
                if metadata.nlink() > 1 {
                    inodes
                        .entry((metadata.dev(), metadata.ino()))
                        .or_default()
                        .push(files.len());
                }
            }
            FileKind::Symlink => {
                let target = fs::read_link(item.path())
                    .with_context(|| format!("failed to read link {}", item.path().display()))?;
                let target = target.to_str().ok_or_else(|| {
                    anyhow!("link target is not valid UTF-8: {}", target.display())
                })?;
                entry.size = target.len() as u64;
                entry.link_to = Some(target.to_string());
            }
            _ => {}
        }
        files.push(entry);
    }

    let mut groups = inodes
        .into_values()
        .filter(|members| members.len() > 1)
        .collect::<Vec<_>>();
    groups.sort();
    for (group, members) in groups.into_iter().enumerate() {
        for index in members {
            files[index].link_group = Some(group as u32 + 1);
        }
    }

    let manifest = PackageManifest {
        name: name.to_string(),
        version,
        files,
    };
    manifest.validate().with_context(|| {
        format!(
            "scanned tree {} does not form a valid manifest",
            source.display()
        )
    })?;
    Ok(manifest)
}

/// Writes one record per non-ghost manifest entry, reading content from the
/// matching path below `source`, then closes the archive. Only the last member
/// of a hard link group carries content. Returns the number of records.
pub fn write_payload<W: Write>(
    manifest: &PackageManifest,
    source: &Path,
    writer: &mut ArchiveWriter<W>,
) -> Result<usize> {
    let groups = manifest.link_groups();
    let content_sizes = manifest.payload_content_sizes();
    let mut records = 0;

    for (index, entry) in manifest.files.iter().enumerate() {
        if !entry.in_payload() {
            continue;
        }
        let size = content_sizes[index];
        let header = match writer.form() {
            HeaderForm::Full => {
                let (ino, nlink) = match entry.link_group.and_then(|group| groups.get(&group)) {
                    Some(members) => (members[0] as u32 + 1, members.len() as u32),
                    None => (index as u32 + 1, 1),
                };
                Header::Full(FullHeader {
                    name: entry.archive_name(),
                    metadata: Metadata {
                        ino,
                        mode: entry.mode,
                        uid: entry.uid,
                        gid: entry.gid,
                        nlink,
                        mtime: entry.mtime,
                        ..Metadata::default()
                    },
                    size,
                })
            }
            HeaderForm::Stripped => Header::Stripped {
                index: u32::try_from(index).context("manifest has too many files")?,
                size,
            },
        };
        writer
            .write_header(&header)
            .with_context(|| format!("failed to write header for {}", entry.path))?;

        match entry.kind() {
            Some(FileKind::Symlink) => {
                let target = entry.link_to.as_deref().unwrap_or_default();
                writer
                    .write_content(target.as_bytes())
                    .with_context(|| format!("failed to write link target for {}", entry.path))?;
            }
            Some(FileKind::Regular) if size > 0 => {
                copy_content(&source.join(entry.relative_path()), entry, writer)?;
            }
            _ => {}
        }
        debug!(path = %entry.path, size, "packed entry");
        records += 1;
    }

    writer.close().context("failed to finish payload archive")?;
    Ok(records)
}

fn copy_content<W: Write>(
    path: &Path,
    entry: &FileEntry,
    writer: &mut ArchiveWriter<W>,
) -> Result<()> {
    let mut file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut buf = vec![0_u8; 64 * 1024];
    let mut copied = 0_u64;
    loop {
        let read = file
            .read(&mut buf)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if read == 0 {
            break;
        }
        copied += read as u64;
        if copied > entry.size {
            bail!(
                "{} grew past the {} bytes the manifest declares",
                path.display(),
                entry.size
            );
        }
        writer
            .write_content(&buf[..read])
            .with_context(|| format!("failed to write content for {}", entry.path))?;
    }
    if copied != entry.size {
        bail!(
            "{} has {copied} bytes, the manifest declares {}",
            path.display(),
            entry.size
        );
    }
    Ok(())
}
