use std::fs::{self, File};
use std::io;
use std::os::unix::fs::{lchown, symlink, PermissionsExt};
use std::path::Path;

use filefate_core::FileEntry;
use filetime::FileTime;

use crate::layout::scratch_path;

pub fn remove_file_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

pub fn ensure_parent_dir(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent),
        _ => Ok(()),
    }
}

pub fn running_as_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

/// Applies mode, ownership and mtime of `entry` to an open regular file.
pub fn apply_file_metadata(file: &File, entry: &FileEntry) -> io::Result<()> {
    file.set_permissions(fs::Permissions::from_mode(entry.permissions()))?;
    if running_as_root() {
        std::os::unix::fs::fchown(file, Some(entry.uid), Some(entry.gid))?;
    }
    filetime::set_file_handle_times(file, None, Some(mtime_of(entry)))
}

pub fn apply_dir_metadata(path: &Path, entry: &FileEntry) -> io::Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(entry.permissions()))?;
    if running_as_root() {
        lchown(path, Some(entry.uid), Some(entry.gid))?;
    }
    filetime::set_file_mtime(path, mtime_of(entry))
}

/// Creates a symlink at a scratch name beside `dest` and renames it over `dest`.
pub fn place_symlink(target: &Path, dest: &Path, entry: &FileEntry) -> io::Result<()> {
    let scratch = scratch_path(dest);
    remove_file_if_exists(&scratch)?;
    symlink(target, &scratch)?;
    let placed = finish_symlink(&scratch, entry).and_then(|()| fs::rename(&scratch, dest));
    if placed.is_err() {
        let _ = fs::remove_file(&scratch);
    }
    placed
}

fn finish_symlink(path: &Path, entry: &FileEntry) -> io::Result<()> {
    if running_as_root() {
        lchown(path, Some(entry.uid), Some(entry.gid))?;
    }
    let mtime = mtime_of(entry);
    filetime::set_symlink_file_times(path, mtime, mtime)
}

/// Hard links `source` to a scratch name beside `dest`, then renames it over `dest`.
pub fn place_hard_link(source: &Path, dest: &Path) -> io::Result<()> {
    if source == dest {
        return Ok(());
    }
    let scratch = scratch_path(dest);
    remove_file_if_exists(&scratch)?;
    fs::hard_link(source, &scratch)?;
    let placed = fs::rename(&scratch, dest);
    if placed.is_err() {
        let _ = fs::remove_file(&scratch);
    }
    placed
}

fn mtime_of(entry: &FileEntry) -> FileTime {
    FileTime::from_unix_time(i64::from(entry.mtime), 0)
}
