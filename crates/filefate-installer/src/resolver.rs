use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use filefate_core::{sha256_file_hex, FileEntry, FileKind};
use tracing::debug;

use crate::registry::{FileAction, FileState, SharedFile};

/// What currently occupies the destination path of a manifest entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiskCondition {
    Missing,
    /// Same file type and, for files and symlinks, the shipped content.
    Matches,
    Differs,
    /// An entry of another file type occupies the path.
    WrongType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub action: FileAction,
    /// State to record once the action has been applied; `None` leaves the
    /// registry state untouched.
    pub state: Option<FileState>,
    pub conflict: bool,
}

impl Decision {
    fn act(action: FileAction, state: FileState) -> Self {
        Self {
            action,
            state: Some(state),
            conflict: false,
        }
    }

    fn skip(state: Option<FileState>) -> Self {
        Self {
            action: FileAction::Skip,
            state,
            conflict: false,
        }
    }
}

/// Decides what an install does with one manifest entry.
pub fn resolve_install<'a, I>(
    entry: &FileEntry,
    condition: DiskCondition,
    shared: I,
    exclude_docs: bool,
) -> Decision
where
    I: IntoIterator<Item = &'a SharedFile>,
{
    let flags = entry.flags;
    if flags.ghost {
        return Decision::skip(Some(FileState::Skipped));
    }
    if flags.doc && exclude_docs {
        return Decision::skip(Some(FileState::NotInstalled));
    }
    if entry.is_dir() {
        return Decision::act(FileAction::Create, FileState::Installed);
    }

    let mut claimed = false;
    let mut config_claim = flags.config;
    let mut conflict = false;
    for record in shared {
        if !record.other_state.holds_path() {
            continue;
        }
        claimed = true;
        config_claim |= record.other_config;
        if let (Some(theirs), Some(ours)) = (&record.other_digest, &entry.digest) {
            if !theirs.eq_ignore_ascii_case(ours) {
                conflict = true;
            }
        }
    }
    if claimed && !config_claim {
        if conflict {
            return Decision {
                action: FileAction::Skip,
                state: Some(FileState::Skipped),
                conflict: true,
            };
        }
        return Decision::skip(Some(FileState::Replaced));
    }

    if flags.config {
        match condition {
            DiskCondition::Differs | DiskCondition::WrongType => {
                return Decision::act(FileAction::Backup, FileState::Installed);
            }
            DiskCondition::Matches if flags.noreplace => {
                return Decision::skip(Some(FileState::Installed));
            }
            _ => {}
        }
    }

    Decision::act(FileAction::Create, FileState::Installed)
}

/// Decides what an erase does with one manifest entry recorded in `recorded`.
pub fn resolve_erase<'a, I>(
    entry: &FileEntry,
    recorded: FileState,
    condition: DiskCondition,
    shared: I,
) -> Decision
where
    I: IntoIterator<Item = &'a SharedFile>,
{
    if !recorded.is_live_claim() {
        return Decision::skip(None);
    }
    if shared
        .into_iter()
        .any(|record| record.other_state.is_live_claim())
    {
        return Decision::skip(Some(FileState::Skipped));
    }
    if entry.is_dir() {
        return Decision::act(FileAction::RemoveIfLast, FileState::Removed);
    }
    if entry.flags.config && entry.is_regular() && condition == DiskCondition::Differs {
        return Decision::act(FileAction::Backup, FileState::Removed);
    }
    Decision::act(FileAction::Remove, FileState::Removed)
}

/// Inspects `path` and classifies it against `entry`. Errors other than a
/// missing path are reported as `Differs`.
pub fn probe_disk(entry: &FileEntry, path: &Path) -> DiskCondition {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if is_absent(&err) => return DiskCondition::Missing,
        Err(err) => {
            debug!(path = %path.display(), error = %err, "could not inspect existing path");
            return DiskCondition::Differs;
        }
    };

    let on_disk = FileKind::from_mode(metadata.mode());
    if on_disk != entry.kind() {
        return DiskCondition::WrongType;
    }

    match on_disk {
        Some(FileKind::Regular) => {
            let Some(expected) = entry.digest.as_deref() else {
                return DiskCondition::Differs;
            };
            if metadata.len() != entry.size {
                return DiskCondition::Differs;
            }
            match sha256_file_hex(path) {
                Ok(actual) if actual.eq_ignore_ascii_case(expected) => DiskCondition::Matches,
                Ok(_) => DiskCondition::Differs,
                Err(err) => {
                    debug!(path = %path.display(), error = %err, "could not hash existing file");
                    DiskCondition::Differs
                }
            }
        }
        Some(FileKind::Symlink) => match (fs::read_link(path), entry.link_to.as_deref()) {
            (Ok(target), Some(expected)) if target == Path::new(expected) => {
                DiskCondition::Matches
            }
            _ => DiskCondition::Differs,
        },
        _ => DiskCondition::Matches,
    }
}

pub(crate) fn is_absent(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::NotFound || err.raw_os_error() == Some(libc::ENOTDIR)
}
