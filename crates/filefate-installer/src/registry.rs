use anyhow::{anyhow, Result};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileState {
    Pending,
    Installed,
    Replaced,
    Removed,
    NotInstalled,
    Skipped,
}

impl FileState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Installed => "installed",
            Self::Replaced => "replaced",
            Self::Removed => "removed",
            Self::NotInstalled => "not-installed",
            Self::Skipped => "skipped",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(Self::Pending),
            "installed" => Ok(Self::Installed),
            "replaced" => Ok(Self::Replaced),
            "removed" => Ok(Self::Removed),
            "not-installed" => Ok(Self::NotInstalled),
            "skipped" => Ok(Self::Skipped),
            _ => Err(anyhow!("invalid file state: {value}")),
        }
    }

    /// Whether a package recorded in this state still has a claim on the path.
    pub fn holds_path(self) -> bool {
        matches!(self, Self::Installed | Self::Replaced)
    }

    /// Claims that keep erase from unlinking a shared path.
    pub fn is_live_claim(self) -> bool {
        self.holds_path() || self == Self::Pending
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileAction {
    Create,
    Backup,
    Skip,
    Remove,
    RemoveIfLast,
}

impl FileAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Backup => "backup",
            Self::Skip => "skip",
            Self::Remove => "remove",
            Self::RemoveIfLast => "remove-if-last",
        }
    }

    pub fn writes_content(self) -> bool {
        matches!(self, Self::Create | Self::Backup)
    }
}

/// Another package's claim on a path this package also ships.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedFile {
    pub other_package: String,
    pub other_index: usize,
    pub other_state: FileState,
    pub other_config: bool,
    pub other_digest: Option<String>,
}

#[derive(Debug, Clone, Copy)]
struct RegistryEntry {
    state: FileState,
    action: Option<FileAction>,
}

/// Per-run state and action of every manifest file index, plus the shared-path
/// side table supplied by the orchestrator.
#[derive(Debug, Clone)]
pub struct FileRegistry {
    entries: Vec<RegistryEntry>,
    shared: Vec<SharedFile>,
    shared_by_owner: HashMap<usize, Vec<usize>>,
}

impl FileRegistry {
    pub fn new(file_count: usize, initial: FileState) -> Self {
        Self {
            entries: vec![
                RegistryEntry {
                    state: initial,
                    action: None,
                };
                file_count
            ],
            shared: Vec::new(),
            shared_by_owner: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn state(&self, index: usize) -> FileState {
        self.entry(index).state
    }

    pub fn set_state(&mut self, index: usize, state: FileState) {
        self.entry_mut(index).state = state;
    }

    pub fn action(&self, index: usize) -> Option<FileAction> {
        self.entry(index).action
    }

    pub fn set_action(&mut self, index: usize, action: FileAction) {
        self.entry_mut(index).action = Some(action);
    }

    pub fn reset_actions(&mut self) {
        for entry in &mut self.entries {
            entry.action = None;
        }
    }

    pub fn states(&self) -> impl ExactSizeIterator<Item = FileState> + '_ {
        self.entries.iter().map(|entry| entry.state)
    }

    pub fn add_shared(&mut self, owner_index: usize, record: SharedFile) {
        self.check_index(owner_index);
        let position = self.shared.len();
        self.shared.push(record);
        self.shared_by_owner
            .entry(owner_index)
            .or_default()
            .push(position);
    }

    pub fn iter_shared(&self, owner_index: usize) -> SharedIter<'_> {
        let positions = self
            .shared_by_owner
            .get(&owner_index)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        SharedIter {
            records: &self.shared,
            positions: positions.iter(),
        }
    }

    pub fn shared_len(&self) -> usize {
        self.shared.len()
    }

    fn check_index(&self, index: usize) {
        assert!(
            index < self.entries.len(),
            "file index {index} out of range for a registry of {} files",
            self.entries.len()
        );
    }

    fn entry(&self, index: usize) -> &RegistryEntry {
        self.check_index(index);
        &self.entries[index]
    }

    fn entry_mut(&mut self, index: usize) -> &mut RegistryEntry {
        self.check_index(index);
        &mut self.entries[index]
    }
}

/// Shared-path records of one file index, in insertion order.
#[derive(Debug, Clone)]
pub struct SharedIter<'a> {
    records: &'a [SharedFile],
    positions: std::slice::Iter<'a, usize>,
}

impl<'a> Iterator for SharedIter<'a> {
    type Item = &'a SharedFile;

    fn next(&mut self) -> Option<Self::Item> {
        self.positions
            .next()
            .map(|position| &self.records[*position])
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.positions.size_hint()
    }
}

impl ExactSizeIterator for SharedIter<'_> {}
