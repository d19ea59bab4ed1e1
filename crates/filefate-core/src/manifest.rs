use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Component, Path};

use anyhow::{anyhow, Context};
use semver::Version;
use serde::{Deserialize, Serialize};

use crate::digest::is_sha256_hex;
use crate::entry::{FileEntry, FileKind};

/// Largest value a payload header can carry in one of its numeric fields.
const MAX_FIELD_VALUE: u64 = u32::MAX as u64;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PackageManifest {
    pub name: String,
    pub version: Version,
    #[serde(default)]
    pub files: Vec<FileEntry>,
}

impl PackageManifest {
    pub fn from_toml_str(input: &str) -> anyhow::Result<Self> {
        let manifest: Self = toml::from_str(input).context("failed to parse filefate manifest")?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        toml::to_string_pretty(self).context("failed to serialize filefate manifest")
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.name.trim().is_empty() {
            return Err(anyhow!("manifest name must not be empty"));
        }

        let mut seen_paths = HashSet::new();
        for entry in &self.files {
            validate_file_path(&entry.path)
                .with_context(|| format!("invalid file path '{}'", entry.path))?;
            if !seen_paths.insert(entry.path.as_str()) {
                return Err(anyhow!("duplicate file path '{}'", entry.path));
            }
            validate_entry(entry).with_context(|| format!("invalid file entry '{}'", entry.path))?;
        }

        for (group, members) in self.link_groups() {
            let first = &self.files[members[0]];
            for &index in &members[1..] {
                let member = &self.files[index];
                if member.size != first.size || member.digest != first.digest {
                    return Err(anyhow!(
                        "hard link group {group} members '{}' and '{}' disagree on content",
                        first.path,
                        member.path
                    ));
                }
            }
        }

        Ok(())
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn position(&self, path: &str) -> Option<usize> {
        self.files.iter().position(|entry| entry.path == path)
    }

    /// Hard link groups keyed by group id, members listed in file index order.
    pub fn link_groups(&self) -> BTreeMap<u32, Vec<usize>> {
        let mut groups: BTreeMap<u32, Vec<usize>> = BTreeMap::new();
        for (index, entry) in self.files.iter().enumerate() {
            if let Some(group) = entry.link_group {
                groups.entry(group).or_default().push(index);
            }
        }
        groups
    }

    /// Bytes of file content the payload carries for this manifest; every hard
    /// link group counts once.
    pub fn payload_size(&self) -> u64 {
        let mut counted_groups = HashSet::new();
        self.files
            .iter()
            .filter(|entry| entry.in_payload())
            .filter(|entry| match entry.link_group {
                Some(group) => counted_groups.insert(group),
                None => true,
            })
            .map(|entry| entry.size)
            .sum()
    }

    /// Content length the payload declares for each entry, in file index
    /// order. Only the last payload member of a hard link group carries
    /// content; directories and entries outside the payload carry nothing.
    pub fn payload_content_sizes(&self) -> Vec<u64> {
        let mut carriers = HashMap::new();
        for (index, entry) in self.files.iter().enumerate() {
            if let (Some(group), true) = (entry.link_group, entry.in_payload()) {
                carriers.insert(group, index);
            }
        }

        self.files
            .iter()
            .enumerate()
            .map(|(index, entry)| {
                if !entry.in_payload() {
                    return 0;
                }
                match entry.kind() {
                    Some(FileKind::Symlink) => {
                        entry.link_to.as_deref().map_or(0, |target| target.len() as u64)
                    }
                    Some(FileKind::Regular) => match entry.link_group {
                        Some(group) if carriers.get(&group) != Some(&index) => 0,
                        _ => entry.size,
                    },
                    _ => 0,
                }
            })
            .collect()
    }
}

fn validate_file_path(path: &str) -> anyhow::Result<()> {
    if path.contains('\0') {
        return Err(anyhow!("path must not contain NUL bytes"));
    }
    if path.chars().any(char::is_control) {
        return Err(anyhow!("path must not contain control characters"));
    }
    if !path.starts_with('/') {
        return Err(anyhow!("path must be absolute"));
    }
    if path.len() > 1 && path.ends_with('/') {
        return Err(anyhow!("path must not end with '/'"));
    }
    if Path::new(path)
        .components()
        .any(|component| matches!(component, Component::ParentDir | Component::CurDir))
    {
        return Err(anyhow!("path must not contain '.' or '..' components"));
    }
    Ok(())
}

fn validate_entry(entry: &FileEntry) -> anyhow::Result<()> {
    let kind = entry
        .kind()
        .ok_or_else(|| anyhow!("unknown file type in mode {:o}", entry.mode))?;
    if !kind.is_supported() {
        return Err(anyhow!("unsupported file type '{}'", kind.as_str()));
    }
    if entry.size > MAX_FIELD_VALUE {
        return Err(anyhow!("file size {} exceeds payload limit", entry.size));
    }

    match kind {
        FileKind::Symlink => {
            let target = entry
                .link_to
                .as_deref()
                .filter(|target| !target.is_empty())
                .ok_or_else(|| anyhow!("symlink requires a non-empty link_to"))?;
            if entry.size != target.len() as u64 {
                return Err(anyhow!(
                    "symlink size {} does not match target length {}",
                    entry.size,
                    target.len()
                ));
            }
        }
        FileKind::Directory if entry.size != 0 => {
            return Err(anyhow!("directory size must be 0"));
        }
        _ => {
            if entry.link_to.is_some() {
                return Err(anyhow!("link_to is only valid for symlinks"));
            }
        }
    }

    if entry.link_group.is_some() {
        if kind != FileKind::Regular {
            return Err(anyhow!("hard link groups may only contain regular files"));
        }
        if entry.flags.ghost {
            return Err(anyhow!("ghost files cannot be hard linked"));
        }
    }

    if let Some(digest) = &entry.digest {
        if !is_sha256_hex(digest) {
            return Err(anyhow!("digest must be a 64 character sha256 hex string"));
        }
    }

    Ok(())
}
