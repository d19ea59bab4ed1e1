use anyhow::{Context, Result};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

/// Suffix of the sibling that receives shipped content when a locally
/// modified config file is kept in place.
pub const NEW_SUFFIX: &str = ".pkgnew";
/// Suffix a locally modified config file is renamed to on erase.
pub const SAVE_SUFFIX: &str = ".pkgsave";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootLayout {
    root: PathBuf,
}

impl RootLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps an absolute manifest path below the install root.
    pub fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join("var").join("lib").join("filefate")
    }

    pub fn receipts_dir(&self) -> PathBuf {
        self.state_dir().join("installed")
    }

    pub fn receipt_path(&self, name: &str) -> PathBuf {
        self.receipts_dir().join(format!("{name}.receipt"))
    }

    /// Copy of the manifest an installed package was materialized from.
    pub fn installed_manifest_path(&self, name: &str) -> PathBuf {
        self.receipts_dir().join(format!("{name}.manifest.toml"))
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("etc").join("filefate.toml")
    }

    pub fn ensure_state_dirs(&self) -> Result<()> {
        for dir in [self.state_dir(), self.receipts_dir()] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

pub(crate) fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut raw = OsString::from(path.as_os_str());
    raw.push(suffix);
    PathBuf::from(raw)
}

/// Deterministic scratch name next to `path`, used for links that are
/// created and then renamed into place.
pub(crate) fn scratch_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(".");
    if let Some(file_name) = path.file_name() {
        name.push(file_name);
    }
    name.push(format!(";{:x}", std::process::id()));
    match path.parent() {
        Some(parent) => parent.join(name),
        None => PathBuf::from(name),
    }
}
