use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::PathBuf;

use filefate_core::PackageManifest;

use crate::fs_utils::remove_file_if_exists;
use crate::registry::{FileRegistry, FileState, SharedFile};
use crate::RootLayout;

/// Post-run state of one manifest file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptFile {
    pub index: usize,
    pub state: FileState,
    pub config: bool,
    pub digest: Option<String>,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReceipt {
    pub name: String,
    pub version: String,
    pub files: Vec<ReceiptFile>,
    pub installed_at_unix: u64,
}

impl InstallReceipt {
    pub fn file(&self, path: &str) -> Option<&ReceiptFile> {
        self.files.iter().find(|file| file.path == path)
    }
}

pub fn write_install_receipt(layout: &RootLayout, receipt: &InstallReceipt) -> Result<PathBuf> {
    let mut payload = String::new();
    payload.push_str(&format!("name={}\n", receipt.name));
    payload.push_str(&format!("version={}\n", receipt.version));
    for file in &receipt.files {
        payload.push_str(&format!(
            "file={}:{}:{}:{}:{}\n",
            file.index,
            file.state.as_str(),
            u8::from(file.config),
            file.digest.as_deref().unwrap_or("-"),
            file.path
        ));
    }
    payload.push_str(&format!(
        "installed_at_unix={}\n",
        receipt.installed_at_unix
    ));

    layout.ensure_state_dirs()?;
    let path = layout.receipt_path(&receipt.name);
    fs::write(&path, payload.as_bytes())
        .with_context(|| format!("failed to write install receipt: {}", path.display()))?;
    Ok(path)
}

pub fn read_install_receipts(layout: &RootLayout) -> Result<Vec<InstallReceipt>> {
    let dir = layout.receipts_dir();
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut receipts = Vec::new();
    for entry in fs::read_dir(&dir)
        .with_context(|| format!("failed to read install state directory: {}", dir.display()))?
    {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }

        let path = entry.path();
        if path.extension().and_then(|v| v.to_str()) != Some("receipt") {
            continue;
        }

        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read install receipt: {}", path.display()))?;
        let receipt = parse_receipt(&raw)
            .with_context(|| format!("failed to parse install receipt: {}", path.display()))?;
        receipts.push(receipt);
    }

    receipts.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(receipts)
}

pub fn read_install_receipt(layout: &RootLayout, name: &str) -> Result<Option<InstallReceipt>> {
    let path = layout.receipt_path(name);
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("failed to read install receipt: {}", path.display()))?;
    let receipt = parse_receipt(&raw)
        .with_context(|| format!("failed to parse install receipt: {}", path.display()))?;
    Ok(Some(receipt))
}

/// Deletes the receipt and the stored manifest of `name`. Returns whether a
/// receipt existed.
pub fn remove_install_receipt(layout: &RootLayout, name: &str) -> Result<bool> {
    let path = layout.receipt_path(name);
    let existed = path.exists();
    remove_file_if_exists(&path)
        .with_context(|| format!("failed to remove install receipt: {}", path.display()))?;
    let manifest_path = layout.installed_manifest_path(name);
    remove_file_if_exists(&manifest_path).with_context(|| {
        format!(
            "failed to remove installed manifest: {}",
            manifest_path.display()
        )
    })?;
    Ok(existed)
}

pub fn write_installed_manifest(
    layout: &RootLayout,
    manifest: &PackageManifest,
) -> Result<PathBuf> {
    layout.ensure_state_dirs()?;
    let path = layout.installed_manifest_path(&manifest.name);
    fs::write(&path, manifest.to_toml_string()?)
        .with_context(|| format!("failed to write installed manifest: {}", path.display()))?;
    Ok(path)
}

pub fn read_installed_manifest(layout: &RootLayout, name: &str) -> Result<PackageManifest> {
    let path = layout.installed_manifest_path(name);
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("failed to read installed manifest: {}", path.display()))?;
    PackageManifest::from_toml_str(&raw)
        .with_context(|| format!("failed to parse installed manifest: {}", path.display()))
}

pub(crate) fn parse_receipt(raw: &str) -> Result<InstallReceipt> {
    let mut name = None;
    let mut version = None;
    let mut files = Vec::new();
    let mut installed_at_unix = None;

    for line in raw.lines().map(str::trim).filter(|line| !line.is_empty()) {
        let Some((k, v)) = line.split_once('=') else {
            continue;
        };
        match k {
            "name" => name = Some(v.to_string()),
            "version" => version = Some(v.to_string()),
            "file" => {
                let file = parse_receipt_file(v).with_context(|| format!("bad file line: {v}"))?;
                files.push(file);
            }
            "installed_at_unix" => {
                installed_at_unix = Some(v.parse().context("installed_at_unix must be u64")?)
            }
            _ => {}
        }
    }

    Ok(InstallReceipt {
        name: name.context("missing name")?,
        version: version.context("missing version")?,
        files,
        installed_at_unix: installed_at_unix.context("missing installed_at_unix")?,
    })
}

fn parse_receipt_file(value: &str) -> Result<ReceiptFile> {
    let mut fields = value.splitn(5, ':');
    let index = next_field(&mut fields, "index")?
        .parse()
        .context("file index must be usize")?;
    let state = FileState::parse(next_field(&mut fields, "state")?)?;
    let config = match next_field(&mut fields, "config")? {
        "0" => false,
        "1" => true,
        other => return Err(anyhow!("config flag must be 0 or 1, got '{other}'")),
    };
    let digest = match next_field(&mut fields, "digest")? {
        "-" => None,
        digest => Some(digest.to_string()),
    };
    let path = next_field(&mut fields, "path")?.to_string();

    Ok(ReceiptFile {
        index,
        state,
        config,
        digest,
        path,
    })
}

fn next_field<'a>(fields: &mut std::str::SplitN<'a, char>, field: &str) -> Result<&'a str> {
    fields
        .next()
        .ok_or_else(|| anyhow!("missing {field} field"))
}

/// Snapshot of a finished install run, ready to be written.
pub fn receipt_from_registry(
    manifest: &PackageManifest,
    registry: &FileRegistry,
    installed_at_unix: u64,
) -> InstallReceipt {
    let files = manifest
        .files
        .iter()
        .zip(registry.states())
        .enumerate()
        .map(|(index, (entry, state))| ReceiptFile {
            index,
            state,
            config: entry.flags.config,
            digest: entry.digest.clone(),
            path: entry.path.clone(),
        })
        .collect();
    InstallReceipt {
        name: manifest.name.clone(),
        version: manifest.version.to_string(),
        files,
        installed_at_unix,
    }
}

/// Seeds a registry for erasing `manifest` with the states its receipt recorded.
/// Files the receipt does not mention count as not installed.
pub fn registry_for_erase(manifest: &PackageManifest, receipt: &InstallReceipt) -> FileRegistry {
    let mut registry = FileRegistry::new(manifest.len(), FileState::NotInstalled);
    for (index, entry) in manifest.files.iter().enumerate() {
        if let Some(file) = receipt.file(&entry.path) {
            registry.set_state(index, file.state);
        }
    }
    registry
}

/// Adds a shared-path record for every path of `manifest` that another
/// package's receipt also lists. Returns the number of records added.
pub fn add_shared_from_receipts(
    manifest: &PackageManifest,
    receipts: &[InstallReceipt],
    registry: &mut FileRegistry,
) -> usize {
    let mut added = 0;
    for (index, entry) in manifest.files.iter().enumerate() {
        for receipt in receipts.iter().filter(|receipt| receipt.name != manifest.name) {
            let Some(file) = receipt.file(&entry.path) else {
                continue;
            };
            registry.add_shared(
                index,
                SharedFile {
                    other_package: receipt.name.clone(),
                    other_index: file.index,
                    other_state: file.state,
                    other_config: file.config,
                    other_digest: file.digest.clone(),
                },
            );
            added += 1;
        }
    }
    added
}
