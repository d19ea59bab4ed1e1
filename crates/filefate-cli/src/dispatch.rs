use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail, Context, Result};
use filefate_archive::{ArchiveReader, ArchiveWriter, HeaderForm};
use filefate_core::PackageManifest;
use filefate_installer::{
    add_shared_from_receipts, install_files, read_install_receipt, read_install_receipts,
    read_installed_manifest, receipt_from_registry, registry_for_erase, remove_files,
    remove_install_receipt, scan_tree, write_install_receipt, write_installed_manifest,
    write_payload, FileRegistry, FileState, InstallReceipt, RootLayout, RunOptions, RunReport,
};
use semver::Version;
use serde::Serialize;
use tracing::{debug, info};

use crate::completion::write_completions_script;
use crate::render::{OutputStyle, TerminalRenderer};
use crate::{Cli, Commands, PolicyArgs};

pub(crate) fn run_cli(cli: Cli) -> Result<()> {
    let layout = RootLayout::new(cli.root);

    match cli.command {
        Commands::Scan {
            source,
            name,
            pkg_version,
            config_files,
            doc_files,
            output,
        } => {
            let version = Version::parse(&pkg_version)
                .with_context(|| format!("invalid package version '{pkg_version}'"))?;
            let mut manifest = scan_tree(&source, &name, version)?;
            mark_files(&mut manifest, &config_files, &doc_files)?;
            let rendered = manifest.to_toml_string()?;
            match output {
                Some(path) => {
                    fs::write(&path, rendered)
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    TerminalRenderer::current().print_status(
                        "ok",
                        &format!("described {} entries in {}", manifest.len(), path.display()),
                    );
                }
                None => print!("{rendered}"),
            }
        }
        Commands::Pack {
            manifest,
            source,
            output,
            stripped,
        } => {
            let manifest = load_manifest(&manifest)?;
            let form = if stripped {
                HeaderForm::Stripped
            } else {
                HeaderForm::Full
            };
            let file = File::create(&output)
                .with_context(|| format!("failed to create {}", output.display()))?;
            let mut writer = ArchiveWriter::new(BufWriter::new(file), form);
            let records = write_payload(&manifest, &source, &mut writer)?;
            drop(writer);
            TerminalRenderer::current().print_status(
                "ok",
                &format!(
                    "packed {records} records for {} {} into {} ({} headers)",
                    manifest.name,
                    manifest.version,
                    output.display(),
                    form.as_str()
                ),
            );
        }
        Commands::List { json } => {
            let receipts = read_install_receipts(&layout)?;
            if json {
                println!("{}", format_list_json(&receipts)?);
            } else {
                let renderer = TerminalRenderer::current();
                if receipts.is_empty() {
                    renderer.print_status("info", "no packages installed");
                } else {
                    renderer.print_lines(&format_list_lines(&receipts, renderer.style()));
                }
            }
        }
        Commands::Install {
            manifest,
            payload,
            policy,
        } => {
            let options = load_run_options(&layout, cli.config.as_deref(), &policy)?;
            run_install(&layout, &manifest, &payload, &options)?;
        }
        Commands::Erase { name, policy } => {
            let options = load_run_options(&layout, cli.config.as_deref(), &policy)?;
            run_erase(&layout, &name, &options)?;
        }
        Commands::Completions { shell } => {
            let mut stdout = io::stdout().lock();
            write_completions_script(shell, &mut stdout)?;
        }
    }

    Ok(())
}

fn run_install(
    layout: &RootLayout,
    manifest_path: &Path,
    payload_path: &Path,
    options: &RunOptions,
) -> Result<()> {
    let manifest = load_manifest(manifest_path)?;
    let receipts = read_install_receipts(layout)?;
    let mut registry = FileRegistry::new(manifest.len(), FileState::Pending);
    let shared = add_shared_from_receipts(&manifest, &receipts, &mut registry);
    debug!(package = %manifest.name, shared, "loaded shared path records");

    let file = File::open(payload_path)
        .with_context(|| format!("failed to open payload {}", payload_path.display()))?;
    let mut reader = ArchiveReader::new(BufReader::new(file));

    let renderer = TerminalRenderer::current();
    let mut progress = renderer.start_progress("install");
    let outcome = install_files(
        layout,
        &manifest,
        &mut registry,
        &mut reader,
        options,
        |event| progress.observe(event),
    );

    let report = match outcome {
        Ok(report) => {
            progress.finish_success();
            report
        }
        Err(failure) => {
            progress.finish_abandon();
            record_install(layout, &manifest, &registry)?;
            print_first_failure(renderer, &failure.report);
            return Err(failure.error).with_context(|| {
                format!("install of {} {} failed", manifest.name, manifest.version)
            });
        }
    };

    record_install(layout, &manifest, &registry)?;
    for conflict in &report.conflicts {
        renderer.print_status(
            "warn",
            &format!(
                "{} is owned by {} with different content, left in place",
                conflict.path, conflict.package
            ),
        );
    }
    finish_report(
        renderer,
        &report,
        &format!(
            "installed {} {} ({} created, {} backed up, {} skipped)",
            manifest.name, manifest.version, report.created, report.backed_up, report.skipped
        ),
    )
}

fn run_erase(layout: &RootLayout, name: &str, options: &RunOptions) -> Result<()> {
    let receipt =
        read_install_receipt(layout, name)?.ok_or_else(|| anyhow!("{name} is not installed"))?;
    let manifest = read_installed_manifest(layout, name)?;
    let receipts = read_install_receipts(layout)?;
    let mut registry = registry_for_erase(&manifest, &receipt);
    let shared = add_shared_from_receipts(&manifest, &receipts, &mut registry);
    debug!(package = %name, shared, "loaded shared path records");

    let renderer = TerminalRenderer::current();
    let mut progress = renderer.start_progress("erase");
    let outcome = remove_files(layout, &manifest, &mut registry, options, |event| {
        progress.observe(event)
    });
    let report = match outcome {
        Ok(report) => {
            progress.finish_success();
            report
        }
        Err(failure) => {
            progress.finish_abandon();
            write_install_receipt(
                layout,
                &receipt_from_registry(&manifest, &registry, receipt.installed_at_unix),
            )?;
            print_first_failure(renderer, &failure.report);
            return Err(failure.error).with_context(|| format!("erase of {name} failed"));
        }
    };

    if report.aborted {
        // Keep the receipt so the remaining files can still be erased later.
        write_install_receipt(
            layout,
            &receipt_from_registry(&manifest, &registry, receipt.installed_at_unix),
        )?;
    } else {
        remove_install_receipt(layout, name)?;
        info!(package = %name, "install receipt removed");
    }

    finish_report(
        renderer,
        &report,
        &format!(
            "erased {} {} ({} removed, {} saved, {} kept)",
            manifest.name, manifest.version, report.removed, report.backed_up, report.skipped
        ),
    )
}

fn print_first_failure(renderer: TerminalRenderer, report: &RunReport) {
    if let Some(failure) = &report.first_failure {
        renderer.print_status("err", &failure.to_string());
    }
}

fn finish_report(renderer: TerminalRenderer, report: &RunReport, summary: &str) -> Result<()> {
    print_first_failure(renderer, report);
    if report.aborted {
        let path = report.first_failed_path().unwrap_or("<unknown>");
        bail!("run aborted at {path}");
    }
    let status = if report.is_clean() { "ok" } else { "warn" };
    renderer.print_status(status, summary);
    Ok(())
}

fn record_install(
    layout: &RootLayout,
    manifest: &PackageManifest,
    registry: &FileRegistry,
) -> Result<()> {
    write_installed_manifest(layout, manifest)?;
    let receipt = receipt_from_registry(manifest, registry, current_unix_timestamp()?);
    let path = write_install_receipt(layout, &receipt)?;
    debug!(receipt = %path.display(), "install receipt written");
    Ok(())
}

pub(crate) fn load_run_options(
    layout: &RootLayout,
    config: Option<&Path>,
    overrides: &PolicyArgs,
) -> Result<RunOptions> {
    let path = config
        .map(Path::to_path_buf)
        .unwrap_or_else(|| layout.config_path());
    let mut options = RunOptions::load_or_default(&path)?;
    if let Some(policy) = overrides.on_error {
        options.error_policy = policy.into();
    }
    if overrides.exclude_docs {
        options.exclude_docs = true;
    }
    if overrides.no_verify {
        options.verify_digests = false;
    }
    debug!(
        policy = options.error_policy.as_str(),
        verify = options.verify_digests,
        exclude_docs = options.exclude_docs,
        "run options loaded"
    );
    Ok(options)
}

fn load_manifest(path: &Path) -> Result<PackageManifest> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read manifest {}", path.display()))?;
    PackageManifest::from_toml_str(&raw)
        .with_context(|| format!("failed to parse manifest {}", path.display()))
}

pub(crate) fn mark_files(
    manifest: &mut PackageManifest,
    config_files: &[String],
    doc_files: &[String],
) -> Result<()> {
    for path in config_files {
        let index = manifest
            .position(path)
            .ok_or_else(|| anyhow!("config file {path} is not in the scanned tree"))?;
        let entry = &mut manifest.files[index];
        if !entry.is_regular() {
            bail!("config file {path} is not a regular file");
        }
        entry.flags.config = true;
        entry.flags.noreplace = true;
    }
    for path in doc_files {
        let index = manifest
            .position(path)
            .ok_or_else(|| anyhow!("doc file {path} is not in the scanned tree"))?;
        manifest.files[index].flags.doc = true;
    }
    Ok(())
}

#[derive(Debug, Serialize)]
pub(crate) struct ListedPackage<'a> {
    name: &'a str,
    version: &'a str,
    files: usize,
    installed: usize,
    installed_at_unix: u64,
}

fn listed_packages(receipts: &[InstallReceipt]) -> Vec<ListedPackage<'_>> {
    receipts
        .iter()
        .map(|receipt| ListedPackage {
            name: &receipt.name,
            version: &receipt.version,
            files: receipt.files.len(),
            installed: receipt
                .files
                .iter()
                .filter(|file| file.state.holds_path())
                .count(),
            installed_at_unix: receipt.installed_at_unix,
        })
        .collect()
}

pub(crate) fn format_list_json(receipts: &[InstallReceipt]) -> Result<String> {
    serde_json::to_string_pretty(&listed_packages(receipts))
        .context("failed to serialize package list")
}

pub(crate) fn format_list_lines(receipts: &[InstallReceipt], style: OutputStyle) -> Vec<String> {
    listed_packages(receipts)
        .into_iter()
        .map(|package| match style {
            OutputStyle::Plain => format!("{} {}", package.name, package.version),
            OutputStyle::Rich => format!(
                "{} {} ({}/{} files on disk)",
                package.name, package.version, package.installed, package.files
            ),
        })
        .collect()
}

fn current_unix_timestamp() -> Result<u64> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock is before the unix epoch")?
        .as_secs())
}
