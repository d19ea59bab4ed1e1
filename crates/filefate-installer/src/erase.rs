use std::fs;
use std::io;
use std::path::Path;

use filefate_core::PackageManifest;
use tracing::{debug, info, warn};

use crate::error::{EngineError, FileError, FileFailure, RunFailure, RunReport};
use crate::install::check_registry;
use crate::layout::{with_suffix, RootLayout, SAVE_SUFFIX};
use crate::options::RunOptions;
use crate::progress::{ProgressEvent, ProgressSink};
use crate::registry::{FileAction, FileRegistry, FileState};
use crate::resolver::{is_absent, probe_disk, resolve_erase, DiskCondition};

/// Removes the manifest's files from below the layout root.
///
/// Paths another package still claims are left alone, modified config files
/// are renamed aside and directories go last, deepest first, and only when
/// empty. Missing files are not failures.
pub fn remove_files<F>(
    layout: &RootLayout,
    manifest: &PackageManifest,
    registry: &mut FileRegistry,
    options: &RunOptions,
    progress: F,
) -> Result<RunReport, RunFailure>
where
    F: FnMut(ProgressEvent),
{
    check_registry(manifest, registry)?;

    let total = manifest.payload_size();
    let mut sink = ProgressSink::start(progress, total);
    let mut report = RunReport {
        bytes_total: total,
        ..RunReport::default()
    };
    let outcome = erase_entries(layout, manifest, registry, options, &mut report, &mut sink);
    report.bytes_done = sink.done();
    sink.stop();

    match outcome {
        Ok(()) => Ok(report),
        Err(error) => {
            warn!(package = %manifest.name, error = %error, "erase run stopped");
            Err(RunFailure::new(error, report))
        }
    }
}

fn erase_entries<F: FnMut(ProgressEvent)>(
    layout: &RootLayout,
    manifest: &PackageManifest,
    registry: &mut FileRegistry,
    options: &RunOptions,
    report: &mut RunReport,
    sink: &mut ProgressSink<F>,
) -> Result<(), EngineError> {
    registry.reset_actions();
    let content_sizes = manifest.payload_content_sizes();
    let mut directories = Vec::new();

    for (index, entry) in manifest.files.iter().enumerate() {
        if options.is_cancelled() {
            info!(path = %entry.path, "erase cancelled");
            return Err(EngineError::Cancelled {
                path: entry.path.clone(),
            });
        }

        let dest = layout.resolve(&entry.path);
        let recorded = registry.state(index);
        let condition = if entry.flags.config && entry.is_regular() && recorded.is_live_claim() {
            probe_disk(entry, &dest)
        } else {
            DiskCondition::Missing
        };
        let decision = resolve_erase(entry, recorded, condition, registry.iter_shared(index));
        registry.set_action(index, decision.action);
        debug!(
            path = %entry.path,
            recorded = recorded.as_str(),
            action = decision.action.as_str(),
            "resolved erase action"
        );

        let result = match decision.action {
            FileAction::RemoveIfLast => {
                directories.push(index);
                Ok(())
            }
            FileAction::Remove => remove_path(&dest),
            FileAction::Backup => save_config(&entry.path, &dest),
            FileAction::Skip | FileAction::Create => {
                if let Some(state) = decision.state {
                    registry.set_state(index, state);
                }
                report.skipped += 1;
                Ok(())
            }
        };

        match result {
            Ok(()) => match decision.action {
                FileAction::Remove => {
                    registry.set_state(index, FileState::Removed);
                    report.removed += 1;
                }
                FileAction::Backup => {
                    registry.set_state(index, FileState::Removed);
                    report.backed_up += 1;
                }
                _ => {}
            },
            Err(error) => {
                if !record_failure(report, &entry.path, error, options) {
                    break;
                }
            }
        }

        sink.advance(content_sizes[index]);
    }

    if !report.aborted {
        remove_directories(layout, manifest, registry, options, report, directories);
    }

    info!(
        package = %manifest.name,
        removed = report.removed,
        saved = report.backed_up,
        skipped = report.skipped,
        aborted = report.aborted,
        "erase run finished"
    );
    Ok(())
}

fn remove_directories(
    layout: &RootLayout,
    manifest: &PackageManifest,
    registry: &mut FileRegistry,
    options: &RunOptions,
    report: &mut RunReport,
    mut directories: Vec<usize>,
) {
    directories.sort_by(|a, b| {
        let depth = |index: usize| Path::new(&manifest.files[index].path).components().count();
        depth(*b).cmp(&depth(*a)).then(b.cmp(a))
    });

    for index in directories {
        let entry = &manifest.files[index];
        let dest = layout.resolve(&entry.path);
        match fs::remove_dir(&dest) {
            Ok(()) => {
                debug!(path = %entry.path, "removed directory");
                registry.set_state(index, FileState::Removed);
                report.removed += 1;
            }
            Err(err) if is_absent(&err) => {
                registry.set_state(index, FileState::Removed);
            }
            Err(err) if is_not_empty(&err) => {
                debug!(path = %entry.path, "directory not empty, leaving it in place");
                registry.set_state(index, FileState::Skipped);
                report.skipped += 1;
            }
            Err(err) => {
                let error = FileError::fs("remove directory", err);
                if !record_failure(report, &entry.path, error, options) {
                    break;
                }
            }
        }
    }
}

fn remove_path(path: &Path) -> Result<(), FileError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if is_absent(&err) => {
            debug!(path = %path.display(), "already absent");
            Ok(())
        }
        Err(err) => Err(FileError::fs("remove", err)),
    }
}

fn save_config(path: &str, dest: &Path) -> Result<(), FileError> {
    let saved = with_suffix(dest, SAVE_SUFFIX);
    match fs::rename(dest, &saved) {
        Ok(()) => {
            warn!(path, saved = %saved.display(), "modified config file saved");
            Ok(())
        }
        Err(err) if is_absent(&err) => Ok(()),
        Err(err) => Err(FileError::fs("rename", err)),
    }
}

/// Returns whether the run continues.
fn record_failure(
    report: &mut RunReport,
    path: &str,
    error: FileError,
    options: &RunOptions,
) -> bool {
    let keep_going = options.error_policy.continues_erase(&error);
    let failure = FileFailure {
        path: path.to_string(),
        error,
    };
    warn!(failure = %failure, continuing = keep_going, "failed to erase file");
    if report.first_failure.is_none() {
        report.first_failure = Some(failure);
    }
    if !keep_going {
        report.aborted = true;
    }
    keep_going
}

fn is_not_empty(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(code) if code == libc::ENOTEMPTY || code == libc::EEXIST
    )
}
