use std::collections::HashMap;
use std::ffi::OsString;
use std::fs;
use std::io::{self, BufWriter, Read, Write};
use std::os::unix::ffi::OsStringExt;
use std::path::{Path, PathBuf};

use filefate_archive::{ArchiveError, ArchiveReader, ContentReader, Record};
use filefate_core::{DigestWriter, FileEntry, FileKind, PackageManifest};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::error::{EngineError, FileError, FileFailure, PathConflict, RunFailure, RunReport};
use crate::fs_utils::{
    apply_dir_metadata, apply_file_metadata, ensure_parent_dir, place_hard_link, place_symlink,
};
use crate::hardlinks::{LinkKey, LinkTracker};
use crate::layout::{with_suffix, RootLayout, NEW_SUFFIX};
use crate::options::RunOptions;
use crate::progress::{ProgressEvent, ProgressSink};
use crate::registry::{FileAction, FileRegistry, FileState};
use crate::resolver::{probe_disk, resolve_install, Decision, DiskCondition};

const COPY_BUFFER_LEN: usize = 64 * 1024;

/// Materializes every manifest entry from the payload `reader` below the
/// layout root.
///
/// Per-file failures are collected in the returned report; payload stream and
/// ordering errors end the run with a `RunFailure` that still carries the
/// report. Files written before a failure are left in place and every entry
/// the run never reached ends `NotInstalled`.
pub fn install_files<R, F>(
    layout: &RootLayout,
    manifest: &PackageManifest,
    registry: &mut FileRegistry,
    reader: &mut ArchiveReader<R>,
    options: &RunOptions,
    progress: F,
) -> Result<RunReport, RunFailure>
where
    R: Read,
    F: FnMut(ProgressEvent),
{
    check_registry(manifest, registry)?;

    let total = manifest.payload_size();
    let mut sink = ProgressSink::start(progress, total);
    let mut run = InstallRun {
        layout,
        manifest,
        registry,
        options,
        decisions: Vec::with_capacity(manifest.len()),
        content_sizes: manifest.payload_content_sizes(),
        group_sizes: manifest
            .link_groups()
            .into_iter()
            .map(|(group, members)| (group, members.len()))
            .collect(),
        links: LinkTracker::default(),
        report: RunReport {
            bytes_total: total,
            ..RunReport::default()
        },
    };
    let outcome = run.execute(reader, &mut sink);
    run.settle_pending();
    let mut report = run.report;
    report.bytes_done = sink.done();
    sink.stop();

    match outcome {
        Ok(()) => Ok(report),
        Err(error) => {
            warn!(package = %manifest.name, error = %error, "install run stopped");
            Err(RunFailure::new(error, report))
        }
    }
}

pub(crate) fn check_registry(
    manifest: &PackageManifest,
    registry: &FileRegistry,
) -> Result<(), RunFailure> {
    if registry.len() != manifest.len() {
        let error = EngineError::RegistrySize {
            expected: manifest.len(),
            actual: registry.len(),
        };
        return Err(RunFailure::new(error, RunReport::default()));
    }
    Ok(())
}

struct InstallRun<'a> {
    layout: &'a RootLayout,
    manifest: &'a PackageManifest,
    registry: &'a mut FileRegistry,
    options: &'a RunOptions,
    decisions: Vec<Decision>,
    content_sizes: Vec<u64>,
    group_sizes: HashMap<u32, usize>,
    links: LinkTracker,
    report: RunReport,
}

impl<'a> InstallRun<'a> {
    fn execute<R, F>(
        &mut self,
        reader: &mut ArchiveReader<R>,
        sink: &mut ProgressSink<F>,
    ) -> Result<(), EngineError>
    where
        R: Read,
        F: FnMut(ProgressEvent),
    {
        self.plan();

        for index in 0..self.manifest.len() {
            let entry = self.entry(index);
            if self.options.is_cancelled() {
                info!(path = %entry.path, "install cancelled");
                return Err(EngineError::Cancelled {
                    path: entry.path.clone(),
                });
            }
            if !entry.in_payload() {
                self.conclude(index, Ok(()));
                sink.advance(0);
                continue;
            }

            let content_size = self.stream_entry(index, reader)?;
            sink.advance(content_size);
            if self.report.aborted {
                break;
            }
        }

        if !self.report.aborted {
            expect_trailer(reader)?;
            self.fail_unresolved_links();
        }

        info!(
            package = %self.manifest.name,
            created = self.report.created,
            backed_up = self.report.backed_up,
            skipped = self.report.skipped,
            conflicts = self.report.conflicts.len(),
            aborted = self.report.aborted,
            "install run finished"
        );
        Ok(())
    }

    /// Entries the run never reached were not installed.
    fn settle_pending(&mut self) {
        for index in 0..self.registry.len() {
            if self.registry.state(index) == FileState::Pending {
                self.registry.set_state(index, FileState::NotInstalled);
            }
        }
    }

    fn entry(&self, index: usize) -> &'a FileEntry {
        &self.manifest.files[index]
    }

    fn plan(&mut self) {
        self.registry.reset_actions();
        self.decisions.clear();
        for index in 0..self.manifest.len() {
            let entry = self.entry(index);
            let condition = if entry.in_payload() && !entry.is_dir() {
                probe_disk(entry, &self.layout.resolve(&entry.path))
            } else {
                DiskCondition::Missing
            };
            let decision = resolve_install(
                entry,
                condition,
                self.registry.iter_shared(index),
                self.options.exclude_docs,
            );
            if decision.conflict {
                let package = self
                    .registry
                    .iter_shared(index)
                    .find(|record| record.other_state.holds_path())
                    .map(|record| record.other_package.clone())
                    .unwrap_or_default();
                warn!(path = %entry.path, owner = %package, "path conflicts with another package");
                self.report.conflicts.push(PathConflict {
                    path: entry.path.clone(),
                    package,
                });
            }
            debug!(
                path = %entry.path,
                condition = ?condition,
                action = decision.action.as_str(),
                "resolved install action"
            );
            self.registry.set_action(index, decision.action);
            self.decisions.push(decision);
        }
    }

    /// Reads the record for `index`, checks it belongs there and applies it.
    /// Returns the content length the record declared.
    fn stream_entry<R: Read>(
        &mut self,
        index: usize,
        reader: &mut ArchiveReader<R>,
    ) -> Result<u64, EngineError> {
        let entry = self.entry(index);
        let record = reader
            .read_header()
            .map_err(|source| archive_error(&entry.path, source))?;
        let Some(record) = record else {
            return Err(EngineError::Sequence {
                expected: entry.archive_name(),
                found: "archive trailer".to_string(),
            });
        };

        let (content, link) = match record {
            Record::Full { header, content } => {
                if !names_match(&header.name, &entry.path) {
                    return Err(EngineError::Sequence {
                        expected: entry.archive_name(),
                        found: header.name,
                    });
                }
                let expected = self.content_sizes[index];
                if header.size != expected {
                    return Err(EngineError::ContentSize {
                        path: entry.path.clone(),
                        expected,
                        declared: header.size,
                    });
                }
                let meta = header.metadata;
                let link = (entry.is_regular() && meta.nlink > 1).then(|| {
                    let key = LinkKey::Inode {
                        dev_major: meta.dev_major,
                        dev_minor: meta.dev_minor,
                        ino: meta.ino,
                    };
                    (key, meta.nlink as usize)
                });
                (content, link)
            }
            Record::Stripped {
                index: found,
                content,
            } => {
                if found as usize != index {
                    return Err(EngineError::Sequence {
                        expected: format!("file index {index} ({})", entry.path),
                        found: format!("file index {found}"),
                    });
                }
                let link = entry.link_group.map(|group| {
                    let members = self.group_sizes.get(&group).copied().unwrap_or(1);
                    (LinkKey::Group(group), members)
                });
                (content.with_size(self.content_sizes[index]), link)
            }
        };

        let size = content.size();
        self.apply(index, content, link)?;
        Ok(size)
    }

    fn apply<R: Read>(
        &mut self,
        index: usize,
        mut content: ContentReader<'_, R>,
        link: Option<(LinkKey, usize)>,
    ) -> Result<(), EngineError> {
        let entry = self.entry(index);
        let action = self.decisions[index].action;

        match entry.kind() {
            Some(FileKind::Directory) => {
                drain(&entry.path, &mut content)?;
                let result = if action.writes_content() {
                    create_directory(&self.layout.resolve(&entry.path), entry)
                } else {
                    Ok(())
                };
                self.conclude(index, result);
            }
            Some(FileKind::Symlink) => {
                let target = content
                    .read_to_vec()
                    .map_err(|source| archive_error(&entry.path, source))?;
                let result = if action.writes_content() {
                    self.create_symlink(index, target)
                } else {
                    Ok(())
                };
                self.conclude(index, result);
            }
            _ => {
                if let Some((key, expected)) = link {
                    let carries_content = content.size() > 0;
                    return match self.links.add(key, expected, index, carries_content) {
                        Some(members) => self.write_link_group(&members, content),
                        None => {
                            debug!(path = %entry.path, "deferring hard link member");
                            drain(&entry.path, &mut content)
                        }
                    };
                }
                if !action.writes_content() {
                    drain(&entry.path, &mut content)?;
                    self.conclude(index, Ok(()));
                    return Ok(());
                }
                let dest = self.destination(index);
                let result = self.write_regular(entry, &dest, &mut content)?;
                self.conclude(index, result);
            }
        }
        Ok(())
    }

    /// Writes the group content once and links every other writing member to it.
    fn write_link_group<R: Read>(
        &mut self,
        members: &[usize],
        mut content: ContentReader<'_, R>,
    ) -> Result<(), EngineError> {
        let (writers, idle): (Vec<usize>, Vec<usize>) = members
            .iter()
            .copied()
            .partition(|member| self.decisions[*member].action.writes_content());
        for member in idle {
            self.conclude(member, Ok(()));
        }

        let carrier = self.entry(members[members.len() - 1]);
        let Some((&primary, linked)) = writers.split_first() else {
            return drain(&carrier.path, &mut content);
        };

        let source = self.destination(primary);
        let result = self.write_regular(self.entry(primary), &source, &mut content)?;
        if result.is_err() {
            self.conclude(primary, result);
            for &member in linked {
                self.registry.set_state(member, FileState::NotInstalled);
            }
            return Ok(());
        }
        self.conclude(primary, Ok(()));

        for &member in linked {
            if self.report.aborted {
                break;
            }
            let dest = self.destination(member);
            let result = ensure_parent_dir(&dest)
                .and_then(|()| place_hard_link(&source, &dest))
                .map_err(|err| FileError::fs("hard link", err));
            self.conclude(member, result);
        }
        Ok(())
    }

    /// Streams content into a temporary file beside `dest`, verifies it and
    /// renames it into place. The outer error is a payload stream failure.
    fn write_regular<R: Read>(
        &self,
        entry: &FileEntry,
        dest: &Path,
        content: &mut ContentReader<'_, R>,
    ) -> Result<Result<(), FileError>, EngineError> {
        let staged = match stage_temp(dest) {
            Ok(staged) => staged,
            Err(error) => {
                drain(&entry.path, content)?;
                return Ok(Err(error));
            }
        };

        let mut writer = DigestWriter::new(BufWriter::new(staged));
        let mut buf = vec![0_u8; COPY_BUFFER_LEN];
        loop {
            let read = content
                .read_chunk(&mut buf)
                .map_err(|source| archive_error(&entry.path, source))?;
            if read == 0 {
                break;
            }
            if let Err(err) = writer.write_all(&buf[..read]) {
                drain(&entry.path, content)?;
                return Ok(Err(FileError::fs("write", err)));
            }
        }

        let (buffered, digest) = writer.finish();
        let staged = match buffered.into_inner() {
            Ok(staged) => staged,
            Err(err) => return Ok(Err(FileError::fs("write", err.into_error()))),
        };
        if self.options.verify_digests {
            if let Some(expected) = entry.digest.as_deref() {
                if !expected.eq_ignore_ascii_case(&digest) {
                    return Ok(Err(FileError::DigestMismatch {
                        expected: expected.to_string(),
                        actual: digest,
                    }));
                }
            }
        }
        if let Err(err) = apply_file_metadata(staged.as_file(), entry) {
            return Ok(Err(FileError::fs("set metadata", err)));
        }

        Ok(staged
            .persist(dest)
            .map(|_| ())
            .map_err(|err| FileError::fs("rename", err.error)))
    }

    fn create_symlink(&self, index: usize, target: Vec<u8>) -> Result<(), FileError> {
        let entry = self.entry(index);
        let target = PathBuf::from(OsString::from_vec(target));
        if self.options.verify_digests {
            if let Some(expected) = entry.link_to.as_deref() {
                if target != Path::new(expected) {
                    return Err(FileError::DigestMismatch {
                        expected: expected.to_string(),
                        actual: target.display().to_string(),
                    });
                }
            }
        }
        let dest = self.destination(index);
        ensure_parent_dir(&dest)
            .and_then(|()| place_symlink(&target, &dest, entry))
            .map_err(|err| FileError::fs("create symlink", err))
    }

    fn destination(&self, index: usize) -> PathBuf {
        let entry = self.entry(index);
        let dest = self.layout.resolve(&entry.path);
        if self.decisions[index].action == FileAction::Backup {
            let new_path = with_suffix(&dest, NEW_SUFFIX);
            warn!(
                path = %entry.path,
                new = %new_path.display(),
                "keeping modified config file, writing shipped content beside it"
            );
            return new_path;
        }
        dest
    }

    fn conclude(&mut self, index: usize, result: Result<(), FileError>) {
        let entry = self.entry(index);
        let decision = self.decisions[index];
        match result {
            Ok(()) => {
                let state = decision.state.unwrap_or(FileState::Installed);
                self.registry.set_state(index, state);
                match decision.action {
                    FileAction::Create => self.report.created += 1,
                    FileAction::Backup => self.report.backed_up += 1,
                    _ => self.report.skipped += 1,
                }
                debug!(
                    path = %entry.path,
                    action = decision.action.as_str(),
                    state = state.as_str(),
                    "file done"
                );
            }
            Err(error) => self.record_failure(index, error),
        }
    }

    fn record_failure(&mut self, index: usize, error: FileError) {
        let entry = self.entry(index);
        self.registry.set_state(index, FileState::NotInstalled);
        let keep_going = self
            .options
            .error_policy
            .continues_install(entry.flags, &error);
        let failure = FileFailure {
            path: entry.path.clone(),
            error,
        };
        warn!(failure = %failure, continuing = keep_going, "failed to install file");
        if self.report.first_failure.is_none() {
            self.report.first_failure = Some(failure);
        }
        if !keep_going {
            self.report.aborted = true;
        }
    }

    fn fail_unresolved_links(&mut self) {
        if self.links.is_empty() {
            return;
        }
        for members in self.links.drain_unresolved() {
            let Some((&first, rest)) = members.split_first() else {
                continue;
            };
            self.record_failure(first, FileError::MissingHardLink);
            for &member in rest {
                self.registry.set_state(member, FileState::NotInstalled);
            }
        }
    }
}

fn archive_error(path: &str, source: ArchiveError) -> EngineError {
    EngineError::Archive {
        path: path.to_string(),
        source,
    }
}

fn drain<R: Read>(path: &str, content: &mut ContentReader<'_, R>) -> Result<(), EngineError> {
    let mut scratch = [0_u8; 8192];
    while content
        .read_chunk(&mut scratch)
        .map_err(|source| archive_error(path, source))?
        > 0
    {}
    Ok(())
}

fn expect_trailer<R: Read>(reader: &mut ArchiveReader<R>) -> Result<(), EngineError> {
    match reader.read_header() {
        Ok(None) => Ok(()),
        Ok(Some(Record::Full { header, .. })) => Err(EngineError::Sequence {
            expected: "archive trailer".to_string(),
            found: header.name,
        }),
        Ok(Some(Record::Stripped { index, .. })) => Err(EngineError::Sequence {
            expected: "archive trailer".to_string(),
            found: format!("file index {index}"),
        }),
        Err(source) => Err(archive_error("archive trailer", source)),
    }
}

/// Compares an archive name such as `./usr/bin/tool` with a manifest path.
fn names_match(archive_name: &str, path: &str) -> bool {
    let name = archive_name.strip_prefix("./").unwrap_or(archive_name);
    name.trim_start_matches('/') == path.trim_start_matches('/')
}

fn stage_temp(dest: &Path) -> Result<NamedTempFile, FileError> {
    ensure_parent_dir(dest).map_err(|err| FileError::fs("create parent directories", err))?;
    let parent = match dest.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let name = dest
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    tempfile::Builder::new()
        .prefix(&format!(".{name}."))
        .suffix(".tmp")
        .tempfile_in(parent)
        .map_err(|err| FileError::fs("create temporary file", err))
}

fn create_directory(path: &Path, entry: &FileEntry) -> Result<(), FileError> {
    match fs::symlink_metadata(path) {
        Ok(metadata) if metadata.is_dir() => {}
        Ok(metadata) if metadata.file_type().is_symlink() && path.is_dir() => return Ok(()),
        Ok(_) => {
            return Err(FileError::fs(
                "create directory",
                io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    "a non-directory occupies the path",
                ),
            ))
        }
        Err(_) => {
            fs::create_dir_all(path).map_err(|err| FileError::fs("create directory", err))?;
        }
    }
    apply_dir_metadata(path, entry).map_err(|err| FileError::fs("set metadata", err))
}
