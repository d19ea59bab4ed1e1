use super::*;
use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use filefate_archive::{
    ArchiveReader, ArchiveWriter, FullHeader, Header, HeaderForm, Metadata, FULL_HEADER_LEN,
    TRAILER_NAME,
};
use filefate_core::{sha256_hex, FileEntry, FileFlags, PackageManifest};

use crate::receipts::parse_receipt;

const MTIME: u32 = 1_700_000_000;

struct Fixture {
    layout: RootLayout,
    source: PathBuf,
}

impl Fixture {
    fn dest(&self, path: &str) -> PathBuf {
        self.layout.resolve(path)
    }

    fn stage(&self, files: &[(&str, &str)]) {
        for (path, content) in files {
            let dest = self.source.join(path.trim_start_matches('/'));
            fs::create_dir_all(dest.parent().expect("staged path must have a parent"))
                .expect("must create staging dirs");
            fs::write(&dest, content).expect("must stage file");
        }
    }

    fn place(&self, path: &str, content: &[u8]) {
        let dest = self.dest(path);
        fs::create_dir_all(dest.parent().expect("path must have a parent"))
            .expect("must create parent dirs");
        fs::write(&dest, content).expect("must write file");
    }
}

fn dir_entry(path: &str) -> FileEntry {
    FileEntry {
        path: path.to_string(),
        mode: 0o040_755,
        uid: 0,
        gid: 0,
        mtime: MTIME,
        size: 0,
        digest: None,
        link_group: None,
        link_to: None,
        flags: FileFlags::default(),
    }
}

fn file_entry(path: &str, content: &[u8]) -> FileEntry {
    FileEntry {
        mode: 0o100_644,
        size: content.len() as u64,
        digest: Some(sha256_hex(content)),
        ..dir_entry(path)
    }
}

fn symlink_entry(path: &str, target: &str) -> FileEntry {
    FileEntry {
        mode: 0o120_777,
        size: target.len() as u64,
        link_to: Some(target.to_string()),
        ..dir_entry(path)
    }
}

fn config_entry(path: &str, content: &[u8], noreplace: bool) -> FileEntry {
    let mut entry = file_entry(path, content);
    entry.flags.config = true;
    entry.flags.noreplace = noreplace;
    entry
}

fn manifest(name: &str, files: Vec<FileEntry>) -> PackageManifest {
    let manifest = PackageManifest {
        name: name.to_string(),
        version: semver::Version::new(1, 0, 0),
        files,
    };
    manifest.validate().expect("test manifest must be valid");
    manifest
}

fn pack(fixture: &Fixture, manifest: &PackageManifest, form: HeaderForm) -> Vec<u8> {
    let mut payload = Vec::new();
    let mut writer = ArchiveWriter::new(&mut payload, form);
    write_payload(manifest, &fixture.source, &mut writer).expect("must write payload");
    drop(writer);
    payload
}

fn install(
    fixture: &Fixture,
    manifest: &PackageManifest,
    payload: &[u8],
    registry: &mut FileRegistry,
    options: &RunOptions,
) -> Result<RunReport, RunFailure> {
    let mut reader = ArchiveReader::new(payload);
    install_files(
        &fixture.layout,
        manifest,
        registry,
        &mut reader,
        options,
        |_| {},
    )
}

fn install_fresh(fixture: &Fixture, manifest: &PackageManifest, payload: &[u8]) -> RunReport {
    let mut registry = FileRegistry::new(manifest.len(), FileState::Pending);
    install(
        fixture,
        manifest,
        payload,
        &mut registry,
        &RunOptions::default(),
    )
    .expect("install must succeed")
}

/// Installs `manifest` the way the CLI does: shared paths come from the other
/// receipts and a receipt is written afterwards.
fn install_recorded(fixture: &Fixture, manifest: &PackageManifest, payload: &[u8]) -> RunReport {
    let receipts = read_install_receipts(&fixture.layout).expect("must read receipts");
    let mut registry = FileRegistry::new(manifest.len(), FileState::Pending);
    add_shared_from_receipts(manifest, &receipts, &mut registry);
    let report = install(
        fixture,
        manifest,
        payload,
        &mut registry,
        &RunOptions::default(),
    )
    .expect("install must succeed");
    write_install_receipt(
        &fixture.layout,
        &receipt_from_registry(manifest, &registry, 1),
    )
    .expect("must write receipt");
    report
}

fn erase_recorded(fixture: &Fixture, manifest: &PackageManifest) -> RunReport {
    let receipt = read_install_receipt(&fixture.layout, &manifest.name)
        .expect("must read receipt")
        .expect("receipt must exist");
    let receipts = read_install_receipts(&fixture.layout).expect("must read receipts");
    let mut registry = registry_for_erase(manifest, &receipt);
    add_shared_from_receipts(manifest, &receipts, &mut registry);
    let report = remove_files(
        &fixture.layout,
        manifest,
        &mut registry,
        &RunOptions::default(),
        |_| {},
    )
    .expect("erase must succeed");
    remove_install_receipt(&fixture.layout, &manifest.name).expect("must remove receipt");
    report
}

fn full_header(entry: &FileEntry, ino: u32, nlink: u32, size: u64) -> Header {
    Header::Full(FullHeader {
        name: entry.archive_name(),
        metadata: Metadata {
            ino,
            mode: entry.mode,
            nlink,
            mtime: entry.mtime,
            ..Metadata::default()
        },
        size,
    })
}

fn read(path: &Path) -> Vec<u8> {
    fs::read(path).unwrap_or_else(|err| panic!("must read {}: {err}", path.display()))
}

#[test]
fn install_materializes_dirs_files_and_symlinks() {
    let fixture = test_fixture();
    let mut tool = file_entry("/usr/bin/tool", b"#!/bin/sh\necho hi\n");
    tool.mode = 0o100_755;
    let manifest = manifest(
        "tool",
        vec![
            dir_entry("/usr"),
            dir_entry("/usr/bin"),
            tool,
            symlink_entry("/usr/bin/t", "tool"),
        ],
    );
    fixture.stage(&[("/usr/bin/tool", "#!/bin/sh\necho hi\n")]);
    let payload = pack(&fixture, &manifest, HeaderForm::Full);

    let mut registry = FileRegistry::new(manifest.len(), FileState::Pending);
    let report = install(
        &fixture,
        &manifest,
        &payload,
        &mut registry,
        &RunOptions::default(),
    )
    .expect("install must succeed");

    assert!(report.is_clean());
    assert_eq!(report.created, 4);
    let tool_path = fixture.dest("/usr/bin/tool");
    assert_eq!(read(&tool_path), b"#!/bin/sh\necho hi\n");
    let metadata = fs::metadata(&tool_path).expect("must stat tool");
    assert_eq!(metadata.permissions().mode() & 0o7777, 0o755);
    assert_eq!(metadata.mtime(), i64::from(MTIME));
    assert_eq!(
        fs::read_link(fixture.dest("/usr/bin/t")).expect("must read link"),
        PathBuf::from("tool")
    );
    assert!(registry
        .states()
        .all(|state| state == FileState::Installed));
}

#[test]
fn stripped_payload_installs_the_same_tree() {
    let fixture = test_fixture();
    let manifest = manifest(
        "conf",
        vec![
            dir_entry("/etc"),
            file_entry("/etc/a.conf", b"alpha\n"),
            file_entry("/etc/b.conf", b"beta\n"),
            symlink_entry("/etc/c.conf", "a.conf"),
        ],
    );
    fixture.stage(&[("/etc/a.conf", "alpha\n"), ("/etc/b.conf", "beta\n")]);
    let payload = pack(&fixture, &manifest, HeaderForm::Stripped);

    let report = install_fresh(&fixture, &manifest, &payload);

    assert!(report.is_clean());
    assert_eq!(read(&fixture.dest("/etc/a.conf")), b"alpha\n");
    assert_eq!(read(&fixture.dest("/etc/b.conf")), b"beta\n");
    assert_eq!(read(&fixture.dest("/etc/c.conf")), b"alpha\n");
    assert_eq!(report.bytes_done, report.bytes_total);
}

fn linked_manifest() -> PackageManifest {
    let content = b"shared binary content";
    let mut members = ["/bin/one", "/bin/two", "/bin/three"]
        .into_iter()
        .map(|path| file_entry(path, content))
        .collect::<Vec<_>>();
    for member in &mut members {
        member.link_group = Some(1);
    }
    manifest("linked", members)
}

fn assert_linked_install(fixture: &Fixture) {
    let inodes = ["/bin/one", "/bin/two", "/bin/three"]
        .into_iter()
        .map(|path| {
            let dest = fixture.dest(path);
            assert_eq!(read(&dest), b"shared binary content");
            let metadata = fs::metadata(&dest).expect("must stat member");
            assert_eq!(metadata.nlink(), 3, "{path} must have three links");
            metadata.ino()
        })
        .collect::<Vec<_>>();
    assert!(inodes.windows(2).all(|pair| pair[0] == pair[1]));
}

#[test]
fn hard_link_group_is_written_once_and_linked_stripped() {
    let fixture = test_fixture();
    let manifest = linked_manifest();
    fixture.stage(&[("/bin/three", "shared binary content")]);
    let payload = pack(&fixture, &manifest, HeaderForm::Stripped);

    let report = install_fresh(&fixture, &manifest, &payload);

    assert!(report.is_clean());
    assert_eq!(report.created, 3);
    assert_linked_install(&fixture);
}

#[test]
fn hard_link_group_is_written_once_and_linked_full() {
    let fixture = test_fixture();
    let manifest = linked_manifest();
    fixture.stage(&[("/bin/three", "shared binary content")]);
    let payload = pack(&fixture, &manifest, HeaderForm::Full);

    let report = install_fresh(&fixture, &manifest, &payload);

    assert!(report.is_clean());
    assert_linked_install(&fixture);
}

#[test]
fn hard_link_group_without_content_is_reported() {
    let fixture = test_fixture();
    let first = file_entry("/bin/left", b"");
    let second = file_entry("/bin/right", b"");
    let manifest = manifest("orphans", vec![first.clone(), second.clone()]);

    let mut payload = Vec::new();
    let mut writer = ArchiveWriter::new(&mut payload, HeaderForm::Full);
    writer
        .write_header(&full_header(&first, 9, 3, 0))
        .expect("must write first member");
    writer
        .write_header(&full_header(&second, 9, 3, 0))
        .expect("must write second member");
    writer.close().expect("must close archive");
    drop(writer);

    let mut registry = FileRegistry::new(manifest.len(), FileState::Pending);
    let report = install(
        &fixture,
        &manifest,
        &payload,
        &mut registry,
        &RunOptions::default(),
    )
    .expect("run must finish");

    let failure = report.first_failure.as_ref().expect("must report failure");
    assert_eq!(failure.path, "/bin/left");
    assert!(matches!(failure.error, FileError::MissingHardLink));
    assert_eq!(registry.state(0), FileState::NotInstalled);
    assert_eq!(registry.state(1), FileState::NotInstalled);
    assert!(!fixture.dest("/bin/left").exists());
}

#[test]
fn modified_config_is_kept_and_new_content_goes_beside_it() {
    let fixture = test_fixture();
    let manifest = manifest(
        "app",
        vec![config_entry("/etc/app.conf", b"shipped=1\n", false)],
    );
    fixture.stage(&[("/etc/app.conf", "shipped=1\n")]);
    fixture.place("/etc/app.conf", b"local=1\n");
    let payload = pack(&fixture, &manifest, HeaderForm::Full);

    let mut registry = FileRegistry::new(manifest.len(), FileState::Pending);
    let report = install(
        &fixture,
        &manifest,
        &payload,
        &mut registry,
        &RunOptions::default(),
    )
    .expect("install must succeed");

    assert_eq!(registry.action(0), Some(FileAction::Backup));
    assert_eq!(registry.state(0), FileState::Installed);
    assert_eq!(report.backed_up, 1);
    assert_eq!(read(&fixture.dest("/etc/app.conf")), b"local=1\n");
    assert_eq!(
        read(&fixture.dest("/etc/app.conf.pkgnew")),
        b"shipped=1\n"
    );
}

#[test]
fn unchanged_noreplace_config_is_left_alone() {
    let fixture = test_fixture();
    let manifest = manifest(
        "app",
        vec![config_entry("/etc/app.conf", b"shipped=1\n", true)],
    );
    fixture.stage(&[("/etc/app.conf", "shipped=1\n")]);
    fixture.place("/etc/app.conf", b"shipped=1\n");
    let payload = pack(&fixture, &manifest, HeaderForm::Stripped);

    let mut registry = FileRegistry::new(manifest.len(), FileState::Pending);
    let report = install(
        &fixture,
        &manifest,
        &payload,
        &mut registry,
        &RunOptions::default(),
    )
    .expect("install must succeed");

    assert_eq!(registry.action(0), Some(FileAction::Skip));
    assert_eq!(registry.state(0), FileState::Installed);
    assert_eq!(report.skipped, 1);
    assert!(!fixture.dest("/etc/app.conf.pkgnew").exists());
}

fn five_files() -> PackageManifest {
    manifest(
        "five",
        vec![
            file_entry("/data/one", b"1"),
            file_entry("/data/two", b"2"),
            file_entry("/data/blocker/three", b"3"),
            file_entry("/data/four", b"4"),
            file_entry("/data/five", b"5"),
        ],
    )
}

fn stage_five(fixture: &Fixture) {
    fixture.stage(&[
        ("/data/one", "1"),
        ("/data/two", "2"),
        ("/data/blocker/three", "3"),
        ("/data/four", "4"),
        ("/data/five", "5"),
    ]);
    // a regular file where the third entry needs a directory
    fixture.place("/data/blocker", b"in the way");
}

#[test]
fn partial_failure_reports_the_first_failed_path() {
    let fixture = test_fixture();
    let manifest = five_files();
    stage_five(&fixture);
    let payload = pack(&fixture, &manifest, HeaderForm::Full);

    let mut registry = FileRegistry::new(manifest.len(), FileState::Pending);
    let report = install(
        &fixture,
        &manifest,
        &payload,
        &mut registry,
        &RunOptions::default(),
    )
    .expect("run must finish with a report");

    assert!(report.aborted);
    assert_eq!(report.first_failed_path(), Some("/data/blocker/three"));
    assert!(fixture.dest("/data/one").exists());
    assert!(fixture.dest("/data/two").exists());
    assert!(!fixture.dest("/data/four").exists());
    assert!(!fixture.dest("/data/five").exists());
    assert_eq!(
        registry.states().collect::<Vec<_>>(),
        vec![
            FileState::Installed,
            FileState::Installed,
            FileState::NotInstalled,
            FileState::NotInstalled,
            FileState::NotInstalled,
        ]
    );
}

#[test]
fn continue_policy_installs_past_a_failed_file() {
    let fixture = test_fixture();
    let manifest = five_files();
    stage_five(&fixture);
    let payload = pack(&fixture, &manifest, HeaderForm::Stripped);
    let options = RunOptions {
        error_policy: ErrorPolicy::Continue,
        ..RunOptions::default()
    };

    let mut registry = FileRegistry::new(manifest.len(), FileState::Pending);
    let report = install(&fixture, &manifest, &payload, &mut registry, &options)
        .expect("run must finish with a report");

    assert!(!report.aborted);
    assert_eq!(report.first_failed_path(), Some("/data/blocker/three"));
    assert_eq!(read(&fixture.dest("/data/four")), b"4");
    assert_eq!(read(&fixture.dest("/data/five")), b"5");
    assert_eq!(registry.state(2), FileState::NotInstalled);
    assert_eq!(registry.state(4), FileState::Installed);
}

#[test]
fn truncated_payload_keeps_earlier_file_failures() {
    let fixture = test_fixture();
    let manifest = five_files();
    stage_five(&fixture);
    let mut payload = pack(&fixture, &manifest, HeaderForm::Full);
    // cut the trailer record and the last content byte with its padding
    let trailer_len = (FULL_HEADER_LEN + TRAILER_NAME.len() + 1).next_multiple_of(4);
    payload.truncate(payload.len() - trailer_len - 4);
    let options = RunOptions {
        error_policy: ErrorPolicy::Continue,
        ..RunOptions::default()
    };

    let mut registry = FileRegistry::new(manifest.len(), FileState::Pending);
    let failure = install(&fixture, &manifest, &payload, &mut registry, &options)
        .expect_err("truncated payload must fail");

    assert!(
        matches!(failure.error, EngineError::Archive { ref path, .. } if path == "/data/five"),
        "{failure:?}"
    );
    assert_eq!(
        failure.report.first_failed_path(),
        Some("/data/blocker/three")
    );
    assert_eq!(failure.report.created, 3);
    assert_eq!(read(&fixture.dest("/data/four")), b"4");
    assert!(!fixture.dest("/data/five").exists());
    assert_eq!(
        registry.states().collect::<Vec<_>>(),
        vec![
            FileState::Installed,
            FileState::Installed,
            FileState::NotInstalled,
            FileState::Installed,
            FileState::NotInstalled,
        ]
    );
}

#[test]
fn full_header_size_must_match_the_manifest() {
    let fixture = test_fixture();
    let entry = file_entry("/opt/tool", b"abc");
    let manifest = manifest("sized", vec![entry.clone()]);

    let mut payload = Vec::new();
    let mut writer = ArchiveWriter::new(&mut payload, HeaderForm::Full);
    writer
        .write_header(&full_header(&entry, 1, 1, 2))
        .expect("must write header");
    writer.write_content(b"ab").expect("must write content");
    writer.close().expect("must close archive");
    drop(writer);

    let mut registry = FileRegistry::new(manifest.len(), FileState::Pending);
    let err = install(
        &fixture,
        &manifest,
        &payload,
        &mut registry,
        &RunOptions::default(),
    )
    .expect_err("short record must fail");

    match err.error {
        EngineError::ContentSize {
            ref path,
            expected,
            declared,
        } => {
            assert_eq!(path, "/opt/tool");
            assert_eq!(expected, 3);
            assert_eq!(declared, 2);
        }
        ref other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(registry.state(0), FileState::NotInstalled);
    assert!(!fixture.dest("/opt/tool").exists());
}

#[test]
fn oversized_symlink_record_is_rejected_before_reading_content() {
    let fixture = test_fixture();
    let link = symlink_entry("/usr/bin/tool", "tool-1.0");
    let manifest = manifest("link", vec![link.clone()]);

    let mut payload = Vec::new();
    {
        let mut writer = ArchiveWriter::new(&mut payload, HeaderForm::Full);
        writer
            .write_header(&full_header(&link, 1, 1, u64::from(u32::MAX)))
            .expect("must write header");
    }

    let mut registry = FileRegistry::new(manifest.len(), FileState::Pending);
    let err = install(
        &fixture,
        &manifest,
        &payload,
        &mut registry,
        &RunOptions::default(),
    )
    .expect_err("oversized record must fail");

    assert!(
        matches!(err.error, EngineError::ContentSize { expected: 8, .. }),
        "{err:?}"
    );
    assert!(fs::symlink_metadata(fixture.dest("/usr/bin/tool")).is_err());
}

#[test]
fn out_of_order_payload_is_a_sequence_error() {
    let fixture = test_fixture();
    let first = file_entry("/a", b"a");
    let second = file_entry("/b", b"b");
    let manifest = manifest("order", vec![first.clone(), second.clone()]);

    let mut payload = Vec::new();
    let mut writer = ArchiveWriter::new(&mut payload, HeaderForm::Full);
    writer
        .write_header(&full_header(&second, 2, 1, 1))
        .expect("must write header");
    writer.write_content(b"b").expect("must write content");
    writer
        .write_header(&full_header(&first, 1, 1, 1))
        .expect("must write header");
    writer.write_content(b"a").expect("must write content");
    writer.close().expect("must close archive");
    drop(writer);

    let mut registry = FileRegistry::new(manifest.len(), FileState::Pending);
    let err = install(
        &fixture,
        &manifest,
        &payload,
        &mut registry,
        &RunOptions::default(),
    )
    .expect_err("reordered payload must fail");

    match err.error {
        EngineError::Sequence { expected, found } => {
            assert_eq!(expected, "./a");
            assert_eq!(found, "./b");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!fixture.dest("/a").exists());
    assert!(!fixture.dest("/b").exists());
}

#[test]
fn stripped_index_mismatch_is_a_sequence_error() {
    let fixture = test_fixture();
    let manifest = manifest(
        "order",
        vec![file_entry("/a", b"a"), file_entry("/b", b"b")],
    );

    let mut payload = Vec::new();
    let mut writer = ArchiveWriter::new(&mut payload, HeaderForm::Stripped);
    writer
        .write_header(&Header::Stripped { index: 1, size: 1 })
        .expect("must write header");
    writer.write_content(b"b").expect("must write content");
    writer.close().expect("must close archive");
    drop(writer);

    let mut registry = FileRegistry::new(manifest.len(), FileState::Pending);
    let err = install(
        &fixture,
        &manifest,
        &payload,
        &mut registry,
        &RunOptions::default(),
    )
    .expect_err("mismatched index must fail");
    assert!(matches!(err.error, EngineError::Sequence { .. }), "{err:?}");
}

#[test]
fn early_trailer_is_a_sequence_error() {
    let fixture = test_fixture();
    let short = manifest("short", vec![file_entry("/a", b"a")]);
    let full = manifest(
        "full",
        vec![file_entry("/a", b"a"), file_entry("/b", b"b")],
    );
    fixture.stage(&[("/a", "a")]);
    let payload = pack(&fixture, &short, HeaderForm::Full);

    let mut registry = FileRegistry::new(full.len(), FileState::Pending);
    let err = install(
        &fixture,
        &full,
        &payload,
        &mut registry,
        &RunOptions::default(),
    )
    .expect_err("missing record must fail");

    match err.error {
        EngineError::Sequence { expected, found } => {
            assert_eq!(expected, "./b");
            assert_eq!(found, "archive trailer");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(err.report.created, 1);
    assert_eq!(registry.state(0), FileState::Installed);
    assert_eq!(registry.state(1), FileState::NotInstalled);
}

#[test]
fn digest_mismatch_leaves_no_file_behind() {
    let fixture = test_fixture();
    let mut entry = file_entry("/opt/blob", b"expected");
    entry.digest = Some(sha256_hex(b"something else"));
    let manifest = manifest("blob", vec![entry]);
    fixture.stage(&[("/opt/blob", "expected")]);
    let payload = pack(&fixture, &manifest, HeaderForm::Full);

    let report = install_fresh(&fixture, &manifest, &payload);

    let failure = report.first_failure.as_ref().expect("must report failure");
    assert!(matches!(failure.error, FileError::DigestMismatch { .. }));
    assert!(!fixture.dest("/opt/blob").exists());
    let leftovers = fs::read_dir(fixture.dest("/opt"))
        .expect("parent must exist")
        .count();
    assert_eq!(leftovers, 0, "temporary file must be removed");
}

#[test]
fn ghost_and_excluded_docs_are_not_written() {
    let fixture = test_fixture();
    let mut ghost = file_entry("/var/log/app.log", b"");
    ghost.flags.ghost = true;
    let mut doc = file_entry("/usr/share/doc/app/README", b"read me\n");
    doc.flags.doc = true;
    let manifest = manifest(
        "app",
        vec![ghost, doc, file_entry("/usr/bin/app", b"bin")],
    );
    fixture.stage(&[
        ("/usr/share/doc/app/README", "read me\n"),
        ("/usr/bin/app", "bin"),
    ]);
    let payload = pack(&fixture, &manifest, HeaderForm::Stripped);
    let options = RunOptions {
        exclude_docs: true,
        ..RunOptions::default()
    };

    let mut registry = FileRegistry::new(manifest.len(), FileState::Pending);
    let report = install(&fixture, &manifest, &payload, &mut registry, &options)
        .expect("install must succeed");

    assert!(report.is_clean());
    assert_eq!(registry.state(0), FileState::Skipped);
    assert_eq!(registry.state(1), FileState::NotInstalled);
    assert_eq!(registry.state(2), FileState::Installed);
    assert!(!fixture.dest("/var/log/app.log").exists());
    assert!(!fixture.dest("/usr/share/doc/app/README").exists());
    assert_eq!(read(&fixture.dest("/usr/bin/app")), b"bin");
}

#[test]
fn cancellation_stops_between_files_and_still_reports_stop() {
    let fixture = test_fixture();
    let manifest = manifest("c", vec![file_entry("/a", b"a")]);
    fixture.stage(&[("/a", "a")]);
    let payload = pack(&fixture, &manifest, HeaderForm::Full);
    let token = Arc::new(AtomicBool::new(true));
    let options = RunOptions::default().with_cancel(token);

    let mut events = Vec::new();
    let mut registry = FileRegistry::new(manifest.len(), FileState::Pending);
    let mut reader = ArchiveReader::new(payload.as_slice());
    let err = install_files(
        &fixture.layout,
        &manifest,
        &mut registry,
        &mut reader,
        &options,
        |event| events.push(event.phase),
    )
    .expect_err("cancelled run must fail");

    assert!(matches!(err.error, EngineError::Cancelled { ref path } if path == "/a"));
    assert_eq!(registry.state(0), FileState::NotInstalled);
    assert_eq!(events, vec![ProgressPhase::Start, ProgressPhase::Stop]);
    assert!(!fixture.dest("/a").exists());
}

#[test]
fn progress_reports_every_file_and_reaches_total() {
    let fixture = test_fixture();
    let manifest = manifest(
        "p",
        vec![
            dir_entry("/p"),
            file_entry("/p/a", b"aaaa"),
            file_entry("/p/b", b"bb"),
        ],
    );
    fixture.stage(&[("/p/a", "aaaa"), ("/p/b", "bb")]);
    let payload = pack(&fixture, &manifest, HeaderForm::Full);

    let mut events = Vec::new();
    let mut registry = FileRegistry::new(manifest.len(), FileState::Pending);
    let mut reader = ArchiveReader::new(payload.as_slice());
    install_files(
        &fixture.layout,
        &manifest,
        &mut registry,
        &mut reader,
        &RunOptions::default(),
        |event| events.push(event),
    )
    .expect("install must succeed");

    assert_eq!(events.len(), 5);
    assert_eq!(events[0].phase, ProgressPhase::Start);
    assert_eq!(events[0].bytes_total, 6);
    assert_eq!(events[2].bytes_done, 4);
    let last = events.last().expect("must have events");
    assert_eq!(last.phase, ProgressPhase::Stop);
    assert_eq!(last.bytes_done, 6);
}

#[test]
fn ghost_entries_still_report_progress() {
    let fixture = test_fixture();
    let mut ghost = file_entry("/var/log/app.log", b"");
    ghost.flags.ghost = true;
    let manifest = manifest("g", vec![ghost, file_entry("/usr/bin/app", b"bin")]);
    fixture.stage(&[("/usr/bin/app", "bin")]);
    let payload = pack(&fixture, &manifest, HeaderForm::Full);

    let mut events = Vec::new();
    let mut registry = FileRegistry::new(manifest.len(), FileState::Pending);
    let mut reader = ArchiveReader::new(payload.as_slice());
    install_files(
        &fixture.layout,
        &manifest,
        &mut registry,
        &mut reader,
        &RunOptions::default(),
        |event| events.push(event),
    )
    .expect("install must succeed");

    let progress = events
        .iter()
        .filter(|event| event.phase == ProgressPhase::Progress)
        .count();
    assert_eq!(progress, manifest.len());
    assert_eq!(events[1].bytes_done, 0);
    assert_eq!(events[2].bytes_done, 3);

    events.clear();
    let mut registry = FileRegistry::new(manifest.len(), FileState::Installed);
    registry.set_state(0, FileState::Skipped);
    remove_files(
        &fixture.layout,
        &manifest,
        &mut registry,
        &RunOptions::default(),
        |event| events.push(event),
    )
    .expect("erase must succeed");
    let progress = events
        .iter()
        .filter(|event| event.phase == ProgressPhase::Progress)
        .count();
    assert_eq!(progress, manifest.len());
}

#[test]
fn registry_size_must_match_manifest() {
    let fixture = test_fixture();
    let manifest = manifest("m", vec![file_entry("/a", b"a")]);
    let mut registry = FileRegistry::new(2, FileState::Pending);
    let err = install(
        &fixture,
        &manifest,
        &[],
        &mut registry,
        &RunOptions::default(),
    )
    .expect_err("size mismatch must fail");
    assert!(matches!(
        err.error,
        EngineError::RegistrySize {
            expected: 1,
            actual: 2
        }
    ));
}

#[test]
fn install_resolution_is_deterministic() {
    let entry = config_entry("/etc/x.conf", b"x", true);
    let shared = vec![SharedFile {
        other_package: "other".to_string(),
        other_index: 3,
        other_state: FileState::Installed,
        other_config: true,
        other_digest: Some(sha256_hex(b"y")),
    }];
    for condition in [
        DiskCondition::Missing,
        DiskCondition::Matches,
        DiskCondition::Differs,
        DiskCondition::WrongType,
    ] {
        let first = resolve_install(&entry, condition, &shared, false);
        let second = resolve_install(&entry, condition, &shared, false);
        assert_eq!(first, second);
    }
}

#[test]
fn install_resolution_follows_precedence() {
    let plain = file_entry("/usr/bin/x", b"x");
    let config = config_entry("/etc/x.conf", b"x", false);
    let none: Vec<SharedFile> = Vec::new();

    let mut ghost = plain.clone();
    ghost.flags.ghost = true;
    let decision = resolve_install(&ghost, DiskCondition::Missing, &none, false);
    assert_eq!(decision.action, FileAction::Skip);
    assert_eq!(decision.state, Some(FileState::Skipped));

    let decision = resolve_install(&dir_entry("/usr"), DiskCondition::Matches, &none, false);
    assert_eq!(decision.action, FileAction::Create);

    let decision = resolve_install(&config, DiskCondition::WrongType, &none, false);
    assert_eq!(decision.action, FileAction::Backup);

    let decision = resolve_install(&config, DiskCondition::Missing, &none, false);
    assert_eq!(decision.action, FileAction::Create);

    let decision = resolve_install(&plain, DiskCondition::Differs, &none, false);
    assert_eq!(decision.action, FileAction::Create);
}

#[test]
fn install_resolution_defers_to_live_owners() {
    let plain = file_entry("/usr/bin/x", b"x");
    let owner = |state: FileState, digest: &[u8]| SharedFile {
        other_package: "other".to_string(),
        other_index: 0,
        other_state: state,
        other_config: false,
        other_digest: Some(sha256_hex(digest)),
    };

    let same = [owner(FileState::Installed, b"x")];
    let decision = resolve_install(&plain, DiskCondition::Matches, &same, false);
    assert_eq!(decision.action, FileAction::Skip);
    assert_eq!(decision.state, Some(FileState::Replaced));
    assert!(!decision.conflict);

    let different = [owner(FileState::Replaced, b"y")];
    let decision = resolve_install(&plain, DiskCondition::Differs, &different, false);
    assert_eq!(decision.action, FileAction::Skip);
    assert_eq!(decision.state, Some(FileState::Skipped));
    assert!(decision.conflict);

    let gone = [owner(FileState::Removed, b"y")];
    let decision = resolve_install(&plain, DiskCondition::Differs, &gone, false);
    assert_eq!(decision.action, FileAction::Create);
}

#[test]
fn erase_resolution_follows_precedence() {
    let plain = file_entry("/usr/bin/x", b"x");
    let config = config_entry("/etc/x.conf", b"x", false);
    let none: Vec<SharedFile> = Vec::new();

    let decision = resolve_erase(
        &plain,
        FileState::NotInstalled,
        DiskCondition::Matches,
        &none,
    );
    assert_eq!(decision.action, FileAction::Skip);
    assert_eq!(decision.state, None);

    let claim = |package: &str, state: FileState| SharedFile {
        other_package: package.to_string(),
        other_index: 0,
        other_state: state,
        other_config: false,
        other_digest: None,
    };
    let claims = [claim("b", FileState::Removed), claim("c", FileState::Pending)];
    let decision = resolve_erase(&plain, FileState::Installed, DiskCondition::Matches, &claims);
    assert_eq!(decision.action, FileAction::Skip);

    let usr = dir_entry("/usr");
    let decision = resolve_erase(&usr, FileState::Pending, DiskCondition::Matches, &none);
    assert_eq!(decision.action, FileAction::RemoveIfLast);

    let decision = resolve_erase(&config, FileState::Installed, DiskCondition::Differs, &none);
    assert_eq!(decision.action, FileAction::Backup);

    let decision = resolve_erase(&config, FileState::Replaced, DiskCondition::Matches, &none);
    assert_eq!(decision.action, FileAction::Remove);
}

#[test]
fn shared_path_survives_until_last_owner_is_erased() {
    let fixture = test_fixture();
    let first = manifest("alpha", vec![file_entry("/p", b"same")]);
    let second = manifest("beta", vec![file_entry("/p", b"same")]);
    fixture.stage(&[("/p", "same")]);
    let payload_first = pack(&fixture, &first, HeaderForm::Full);
    let payload_second = pack(&fixture, &second, HeaderForm::Full);

    install_recorded(&fixture, &first, &payload_first);
    let report = install_recorded(&fixture, &second, &payload_second);
    assert_eq!(report.skipped, 1);
    let receipt = read_install_receipt(&fixture.layout, "beta")
        .expect("must read receipt")
        .expect("receipt must exist");
    assert_eq!(receipt.files[0].state, FileState::Replaced);

    let report = erase_recorded(&fixture, &first);
    assert_eq!(report.removed, 0);
    assert_eq!(read(&fixture.dest("/p")), b"same");

    let report = erase_recorded(&fixture, &second);
    assert_eq!(report.removed, 1);
    assert!(!fixture.dest("/p").exists());
}

#[test]
fn conflicting_content_is_reported_and_skipped() {
    let fixture = test_fixture();
    let first = manifest("alpha", vec![file_entry("/p", b"mine")]);
    let second = manifest("beta", vec![file_entry("/p", b"theirs")]);
    fixture.stage(&[("/p", "mine")]);
    let payload_first = pack(&fixture, &first, HeaderForm::Full);
    install_recorded(&fixture, &first, &payload_first);
    fixture.stage(&[("/p", "theirs")]);
    let payload_second = pack(&fixture, &second, HeaderForm::Full);

    let report = install_recorded(&fixture, &second, &payload_second);

    assert_eq!(
        report.conflicts,
        vec![PathConflict {
            path: "/p".to_string(),
            package: "alpha".to_string(),
        }]
    );
    assert_eq!(read(&fixture.dest("/p")), b"mine");
}

#[test]
fn erase_removes_directories_deepest_first_when_empty() {
    let fixture = test_fixture();
    let manifest = manifest(
        "tree",
        vec![
            dir_entry("/opt"),
            dir_entry("/opt/a"),
            dir_entry("/opt/a/b"),
            file_entry("/opt/a/b/f", b"f"),
        ],
    );
    fixture.stage(&[("/opt/a/b/f", "f")]);
    let payload = pack(&fixture, &manifest, HeaderForm::Full);
    install_recorded(&fixture, &manifest, &payload);
    fixture.place("/opt/unowned", b"keep me");

    let report = erase_recorded(&fixture, &manifest);

    assert!(report.is_clean());
    assert!(!fixture.dest("/opt/a").exists());
    assert!(fixture.dest("/opt").is_dir());
    assert_eq!(read(&fixture.dest("/opt/unowned")), b"keep me");
    assert_eq!(report.removed, 3);
    assert_eq!(report.skipped, 1);
}

#[test]
fn erase_saves_modified_config_and_ignores_missing_files() {
    let fixture = test_fixture();
    let manifest = manifest(
        "app",
        vec![
            config_entry("/etc/app.conf", b"shipped\n", false),
            file_entry("/usr/bin/app", b"bin"),
        ],
    );
    fixture.stage(&[("/etc/app.conf", "shipped\n"), ("/usr/bin/app", "bin")]);
    let payload = pack(&fixture, &manifest, HeaderForm::Stripped);
    install_recorded(&fixture, &manifest, &payload);
    fs::write(fixture.dest("/etc/app.conf"), b"edited\n").expect("must edit config");
    fs::remove_file(fixture.dest("/usr/bin/app")).expect("must remove binary");

    let report = erase_recorded(&fixture, &manifest);

    assert!(report.is_clean());
    assert_eq!(report.backed_up, 1);
    assert!(!fixture.dest("/etc/app.conf").exists());
    assert_eq!(read(&fixture.dest("/etc/app.conf.pkgsave")), b"edited\n");
}

#[test]
fn receipt_round_trip_keeps_file_states() {
    let fixture = test_fixture();
    let receipt = InstallReceipt {
        name: "app".to_string(),
        version: "1.2.3".to_string(),
        files: vec![
            ReceiptFile {
                index: 0,
                state: FileState::Installed,
                config: true,
                digest: Some(sha256_hex(b"x")),
                path: "/etc/odd:name.conf".to_string(),
            },
            ReceiptFile {
                index: 1,
                state: FileState::Replaced,
                config: false,
                digest: None,
                path: "/usr/bin/app".to_string(),
            },
        ],
        installed_at_unix: 42,
    };

    write_install_receipt(&fixture.layout, &receipt).expect("must write receipt");
    let loaded = read_install_receipt(&fixture.layout, "app")
        .expect("must read receipt")
        .expect("receipt must exist");
    assert_eq!(loaded, receipt);
    assert_eq!(
        read_install_receipts(&fixture.layout)
            .expect("must list receipts")
            .len(),
        1
    );

    assert!(remove_install_receipt(&fixture.layout, "app").expect("must remove receipt"));
    assert!(read_install_receipt(&fixture.layout, "app")
        .expect("must read receipt")
        .is_none());
}

#[test]
fn receipt_without_files_parses() {
    let receipt = parse_receipt("name=app\nversion=1.0.0\ninstalled_at_unix=7\n")
        .expect("must parse");
    assert!(receipt.files.is_empty());
    assert!(parse_receipt("name=app\nversion=1.0.0\n").is_err());
    let bad_state = "name=app\nversion=1\nfile=0:bogus:0:-:/x\ninstalled_at_unix=1\n";
    assert!(parse_receipt(bad_state).is_err());
}

#[test]
fn installed_manifest_round_trip() {
    let fixture = test_fixture();
    let original = manifest("app", vec![dir_entry("/etc"), file_entry("/etc/a", b"a")]);
    write_installed_manifest(&fixture.layout, &original).expect("must write manifest");
    let loaded = read_installed_manifest(&fixture.layout, "app").expect("must read manifest");
    assert_eq!(loaded, original);
}

#[test]
fn run_options_load_from_toml() {
    let options = RunOptions::from_toml_str("error_policy = \"continue\"\nexclude_docs = true\n")
        .expect("must parse options");
    assert_eq!(options.error_policy, ErrorPolicy::Continue);
    assert!(options.exclude_docs);
    assert!(options.verify_digests);
    assert!(RunOptions::from_toml_str("error_policy = \"sometimes\"\n").is_err());

    let fixture = test_fixture();
    let defaults = RunOptions::load_or_default(&fixture.layout.config_path())
        .expect("missing file must fall back to defaults");
    assert_eq!(defaults.error_policy, ErrorPolicy::Default);
}

#[test]
fn scanned_tree_packs_and_installs() {
    let fixture = test_fixture();
    fixture.stage(&[("/usr/bin/tool", "tool"), ("/etc/tool.conf", "conf")]);
    fs::hard_link(
        fixture.source.join("usr/bin/tool"),
        fixture.source.join("usr/bin/tool-alias"),
    )
    .expect("must create hard link");
    std::os::unix::fs::symlink("tool", fixture.source.join("usr/bin/t"))
        .expect("must create symlink");

    let manifest = scan_tree(&fixture.source, "tool", semver::Version::new(0, 1, 0))
        .expect("must scan tree");
    let paths = manifest
        .files
        .iter()
        .map(|entry| entry.path.as_str())
        .collect::<Vec<_>>();
    assert_eq!(
        paths,
        vec![
            "/etc",
            "/etc/tool.conf",
            "/usr",
            "/usr/bin",
            "/usr/bin/t",
            "/usr/bin/tool",
            "/usr/bin/tool-alias",
        ]
    );
    assert_eq!(manifest.link_groups().len(), 1);
    assert_eq!(manifest.files[4].link_to.as_deref(), Some("tool"));

    let payload = pack(&fixture, &manifest, HeaderForm::Full);
    let report = install_fresh(&fixture, &manifest, &payload);

    assert!(report.is_clean());
    assert_eq!(read(&fixture.dest("/usr/bin/tool-alias")), b"tool");
    assert_eq!(
        fs::metadata(fixture.dest("/usr/bin/tool"))
            .expect("must stat tool")
            .nlink(),
        2
    );
}

static TEST_ROOT_COUNTER: AtomicU64 = AtomicU64::new(0);

fn build_test_root_path(nanos: u128) -> PathBuf {
    let mut path = std::env::temp_dir();
    let sequence = TEST_ROOT_COUNTER.fetch_add(1, Ordering::Relaxed);
    path.push(format!(
        "filefate-installer-tests-{}-{}-{}",
        std::process::id(),
        nanos,
        sequence
    ));
    path
}

#[test]
fn build_test_root_path_disambiguates_same_timestamp_calls() {
    let first = build_test_root_path(42);
    let second = build_test_root_path(42);
    assert_ne!(
        first, second,
        "installer test roots must remain unique when timestamp granularity is coarse"
    );
}

fn test_fixture() -> Fixture {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time")
        .as_nanos();
    let base = build_test_root_path(nanos);
    Fixture {
        layout: RootLayout::new(base.join("root")),
        source: base.join("source"),
    }
}
