#![forbid(unsafe_code)]
//! A full scan over fragmented fixtures, through the same `Court` the
//! binary drives.
//!
//! The end-to-end test needs a disk filesystem with FIEMAP and leases. It
//! runs in the system temporary directory, or under `SHAKE_E2E_DIR` when
//! set, and skips where the filesystem cannot fragment a file.

use shake_core::{Court, ScanStats, Scratch};
use shake_guard::{LeaseGuard, LeaseTable, Mode, ModeMachine};
use shake_extent::ExtentStrategy;
use shake_harness::{holes_supported, inspect, pattern, write_fragmented};
use shake_types::Policy;
use std::fs::File;
use std::path::{Path, PathBuf};

fn scratch_in(dir: &Path) -> Scratch {
    let path = dir.join("shake-scratch");
    let file = File::options()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&path)
        .expect("create scratch");
    Scratch::new(file, path)
}

fn leaked_mode() -> &'static ModeMachine {
    Box::leak(Box::new(ModeMachine::new()))
}

fn scan(
    policy: &Policy,
    scratch: &Scratch,
    guard: LeaseGuard,
    mode: &'static ModeMachine,
    paths: &[PathBuf],
) -> ScanStats {
    let mut court = Court::new(policy, scratch, guard, mode, Vec::new());
    court.report_header().unwrap();
    court.judge_paths(paths).unwrap()
}

/// Shake anything with allocated blocks, whatever its age.
fn eager() -> Policy {
    let mut policy = Policy {
        locks: false,
        xattr: false,
        max_fragments: 0,
        ..Policy::default()
    };
    policy.set_new_days(0);
    policy
}

#[test]
fn relocation_keeps_content_and_modification_time() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("album.flac");
    let content = pattern(2_000_000, 3);
    write_fragmented(&path, &content, 10).unwrap();
    let modified = std::fs::metadata(&path).unwrap().modified().unwrap();
    let before = match inspect(&path) {
        Ok(report) => report,
        Err(err) => {
            eprintln!("extent inspection unavailable ({err}); skipping");
            return;
        }
    };
    assert!(before.fragments() >= 1);

    let scratch = scratch_in(dir.path());
    let mode = leaked_mode();
    let guard = LeaseGuard::new(Box::leak(Box::new(LeaseTable::new())));
    let stats = scan(&eager(), &scratch, guard, mode, std::slice::from_ref(&path));

    assert_eq!(stats.guilty, 1);
    assert_eq!(stats.relocated, 1);
    assert_eq!(stats.failed, 0);
    assert_eq!(mode.current(), Mode::Normal);
    assert_eq!(std::fs::read(&path).unwrap(), content);
    assert_eq!(std::fs::metadata(&path).unwrap().modified().unwrap(), modified);
    assert_eq!(scratch.file().metadata().unwrap().len(), 0);
}

#[test]
fn pretend_scan_of_a_directory_changes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let tree = dir.path().join("tree");
    std::fs::create_dir(&tree).unwrap();
    let mut expected = Vec::new();
    for (index, name) in ["one", "two", "three"].into_iter().enumerate() {
        let path = tree.join(name);
        let seed = u8::try_from(index).unwrap();
        write_fragmented(&path, &pattern(400_000, seed), 4).unwrap();
        expected.push((path, pattern(400_000, seed)));
    }
    let policy = Policy {
        pretend: true,
        ..eager()
    };
    let scratch = scratch_in(dir.path());
    let guard = LeaseGuard::new(Box::leak(Box::new(LeaseTable::new())));
    let stats = scan(&policy, &scratch, guard, leaked_mode(), &[tree]);
    if stats.failed > 0 {
        return;
    }
    assert_eq!(stats.judged, 3);
    assert_eq!(stats.guilty, 3);
    assert_eq!(stats.relocated, 0);
    for (path, content) in expected {
        assert_eq!(std::fs::read(path).unwrap(), content);
    }
}

#[test]
fn fragmented_file_is_defragmented() {
    let dir = match std::env::var_os("SHAKE_E2E_DIR") {
        Some(root) => tempfile::tempdir_in(root).unwrap(),
        None => tempfile::tempdir().unwrap(),
    };
    if !holes_supported(dir.path()).unwrap() {
        eprintln!("not a disk filesystem; skipping");
        return;
    }
    let path = dir.path().join("fragmented");
    let content = pattern(10 << 20, 0x5A);
    write_fragmented(&path, &content, 30).unwrap();
    let before = match inspect(&path) {
        Ok(report) if report.strategy == Some(ExtentStrategy::Fiemap) => report,
        Ok(_) => {
            eprintln!("no extent map on this filesystem; skipping");
            return;
        }
        Err(err) => {
            eprintln!("extent inspection unavailable ({err}); skipping");
            return;
        }
    };
    if before.fragments() < 22 {
        eprintln!("allocator merged the chunks ({} fragments); skipping", before.fragments());
        return;
    }

    let temp_path = dir.path().join("shake-scratch");
    shake_guard::install(&temp_path).unwrap();
    let scratch = scratch_in(dir.path());
    let mut policy = Policy {
        xattr: false,
        ..Policy::default()
    };
    policy.set_new_days(0);
    let stats = scan(
        &policy,
        &scratch,
        LeaseGuard::global(),
        &shake_guard::MODE,
        std::slice::from_ref(&path),
    );

    assert_eq!(stats.guilty, 1);
    assert_eq!(stats.failed, 0);
    if stats.cancelled == 1 {
        eprintln!("lease broken by another process; skipping");
        return;
    }
    assert_eq!(stats.relocated, 1);
    assert_eq!(shake_guard::MODE.current(), Mode::Normal);
    assert_eq!(std::fs::read(&path).unwrap(), content);
    let after = inspect(&path).unwrap();
    assert_eq!(after.fragments(), 1, "{} fragments before", before.fragments());
}
