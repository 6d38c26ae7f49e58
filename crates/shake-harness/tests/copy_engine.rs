#![forbid(unsafe_code)]
//! Copy engine against harness fixtures and a real lease guard.

use shake_copy::{CopyOutcome, copy};
use shake_guard::{LeaseGuard, LeaseTable};
use shake_harness::{allocated_bytes, holes_supported, pattern, write_fragmented, write_sparse};
use shake_types::{LeaseProbe, MAGICLEAP};
use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::Path;

const GAP: u64 = MAGICLEAP.unsigned_abs();

fn open_rw(path: &Path) -> File {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .expect("open read-write")
}

fn private_guard() -> LeaseGuard {
    LeaseGuard::new(Box::leak(Box::new(LeaseTable::new())))
}

#[test]
fn sparse_fixture_stays_sparse_through_backup_and_restore() {
    let dir = tempfile::tempdir().unwrap();
    if !holes_supported(dir.path()).unwrap() {
        eprintln!("filesystem allocates holes; skipping");
        return;
    }
    let source_path = dir.path().join("sparse");
    let head = pattern(200_000, 1);
    let tail = pattern(50_000, 2);
    write_sparse(
        &source_path,
        8 << 20,
        &[(0, head.as_slice()), ((8 << 20) - 50_000, tail.as_slice())],
    )
    .unwrap();
    let expected = std::fs::read(&source_path).unwrap();

    let source = open_rw(&source_path);
    let backup_path = dir.path().join("backup");
    let backup = open_rw(&backup_path);
    assert_eq!(copy(&source, &backup, GAP, None).unwrap(), CopyOutcome::Copied);
    assert!(allocated_bytes(&backup_path).unwrap() < 2 << 20);

    source.set_len(0).unwrap();
    assert_eq!(copy(&backup, &source, 4 * GAP, None).unwrap(), CopyOutcome::Copied);
    assert_eq!(std::fs::read(&source_path).unwrap(), expected);
    assert!(allocated_bytes(&source_path).unwrap() < 2 << 20);
}

#[test]
fn dense_copy_fills_holes() {
    let dir = tempfile::tempdir().unwrap();
    if !holes_supported(dir.path()).unwrap() {
        return;
    }
    let source_path = dir.path().join("sparse");
    write_sparse(&source_path, 1 << 20, &[(0, &b"start"[..])]).unwrap();
    let dest_path = dir.path().join("dense");
    let source = open_rw(&source_path);
    let dest = open_rw(&dest_path);
    assert_eq!(copy(&source, &dest, 0, None).unwrap(), CopyOutcome::Copied);
    dest.sync_all().unwrap();
    assert!(allocated_bytes(&dest_path).unwrap() >= 1 << 20);
    assert_eq!(std::fs::read(&dest_path).unwrap(), std::fs::read(&source_path).unwrap());
}

#[test]
fn fragmented_fixture_copies_byte_for_byte() {
    let dir = tempfile::tempdir().unwrap();
    let source_path = dir.path().join("fragmented");
    let content = pattern(3_000_017, 9);
    write_fragmented(&source_path, &content, 12).unwrap();
    let source = open_rw(&source_path);
    let dest = open_rw(&dir.path().join("copy"));
    assert_eq!(copy(&source, &dest, GAP, None).unwrap(), CopyOutcome::Copied);
    assert_eq!(std::fs::read(dir.path().join("copy")).unwrap(), content);
}

#[test]
fn lease_guard_gates_the_copy() {
    let dir = tempfile::tempdir().unwrap();
    let source_path = dir.path().join("leased");
    std::fs::write(&source_path, pattern(500_000, 4)).unwrap();
    let source = open_rw(&source_path);
    let dest_path = dir.path().join("dest");
    let dest = open_rw(&dest_path);
    let fd = source.as_raw_fd();

    let mut guard = private_guard();
    // Without a lease the probe reports it lost before anything is read.
    assert!(guard.lease_lost(fd));
    assert_eq!(copy(&source, &dest, GAP, Some(&guard)).unwrap(), CopyOutcome::Cancelled);
    assert_eq!(dest.metadata().unwrap().len(), 0);

    if let Err(err) = guard.acquire_read(fd, &source_path) {
        eprintln!("kernel refused the lease ({err}); skipping");
        return;
    }
    assert!(!guard.lease_lost(fd));
    assert_eq!(copy(&source, &dest, GAP, Some(&guard)).unwrap(), CopyOutcome::Copied);
    guard.release(fd).unwrap();
    assert_eq!(std::fs::read(&dest_path).unwrap(), pattern(500_000, 4));
}
