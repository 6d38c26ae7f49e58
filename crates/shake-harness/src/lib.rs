#![forbid(unsafe_code)]
//! Fixtures for exercising shake against a real filesystem.
//!
//! Fragmented files are produced by writing a file's chunks in reverse
//! logical order, interleaved with a filler file that is removed
//! afterwards, syncing after every chunk so the allocator cannot merge
//! them. Whether that actually fragments depends on the filesystem, so
//! callers check [`InspectReport::fragments`] before relying on it.

use anyhow::{Context, Result, bail};
use serde::Serialize;
use shake_core::investigate;
use shake_extent::{ExtentStrategy, Testimony};
use shake_guard::{LeaseGuard, LeaseTable};
use shake_types::{FileKind, Policy, STAT_BLOCK_SIZE};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Deterministic, non-zero-heavy content.
#[must_use]
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    let mut state = u32::from(seed) | 0x100;
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            state.to_be_bytes()[1]
        })
        .collect()
}

/// Write `content` to `path` in `chunks` pieces, last piece first.
pub fn write_fragmented(path: &Path, content: &[u8], chunks: usize) -> Result<()> {
    if chunks == 0 {
        bail!("chunk count must be positive");
    }
    let chunk_len = content.len().div_ceil(chunks).max(1);
    let filler_path = filler_path(path);
    let mut file = File::create(path).with_context(|| format!("create {}", path.display()))?;
    let mut filler = File::create(&filler_path)
        .with_context(|| format!("create {}", filler_path.display()))?;
    let spacer = vec![0xA5_u8; chunk_len];

    let pieces: Vec<(usize, &[u8])> = content
        .chunks(chunk_len)
        .enumerate()
        .map(|(index, piece)| (index * chunk_len, piece))
        .collect();
    for (offset, piece) in pieces.into_iter().rev() {
        file.seek(SeekFrom::Start(u64::try_from(offset)?))?;
        file.write_all(piece)?;
        file.sync_data()?;
        filler.write_all(&spacer)?;
        filler.sync_data()?;
    }
    drop(filler);
    std::fs::remove_file(&filler_path)
        .with_context(|| format!("remove {}", filler_path.display()))?;
    Ok(())
}

fn filler_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(ToOwned::to_owned).unwrap_or_default();
    name.push(".filler");
    path.with_file_name(name)
}

/// Create a `len`-byte file holding `pieces` at their offsets and holes
/// everywhere else.
pub fn write_sparse(path: &Path, len: u64, pieces: &[(u64, &[u8])]) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .with_context(|| format!("create {}", path.display()))?;
    file.set_len(len)?;
    for (offset, piece) in pieces {
        file.seek(SeekFrom::Start(*offset))?;
        file.write_all(piece)?;
    }
    file.sync_all()?;
    Ok(())
}

/// Bytes actually allocated to `path`.
pub fn allocated_bytes(path: &Path) -> Result<u64> {
    let meta = std::fs::metadata(path).with_context(|| format!("stat {}", path.display()))?;
    Ok(meta.blocks() * STAT_BLOCK_SIZE)
}

/// Whether the filesystem under `dir` leaves holes unallocated.
pub fn holes_supported(dir: &Path) -> Result<bool> {
    let probe = dir.join(".shake-hole-probe");
    write_sparse(&probe, 4 << 20, &[(0, &b"x"[..])])?;
    let allocated = allocated_bytes(&probe)?;
    std::fs::remove_file(&probe)?;
    Ok(allocated < 1 << 20)
}

// ── Inspection ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct InspectReport {
    pub path: PathBuf,
    pub kind: FileKind,
    pub allocated: u64,
    pub age: i64,
    pub strategy: Option<ExtentStrategy>,
    pub testimony: Testimony,
}

impl InspectReport {
    #[must_use]
    pub const fn fragments(&self) -> u32 {
        self.testimony.fragments
    }
}

/// The policy the harness inspects with: no leases, no placement time,
/// fragment positions recorded.
#[must_use]
pub fn inspect_policy() -> Policy {
    Policy {
        locks: false,
        xattr: false,
        verbosity: 3,
        ..Policy::default()
    }
}

/// Investigate `path` the way a scan would, without taking a lease.
pub fn inspect(path: &Path) -> Result<InspectReport> {
    static TABLE: OnceLock<&'static LeaseTable> = OnceLock::new();
    let table = TABLE.get_or_init(|| Box::leak(Box::new(LeaseTable::new())));
    let mut guard = LeaseGuard::new(table);
    let candidate = investigate(path, &inspect_policy(), &mut guard)?;
    let strategy = match candidate.file() {
        Some(file) => Some(ExtentStrategy::probe(file)?),
        None => None,
    };
    Ok(InspectReport {
        path: candidate.path.clone(),
        kind: candidate.kind,
        allocated: candidate.size,
        age: candidate.age,
        strategy,
        testimony: candidate.testimony.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_is_deterministic_and_varied() {
        let a = pattern(4096, 7);
        assert_eq!(a, pattern(4096, 7));
        assert_ne!(a, pattern(4096, 8));
        assert!(a.iter().filter(|&&byte| byte == 0).count() < 100);
    }

    #[test]
    fn fragmented_fixture_has_the_right_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        let content = pattern(1_000_003, 1);
        write_fragmented(&path, &content, 7).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), content);
        assert!(!filler_path(&path).exists());
    }

    #[test]
    fn zero_chunks_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(write_fragmented(&dir.path().join("f"), b"abc", 0).is_err());
    }

    #[test]
    fn sparse_fixture_reads_back_with_zeros() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s");
        write_sparse(&path, 10_000, &[(0, &b"head"[..]), (9_996, &b"tail"[..])]).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), 10_000);
        assert_eq!(&bytes[..4], b"head");
        assert_eq!(&bytes[9_996..], b"tail");
        assert!(bytes[4..9_996].iter().all(|&byte| byte == 0));
    }

    #[test]
    fn inspecting_an_empty_file_opens_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty");
        File::create(&path).unwrap();
        let report = inspect(&path).unwrap();
        assert_eq!(report.kind, FileKind::Regular);
        assert_eq!(report.allocated, 0);
        assert!(report.strategy.is_none());
    }
}
