#![forbid(unsafe_code)]
//! Candidate listings, most recently accessed first.

use shake_error::{Result, ShakeError};
use std::cmp::Reverse;
use std::ffi::OsStr;
use std::io::BufRead;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

/// Entries of `dir`, sorted by descending access time.
pub fn list_dir(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir).map_err(|err| ShakeError::os("opendir", err).at(dir))?;
    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| ShakeError::os("readdir", err).at(dir))?;
        paths.push(entry.path());
    }
    sort_by_atime(&mut paths);
    Ok(paths)
}

/// One path per line; empty lines are skipped. Sorted by descending
/// access time.
pub fn from_lines(reader: impl BufRead) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for line in reader.split(b'\n') {
        let line = line.map_err(|err| ShakeError::os("read", err).at("-"))?;
        if line.is_empty() {
            continue;
        }
        paths.push(PathBuf::from(OsStr::from_bytes(&line)));
    }
    sort_by_atime(&mut paths);
    Ok(paths)
}

/// Stable sort, most recently accessed first. Paths that cannot be
/// stat'ed go last.
pub fn sort_by_atime(paths: &mut [PathBuf]) {
    paths.sort_by_cached_key(|path| {
        Reverse(
            std::fs::metadata(path)
                .map(|meta| meta.atime())
                .unwrap_or(i64::MIN),
        )
    });
}
