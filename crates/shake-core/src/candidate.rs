//! Candidates: the files a scan judges.
//!
//! [`investigate`] gathers everything judging needs. Regular files with
//! allocated blocks are opened read-write and inspected under a read
//! lease; the lease is dropped again before `investigate` returns, and
//! taken once more when the file is judged.

use crate::ptime;
use shake_error::{Result, ShakeError};
use shake_extent::{ExtentStrategy, Testimony, inspect};
use shake_guard::LeaseGuard;
use shake_types::{FileKind, Guilt, Policy, STAT_BLOCK_SIZE};
use std::fs::{File, FileTimes, Metadata, OpenOptions};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Seconds since the Unix epoch.
#[must_use]
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| i64::try_from(elapsed.as_secs()).unwrap_or(i64::MAX))
}

#[derive(Debug)]
pub struct Candidate {
    pub path: PathBuf,
    pub kind: FileKind,
    pub device: u64,
    pub inode: u64,
    pub mode: u32,
    /// Allocated bytes (`st_blocks` × 512), not the apparent length.
    pub size: u64,
    pub atime: i64,
    pub mtime: i64,
    /// Seconds since creation, or since the last relocation when known.
    pub age: i64,
    pub testimony: Testimony,
    /// Where the file should start; 0 when unknown.
    pub ideal: i64,
    pub guilt: Guilt,
    file: Option<File>,
    times: Option<FileTimes>,
}

impl Candidate {
    /// A candidate known only by name and kind.
    #[must_use]
    pub fn unopened(path: impl Into<PathBuf>, kind: FileKind) -> Self {
        Self {
            path: path.into(),
            kind,
            device: 0,
            inode: 0,
            mode: 0,
            size: 0,
            atime: 0,
            mtime: 0,
            age: 0,
            testimony: Testimony::default(),
            ideal: 0,
            guilt: Guilt::Unjudged,
            file: None,
            times: None,
        }
    }

    #[must_use]
    pub fn file(&self) -> Option<&File> {
        self.file.as_ref()
    }

    #[must_use]
    pub fn fd(&self) -> Option<RawFd> {
        self.file.as_ref().map(AsRawFd::as_raw_fd)
    }

    #[must_use]
    pub const fn start(&self) -> i64 {
        self.testimony.start
    }

    #[must_use]
    pub const fn end(&self) -> i64 {
        self.testimony.end
    }

    /// Regular file with allocated blocks, worth judging.
    #[must_use]
    pub fn is_judgeable(&self) -> bool {
        self.kind == FileKind::Regular && self.size > 0 && self.file.is_some()
    }

    /// Put back the access and modification times seen at investigation.
    pub fn restore_times(&self) -> Result<()> {
        match (&self.file, self.times) {
            (Some(file), Some(times)) => file
                .set_times(times)
                .map_err(|err| ShakeError::os("futimens", err)),
            _ => Ok(()),
        }
    }

    /// Physical placement is stale once the file has been relocated.
    pub fn forget_placement(&mut self) {
        self.testimony.start = 0;
        self.testimony.end = 0;
        self.ideal = 0;
    }

    fn record_stat(&mut self, meta: &Metadata, now: i64) {
        self.size = meta.blocks() * STAT_BLOCK_SIZE;
        self.mode = meta.mode();
        self.atime = meta.atime();
        self.mtime = meta.mtime();
        self.age = now - meta.ctime();
        let mut times = FileTimes::new();
        if let Ok(accessed) = meta.accessed() {
            times = times.set_accessed(accessed);
        }
        if let Ok(modified) = meta.modified() {
            times = times.set_modified(modified);
        }
        self.times = Some(times);
    }
}

/// Open read-write without touching the access time, falling back to a
/// plain open when the caller does not own the file.
fn open_quietly(path: &Path) -> Result<File> {
    let open = |flags| {
        OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(flags)
            .open(path)
    };
    match open(libc::O_NOATIME) {
        Err(err) if err.raw_os_error() == Some(libc::EPERM) => {
            open(0).map_err(|err| ShakeError::os("open", err))
        }
        other => other.map_err(|err| ShakeError::os("open", err)),
    }
}

/// Gather a candidate's kind, sizes, times and, for regular files with
/// allocated blocks, its physical layout.
pub fn investigate(path: &Path, policy: &Policy, guard: &mut LeaseGuard) -> Result<Candidate> {
    let link = std::fs::symlink_metadata(path)
        .map_err(|err| ShakeError::os("lstat", err).at(path))?;
    let mut candidate = Candidate::unopened(path, FileKind::from_file_type(link.file_type()));
    candidate.device = link.dev();
    candidate.inode = link.ino();
    candidate.mode = link.mode();
    candidate.size = link.blocks() * STAT_BLOCK_SIZE;
    if candidate.kind != FileKind::Regular || candidate.size == 0 {
        return Ok(candidate);
    }

    let file = open_quietly(path).map_err(|err| err.at(path))?;
    let fd = file.as_raw_fd();
    if policy.locks {
        guard.acquire_read(fd, path).map_err(|err| ShakeError::from(err).at(path))?;
    }
    let examined = examine(&mut candidate, &file, policy);
    candidate.file = Some(file);
    if policy.locks {
        guard.report_notices();
        if let Err(err) = guard.release(fd) {
            debug!(target: "shake::scan", path = %path.display(), error = %err, "lease_release_failed");
        }
    }
    examined.map_err(|err| err.at(path))?;
    debug!(
        target: "shake::scan",
        path = %path.display(),
        size = candidate.size,
        fragments = candidate.testimony.fragments,
        crumbs = candidate.testimony.crumbs,
        "investigated"
    );
    Ok(candidate)
}

fn examine(candidate: &mut Candidate, file: &File, policy: &Policy) -> Result<()> {
    let meta = file.metadata().map_err(|err| ShakeError::os("fstat", err))?;
    if meta.ino() != candidate.inode || meta.dev() != candidate.device {
        return Err(ShakeError::Moved);
    }
    let now = unix_now();
    candidate.record_stat(&meta, now);
    if policy.xattr {
        if let Some(placed) = ptime::get(file, now) {
            candidate.age = now - placed;
        }
    }
    let strategy = ExtentStrategy::probe(file)?;
    candidate.testimony = inspect(
        file,
        strategy,
        candidate.size,
        policy.crumb_ratio,
        policy.logs_fragments(),
    )?;
    Ok(())
}
