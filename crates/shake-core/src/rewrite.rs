#![forbid(unsafe_code)]
//! Relocating a guilty file in place.
//!
//! 1. BACKUP: copy the file to the scratch file while holding its read
//!    lease. Losing the lease here cancels; the file is untouched.
//! 2. Promote the lease to write level. Refusal also cancels.
//! 3. CRITICAL: truncate the file, preallocate its length and copy the
//!    scratch file back. From the truncation on, any failure is
//!    unrecoverable and the scratch file is the only intact copy.
//! 4. Restore access and modification times, leave CRITICAL and record
//!    the placement time.

use crate::candidate::{Candidate, unix_now};
use crate::ptime;
use nix::fcntl::{FallocateFlags, fallocate};
use shake_copy::{CopyOutcome, copy};
use shake_error::{Result, ShakeError};
use shake_guard::{CriticalSection, LeaseGuard, ModeMachine};
use shake_types::{LeaseProbe, MAGICLEAP, Policy};
use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Hole threshold for the backup copy.
const BACKUP_GAP: u64 = MAGICLEAP.unsigned_abs();
/// Hole threshold for the restore copy.
const RESTORE_GAP: u64 = 4 * MAGICLEAP.unsigned_abs();

/// The temporary file backups are written to, reused across candidates.
#[derive(Debug)]
pub struct Scratch {
    file: File,
    path: PathBuf,
}

impl Scratch {
    #[must_use]
    pub fn new(file: File, path: PathBuf) -> Self {
        Self { file, path }
    }

    #[must_use]
    pub fn file(&self) -> &File {
        &self.file
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Give the scratch file's space back between candidates.
    pub fn clear(&self) -> Result<()> {
        self.file
            .set_len(0)
            .map_err(|err| ShakeError::os("ftruncate", err))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relocation {
    Relocated,
    /// Nothing was done because the policy is a dry run.
    DryRun,
    /// Another process touched the file during the backup.
    Cancelled,
}

/// Relocate `candidate`, which must be guilty and hold a read lease when
/// `policy.locks` is set.
pub fn shake(
    candidate: &Candidate,
    scratch: &Scratch,
    policy: &Policy,
    guard: &mut LeaseGuard,
    mode: &ModeMachine,
) -> Result<Relocation> {
    if policy.pretend {
        return Ok(Relocation::DryRun);
    }
    let file = candidate.file().ok_or(ShakeError::NotOpen)?;
    let path = candidate.path.as_path();
    let fd = file.as_raw_fd();

    mode.begin_backup();
    let probe: Option<&dyn LeaseProbe> = if policy.locks { Some(&*guard) } else { None };
    match copy(file, scratch.file(), BACKUP_GAP, probe) {
        Ok(CopyOutcome::Copied) => {}
        Ok(CopyOutcome::Cancelled) => return Ok(cancel(path, scratch, guard, mode)),
        Err(err) => {
            abandon(scratch, mode);
            return Err(ShakeError::Backup {
                path: path.to_path_buf(),
                source: Box::new(err),
            });
        }
    }
    if policy.locks && guard.promote(fd).is_err() {
        return Ok(cancel(path, scratch, guard, mode));
    }

    let length = file
        .metadata()
        .map(|meta| meta.len())
        .map_err(|err| ShakeError::os("fstat", err));
    let length = match length {
        Ok(length) => length,
        Err(err) => {
            abandon(scratch, mode);
            return Err(ShakeError::Backup {
                path: path.to_path_buf(),
                source: Box::new(err),
            });
        }
    };

    let notice = format!(
        "{}: unrecoverable internal error! file has been saved at {}",
        path.display(),
        scratch.path().display()
    );
    let critical = match CriticalSection::enter(mode, notice) {
        Ok(critical) => critical,
        Err(err) => {
            abandon(scratch, mode);
            return Err(err.at(path));
        }
    };

    if let Err(reason) = restore(file, scratch, length) {
        error!(
            target: "shake::rewrite",
            path = %path.display(),
            backup = %scratch.path().display(),
            error = %reason,
            "restore_failed"
        );
        // Stay critical: the mask and the notice remain until exit.
        drop(critical);
        return Err(ShakeError::Unrecoverable {
            path: path.to_path_buf(),
            backup: scratch.path().to_path_buf(),
            reason,
        });
    }

    if let Err(err) = candidate.restore_times() {
        warn!(target: "shake::rewrite", path = %path.display(), error = %err, "times_not_restored");
    }
    if policy.locks && guard.write_break_noticed(fd) {
        warn!(
            target: "shake::rewrite",
            path = %path.display(),
            "accessed_during_rewrite_may_be_killed_if_slow"
        );
    }
    critical.leave().map_err(|err| err.at(path))?;

    if policy.xattr {
        if let Err(err) = ptime::set(file, unix_now()) {
            warn!(
                target: "shake::rewrite",
                path = %path.display(),
                error = %err,
                "placement_time_not_recorded_check_user_xattr"
            );
        }
    }
    if let Err(err) = scratch.clear() {
        warn!(target: "shake::rewrite", error = %err, "scratch_not_cleared");
    }
    info!(target: "shake::rewrite", path = %path.display(), bytes = length, "relocated");
    Ok(Relocation::Relocated)
}

/// Steps between truncation and a full copy back. Errors are already
/// described for the unrecoverable report.
fn restore(file: &File, scratch: &Scratch, length: u64) -> std::result::Result<(), String> {
    file.set_len(0)
        .map_err(|err| format!("failed to truncate: {err}"))?;
    preallocate(file, length);
    match copy(scratch.file(), file, RESTORE_GAP, None) {
        Ok(CopyOutcome::Copied) => Ok(()),
        Ok(CopyOutcome::Cancelled) => Err("restore was cancelled".to_owned()),
        Err(err) => Err(format!("restore failed: {err}")),
    }
}

/// Ask the filesystem for `length` contiguous bytes without changing the
/// apparent size. A refusal only costs placement quality.
fn preallocate(file: &File, length: u64) {
    let Ok(length) = libc::off_t::try_from(length) else {
        return;
    };
    if length == 0 {
        return;
    }
    if let Err(errno) = fallocate(file.as_raw_fd(), FallocateFlags::FALLOC_FL_KEEP_SIZE, 0, length) {
        debug!(target: "shake::rewrite", error = %errno, "preallocation_refused");
    }
}

fn cancel(path: &Path, scratch: &Scratch, guard: &LeaseGuard, mode: &ModeMachine) -> Relocation {
    guard.report_notices();
    warn!(target: "shake::rewrite", path = %path.display(), "concurrent_access_shake_cancelled");
    abandon(scratch, mode);
    Relocation::Cancelled
}

/// BACKUP → CANCEL → NORMAL, discarding the partial backup.
fn abandon(scratch: &Scratch, mode: &ModeMachine) {
    mode.cancel();
    if let Err(err) = scratch.clear() {
        warn!(target: "shake::rewrite", error = %err, "scratch_not_cleared");
    }
    mode.end_cancel();
}
