//! Advisory kernel leases on candidate descriptors.
//!
//! At most [`LEASE_SLOTS`] descriptors are leased at once: the file being
//! inspected and the file being rewritten. Slots live in a static table of
//! atomics so the lease-break signal handler can read and update them
//! without locks or allocation.
//!
//! A slot is held at one of two levels:
//!
//! - **read**: a break notification means another process opened the file.
//!   The handler gives the lease up at once and marks the slot broken.
//! - **write**: the file is being rewritten. A break is only noted; giving
//!   the lease up mid-rewrite would expose a truncated file.
//!
//! The kernel refuses a read lease on a descriptor that is open for
//! writing, so a read-level slot may be backed by a kernel write lease.
//! The granted kernel type is recorded and loss is detected by comparing
//! `F_GETLEASE` against it.

use libc::c_int;
use shake_error::LeaseError;
use shake_types::LeaseProbe;
use std::cell::Cell;
use std::io;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, Ordering};
use tracing::{debug, warn};

pub const LEASE_SLOTS: usize = 2;

const NO_FD: RawFd = -1;

const FREE: u8 = 0;
const READ: u8 = 1;
const WRITE: u8 = 2;
const BROKEN: u8 = 3;

/// Process-wide lease table, shared with the lease-break signal handler.
pub static LEASES: LeaseTable = LeaseTable::new();

// ── Kernel calls ────────────────────────────────────────────────────────────

fn set_lease(fd: RawFd, kind: c_int) -> io::Result<()> {
    // SAFETY: F_SETLEASE takes an integer argument; an invalid descriptor
    // is reported through errno.
    let rc = unsafe { libc::fcntl(fd, libc::F_SETLEASE, kind) };
    if rc == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Current kernel lease type, or -1 on error. Async-signal-safe.
fn get_lease(fd: RawFd) -> c_int {
    // SAFETY: F_GETLEASE takes no argument.
    unsafe { libc::fcntl(fd, libc::F_GETLEASE) }
}

// ── Table ───────────────────────────────────────────────────────────────────

struct LeaseSlot {
    fd: AtomicI32,
    level: AtomicU8,
    kernel: AtomicI32,
    write_notice: AtomicBool,
}

impl LeaseSlot {
    const fn new() -> Self {
        Self {
            fd: AtomicI32::new(NO_FD),
            level: AtomicU8::new(FREE),
            kernel: AtomicI32::new(libc::F_UNLCK),
            write_notice: AtomicBool::new(false),
        }
    }

    /// Give up a read-level lease that the kernel no longer grants as
    /// recorded. Async-signal-safe.
    fn evict_if_lost(&self, fd: RawFd) -> bool {
        if get_lease(fd) == self.kernel.load(Ordering::Acquire) {
            return false;
        }
        if self
            .level
            .compare_exchange(READ, BROKEN, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let _ = set_lease(fd, libc::F_UNLCK);
        }
        true
    }
}

/// Fixed-size table of leased descriptors.
pub struct LeaseTable {
    slots: [LeaseSlot; LEASE_SLOTS],
}

impl Default for LeaseTable {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaseTable {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: [LeaseSlot::new(), LeaseSlot::new()],
        }
    }

    fn find(&self, fd: RawFd) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.fd.load(Ordering::Acquire) == fd)
    }

    /// React to a lease-break notification. Called from the signal handler;
    /// touches only atomics and issues `fcntl`.
    pub fn on_notification(&self) {
        for slot in &self.slots {
            let fd = slot.fd.load(Ordering::Acquire);
            if fd == NO_FD {
                continue;
            }
            match slot.level.load(Ordering::Acquire) {
                READ => {
                    slot.evict_if_lost(fd);
                }
                WRITE => {
                    if get_lease(fd) != slot.kernel.load(Ordering::Acquire) {
                        slot.write_notice.store(true, Ordering::Release);
                    }
                }
                _ => {}
            }
        }
    }

    #[cfg(test)]
    fn force_break(&self, fd: RawFd) {
        if let Some(index) = self.find(fd) {
            let slot = &self.slots[index];
            if slot.level.load(Ordering::Acquire) == WRITE {
                slot.write_notice.store(true, Ordering::Release);
            } else {
                slot.level.store(BROKEN, Ordering::Release);
            }
        }
    }
}

// ── Guard ───────────────────────────────────────────────────────────────────

/// Main-thread owner of a [`LeaseTable`]. Keeps the names of leased files
/// for diagnostics, which the signal handler cannot touch.
pub struct LeaseGuard {
    table: &'static LeaseTable,
    names: [Option<PathBuf>; LEASE_SLOTS],
    reported: [Cell<bool>; LEASE_SLOTS],
}

impl LeaseGuard {
    #[must_use]
    pub fn new(table: &'static LeaseTable) -> Self {
        Self {
            table,
            names: [None, None],
            reported: [Cell::new(false), Cell::new(false)],
        }
    }

    /// Guard over the process-wide [`LEASES`] table.
    #[must_use]
    pub fn global() -> Self {
        Self::new(&LEASES)
    }

    /// Take a read-level lease on `fd`.
    pub fn acquire_read(&mut self, fd: RawFd, name: &Path) -> Result<(), LeaseError> {
        if self.table.find(fd).is_some() {
            return Err(LeaseError::AlreadyTracked(fd));
        }
        let index = self.claim_slot(fd)?;
        let slot = &self.table.slots[index];

        let kernel = match set_lease(fd, libc::F_RDLCK) {
            Ok(()) => libc::F_RDLCK,
            Err(err) if err.raw_os_error() == Some(libc::EAGAIN) => {
                match set_lease(fd, libc::F_WRLCK) {
                    Ok(()) => libc::F_WRLCK,
                    Err(source) => {
                        slot.fd.store(NO_FD, Ordering::Release);
                        return Err(LeaseError::Kernel { fd, source });
                    }
                }
            }
            Err(source) => {
                slot.fd.store(NO_FD, Ordering::Release);
                return Err(LeaseError::Kernel { fd, source });
            }
        };

        slot.kernel.store(kernel, Ordering::Release);
        slot.write_notice.store(false, Ordering::Release);
        slot.level.store(READ, Ordering::Release);
        self.names[index] = Some(name.to_path_buf());
        self.reported[index].set(false);
        debug!(target: "shake::lease", fd, kernel, name = %name.display(), "lease_acquired");
        Ok(())
    }

    /// Raise a read-level lease to write level before rewriting.
    ///
    /// Fails with [`LeaseError::Broken`] if the lease was lost in the
    /// meantime or the kernel refuses the upgrade.
    pub fn promote(&mut self, fd: RawFd) -> Result<(), LeaseError> {
        let index = self.table.find(fd).ok_or(LeaseError::NotTracked(fd))?;
        let slot = &self.table.slots[index];
        if slot
            .level
            .compare_exchange(READ, WRITE, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(LeaseError::Broken(fd));
        }
        if slot.kernel.load(Ordering::Acquire) != libc::F_WRLCK {
            if let Err(source) = set_lease(fd, libc::F_WRLCK) {
                debug!(target: "shake::lease", fd, error = %source, "lease_promotion_refused");
                slot.level.store(BROKEN, Ordering::Release);
                let _ = set_lease(fd, libc::F_UNLCK);
                return Err(LeaseError::Broken(fd));
            }
            slot.kernel.store(libc::F_WRLCK, Ordering::Release);
        }
        if get_lease(fd) != libc::F_WRLCK {
            slot.level.store(BROKEN, Ordering::Release);
            let _ = set_lease(fd, libc::F_UNLCK);
            return Err(LeaseError::Broken(fd));
        }
        Ok(())
    }

    /// Drop the lease on `fd` and free its slot.
    pub fn release(&mut self, fd: RawFd) -> Result<(), LeaseError> {
        let index = self.table.find(fd).ok_or(LeaseError::NotTracked(fd))?;
        self.report_slot(index);
        let slot = &self.table.slots[index];
        let level = slot.level.swap(FREE, Ordering::AcqRel);
        if level != BROKEN {
            if let Err(err) = set_lease(fd, libc::F_UNLCK) {
                debug!(target: "shake::lease", fd, error = %err, "lease_unlock_failed");
            }
        }
        slot.write_notice.store(false, Ordering::Release);
        slot.kernel.store(libc::F_UNLCK, Ordering::Release);
        slot.fd.store(NO_FD, Ordering::Release);
        self.names[index] = None;
        debug!(target: "shake::lease", fd, "lease_released");
        Ok(())
    }

    /// True while `fd` holds an unbroken lease at either level.
    #[must_use]
    pub fn is_held(&self, fd: RawFd) -> bool {
        let Some(index) = self.table.find(fd) else {
            return false;
        };
        let slot = &self.table.slots[index];
        match slot.level.load(Ordering::Acquire) {
            READ => !slot.evict_if_lost(fd),
            WRITE => true,
            _ => false,
        }
    }

    /// True if another process tried to access the file while it was being
    /// rewritten.
    #[must_use]
    pub fn write_break_noticed(&self, fd: RawFd) -> bool {
        self.table.find(fd).is_some_and(|index| {
            self.table.slots[index]
                .write_notice
                .load(Ordering::Acquire)
        })
    }

    /// Log a warning for each lease broken since the last report.
    pub fn report_notices(&self) {
        for index in 0..LEASE_SLOTS {
            self.report_slot(index);
        }
    }

    fn report_slot(&self, index: usize) {
        if self.reported[index].get() {
            return;
        }
        let slot = &self.table.slots[index];
        let Some(name) = &self.names[index] else {
            return;
        };
        if slot.level.load(Ordering::Acquire) == BROKEN {
            warn!(target: "shake::lease", name = %name.display(), "concurrent_access_lease_broken");
            self.reported[index].set(true);
        } else if slot.write_notice.load(Ordering::Acquire) {
            warn!(
                target: "shake::lease",
                name = %name.display(),
                "concurrent_access_during_rewrite"
            );
            self.reported[index].set(true);
        }
    }

    fn claim_slot(&self, fd: RawFd) -> Result<usize, LeaseError> {
        self.table
            .slots
            .iter()
            .position(|slot| {
                slot.fd
                    .compare_exchange(NO_FD, fd, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            })
            .ok_or(LeaseError::TableFull)
    }
}

impl LeaseProbe for LeaseGuard {
    fn lease_lost(&self, fd: RawFd) -> bool {
        !self.is_held(fd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use std::os::fd::AsRawFd;

    fn private_table() -> &'static LeaseTable {
        Box::leak(Box::new(LeaseTable::new()))
    }

    fn scratch() -> (tempfile::TempDir, std::fs::File, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leased");
        std::fs::write(&path, b"payload").unwrap();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        (dir, file, path)
    }

    /// Some filesystems and sandboxes refuse leases; skip those cases.
    fn acquired(guard: &mut LeaseGuard, fd: RawFd, path: &Path) -> bool {
        match guard.acquire_read(fd, path) {
            Ok(()) => true,
            Err(LeaseError::Kernel { source, .. }) => {
                eprintln!("leases unavailable here: {source}");
                false
            }
            Err(other) => panic!("unexpected lease error: {other}"),
        }
    }

    #[test]
    fn release_untracked_descriptor_fails() {
        let mut guard = LeaseGuard::new(private_table());
        assert!(matches!(guard.release(42), Err(LeaseError::NotTracked(42))));
        assert!(matches!(guard.promote(42), Err(LeaseError::NotTracked(42))));
        assert!(!guard.is_held(42));
    }

    #[test]
    fn acquire_hold_release() {
        let (_dir, file, path) = scratch();
        let fd = file.as_raw_fd();
        let mut guard = LeaseGuard::new(private_table());
        if !acquired(&mut guard, fd, &path) {
            return;
        }
        assert!(guard.is_held(fd));
        assert!(!guard.lease_lost(fd));
        assert!(matches!(
            guard.acquire_read(fd, &path),
            Err(LeaseError::AlreadyTracked(_))
        ));
        guard.release(fd).unwrap();
        assert!(!guard.is_held(fd));
        assert!(matches!(guard.release(fd), Err(LeaseError::NotTracked(_))));
    }

    #[test]
    fn promotion_reaches_write_level() {
        let (_dir, file, path) = scratch();
        let fd = file.as_raw_fd();
        let mut guard = LeaseGuard::new(private_table());
        if !acquired(&mut guard, fd, &path) {
            return;
        }
        guard.promote(fd).unwrap();
        assert!(guard.is_held(fd));
        assert!(!guard.write_break_noticed(fd));
        guard.release(fd).unwrap();
    }

    #[test]
    fn broken_read_lease_cannot_be_promoted() {
        let (_dir, file, path) = scratch();
        let fd = file.as_raw_fd();
        let table = private_table();
        let mut guard = LeaseGuard::new(table);
        if !acquired(&mut guard, fd, &path) {
            return;
        }
        table.force_break(fd);
        assert!(guard.lease_lost(fd));
        assert!(matches!(guard.promote(fd), Err(LeaseError::Broken(_))));
        guard.release(fd).unwrap();
    }

    #[test]
    fn write_level_break_is_only_noted() {
        let (_dir, file, path) = scratch();
        let fd = file.as_raw_fd();
        let table = private_table();
        let mut guard = LeaseGuard::new(table);
        if !acquired(&mut guard, fd, &path) {
            return;
        }
        guard.promote(fd).unwrap();
        table.force_break(fd);
        assert!(guard.is_held(fd));
        assert!(guard.write_break_noticed(fd));
        guard.release(fd).unwrap();
    }

    #[test]
    fn table_holds_two_descriptors() {
        let (_dir, file, path) = scratch();
        let mut guard = LeaseGuard::new(private_table());
        assert_eq!(guard.claim_slot(1000).unwrap(), 0);
        assert_eq!(guard.claim_slot(1001).unwrap(), 1);
        assert!(matches!(
            guard.acquire_read(file.as_raw_fd(), &path),
            Err(LeaseError::TableFull)
        ));
    }

    #[test]
    fn notification_without_break_keeps_lease() {
        let (_dir, file, path) = scratch();
        let fd = file.as_raw_fd();
        let table = private_table();
        let mut guard = LeaseGuard::new(table);
        if !acquired(&mut guard, fd, &path) {
            return;
        }
        table.on_notification();
        assert!(guard.is_held(fd));
        guard.release(fd).unwrap();
    }
}
