//! Process signal handling.
//!
//! Terminating signals remove the scratch file and re-raise themselves with
//! the default disposition, except while a rewrite is critical: then the
//! only intact copy of the file is the scratch file, so the handler prints
//! where it was saved and exits without removing it.
//!
//! The lease-break signal ([`LEASE_SIGNAL`]) is routed to
//! [`LeaseTable::on_notification`](crate::LeaseTable::on_notification).

use crate::lease::LEASES;
use crate::mode::{MODE, Mode, ModeMachine};
use libc::c_int;
use nix::sys::signal::{
    SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal, sigaction, sigprocmask,
};
use shake_error::{Result, ShakeError};
use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use tracing::debug;

/// Signal the kernel sends when a lease is being broken.
pub const LEASE_SIGNAL: Signal = Signal::SIGIO;

const TERMINATING: [Signal; 13] = [
    Signal::SIGHUP,
    Signal::SIGINT,
    Signal::SIGPIPE,
    Signal::SIGQUIT,
    Signal::SIGTERM,
    Signal::SIGUSR1,
    Signal::SIGUSR2,
    Signal::SIGXCPU,
    Signal::SIGXFSZ,
    Signal::SIGILL,
    Signal::SIGFPE,
    Signal::SIGSEGV,
    Signal::SIGBUS,
];

/// Signals left deliverable inside a critical section: synchronous faults,
/// lease breaks and job control.
const UNBLOCKABLE: [Signal; 7] = [
    Signal::SIGILL,
    Signal::SIGFPE,
    Signal::SIGSEGV,
    Signal::SIGBUS,
    Signal::SIGIO,
    Signal::SIGTSTP,
    Signal::SIGSTOP,
];

static TEMP_PATH: OnceLock<CString> = OnceLock::new();
static CRITICAL_NOTICE: AtomicPtr<u8> = AtomicPtr::new(std::ptr::null_mut());
static CRITICAL_NOTICE_LEN: AtomicUsize = AtomicUsize::new(0);

// ── Handlers ────────────────────────────────────────────────────────────────

fn write_stderr(bytes: *const u8, len: usize) {
    // SAFETY: `bytes` points to `len` readable bytes; write(2) is
    // async-signal-safe.
    unsafe {
        libc::write(libc::STDERR_FILENO, bytes.cast(), len);
    }
}

extern "C" fn on_terminating_signal(signal: c_int) {
    let notice = CRITICAL_NOTICE.load(Ordering::Acquire);
    if !notice.is_null() || MODE.current() == Mode::Critical {
        if !notice.is_null() {
            write_stderr(notice, CRITICAL_NOTICE_LEN.load(Ordering::Acquire));
            write_stderr(b"\n".as_ptr(), 1);
        }
        // SAFETY: _exit is async-signal-safe and skips atexit handlers.
        unsafe { libc::_exit(1) };
    }
    if let Some(path) = TEMP_PATH.get() {
        // SAFETY: `path` is a NUL-terminated string that lives for the
        // rest of the process.
        unsafe {
            libc::unlink(path.as_ptr());
        }
    }
    // The disposition was reset on entry, so this terminates once the
    // handler returns.
    // SAFETY: raise is async-signal-safe.
    unsafe {
        libc::raise(signal);
    }
}

extern "C" fn on_lease_signal(_signal: c_int) {
    LEASES.on_notification();
}

/// Install the process signal handlers. `temp_path` is removed by the
/// terminating-signal handler outside critical sections.
pub fn install(temp_path: &Path) -> Result<()> {
    let path = CString::new(temp_path.as_os_str().as_bytes())
        .map_err(|_| ShakeError::Setup(format!("bad temporary path {}", temp_path.display())))?;
    if TEMP_PATH.set(path).is_err() {
        debug!(target: "shake::cli", "signal_handlers_already_installed");
        return Ok(());
    }

    let terminating = SigAction::new(
        SigHandler::Handler(on_terminating_signal),
        SaFlags::SA_RESETHAND,
        SigSet::empty(),
    );
    for signal in TERMINATING {
        // SAFETY: the handler only calls async-signal-safe functions and
        // reads atomics and a string that is never mutated after this point.
        unsafe { sigaction(signal, &terminating) }
            .map_err(|errno| ShakeError::os("sigaction", io::Error::from(errno)))?;
    }

    let lease = SigAction::new(
        SigHandler::Handler(on_lease_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    // SAFETY: the handler only touches the static lease table's atomics
    // and issues fcntl.
    unsafe { sigaction(LEASE_SIGNAL, &lease) }
        .map_err(|errno| ShakeError::os("sigaction", io::Error::from(errno)))?;
    debug!(target: "shake::cli", temp = %temp_path.display(), "signal_handlers_installed");
    Ok(())
}

// ── Critical section ────────────────────────────────────────────────────────

/// The window in which a candidate's only intact copy is the scratch file.
///
/// Entering moves the mode to CRITICAL, blocks every signal except
/// [`UNBLOCKABLE`] ones and arms the notice the terminating handler prints.
/// [`leave`](Self::leave) undoes all three. Dropping without leaving keeps
/// the process critical: the mask stays in place and the notice stays armed.
pub struct CriticalSection<'m> {
    mode: &'m ModeMachine,
    previous: SigSet,
    notice: Option<Box<[u8]>>,
}

impl<'m> CriticalSection<'m> {
    pub fn enter(mode: &'m ModeMachine, notice: String) -> Result<Self> {
        let notice = notice.into_bytes().into_boxed_slice();
        let mut blocked = SigSet::all();
        for signal in UNBLOCKABLE {
            blocked.remove(signal);
        }
        let mut previous = SigSet::empty();
        sigprocmask(SigmaskHow::SIG_BLOCK, Some(&blocked), Some(&mut previous))
            .map_err(|errno| ShakeError::os("sigprocmask", io::Error::from(errno)))?;

        CRITICAL_NOTICE_LEN.store(notice.len(), Ordering::Release);
        CRITICAL_NOTICE.store(notice.as_ptr().cast_mut(), Ordering::Release);
        mode.begin_critical();
        Ok(Self {
            mode,
            previous,
            notice: Some(notice),
        })
    }

    pub fn leave(mut self) -> Result<()> {
        self.mode.end_critical();
        CRITICAL_NOTICE.store(std::ptr::null_mut(), Ordering::Release);
        CRITICAL_NOTICE_LEN.store(0, Ordering::Release);
        self.notice = None;
        sigprocmask(SigmaskHow::SIG_SETMASK, Some(&self.previous), None)
            .map_err(|errno| ShakeError::os("sigprocmask", io::Error::from(errno)))
    }
}

impl Drop for CriticalSection<'_> {
    fn drop(&mut self) {
        // Still armed: the handler may read the notice until the process exits.
        if let Some(notice) = self.notice.take() {
            let _ = Box::leak(notice);
        }
    }
}
