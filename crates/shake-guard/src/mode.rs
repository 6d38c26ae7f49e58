#![forbid(unsafe_code)]
//! Rewrite mode state machine.
//!
//! ```text
//! NORMAL ──begin_backup──▶ BACKUP ──begin_critical──▶ CRITICAL ──end_critical──▶ NORMAL
//!                            │
//!                            └──cancel──▶ CANCEL ──end_cancel──▶ NORMAL
//! ```
//!
//! Every transition is a compare-and-swap from the one permitted predecessor.
//! Any other transition is a programming error and panics.

use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Mode {
    Normal = 0,
    /// A backup copy of the candidate is being written.
    Backup = 1,
    /// The candidate has been truncated. The scratch file holds the only copy.
    Critical = 2,
    /// The backup is being abandoned.
    Cancel = 3,
}

impl Mode {
    const fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Backup,
            2 => Self::Critical,
            3 => Self::Cancel,
            _ => Self::Normal,
        }
    }
}

/// Process-wide mode, readable from signal handlers.
pub static MODE: ModeMachine = ModeMachine::new();

#[derive(Debug)]
pub struct ModeMachine {
    state: AtomicU8,
}

impl Default for ModeMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ModeMachine {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(Mode::Normal as u8),
        }
    }

    /// Current mode. Async-signal-safe.
    #[must_use]
    pub fn current(&self) -> Mode {
        Mode::from_raw(self.state.load(Ordering::Acquire))
    }

    pub fn begin_backup(&self) {
        self.transition(Mode::Normal, Mode::Backup);
    }

    pub fn begin_critical(&self) {
        self.transition(Mode::Backup, Mode::Critical);
    }

    pub fn end_critical(&self) {
        self.transition(Mode::Critical, Mode::Normal);
    }

    pub fn cancel(&self) {
        self.transition(Mode::Backup, Mode::Cancel);
    }

    pub fn end_cancel(&self) {
        self.transition(Mode::Cancel, Mode::Normal);
    }

    fn transition(&self, from: Mode, to: Mode) {
        if let Err(actual) =
            self.state
                .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
        {
            panic!(
                "illegal mode transition {from:?} -> {to:?} while in {:?}",
                Mode::from_raw(actual)
            );
        }
    }
}
