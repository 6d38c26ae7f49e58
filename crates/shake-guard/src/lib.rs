//! Concurrency guards for rewriting files in place.
//!
//! - [`lease`]: the fixed-size lease table and the [`LeaseGuard`] that owns it
//!   on the main thread.
//! - [`mode`]: the NORMAL → BACKUP → CRITICAL → NORMAL state machine.
//! - [`signals`]: process signal handlers and the signal mask used while
//!   the scratch file holds the only copy of a file.
//!
//! Signal handlers only touch atomics in [`LEASES`] and [`MODE`].

pub mod lease;
pub mod mode;
pub mod signals;

pub use lease::{LEASE_SLOTS, LEASES, LeaseGuard, LeaseTable};
pub use mode::{MODE, Mode, ModeMachine};
pub use signals::{CriticalSection, LEASE_SIGNAL, install};
