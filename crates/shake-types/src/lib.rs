#![forbid(unsafe_code)]
//! Shared vocabulary: placement constants, the judging [`Policy`], the
//! tri-state [`Guilt`] flag and the [`LeaseProbe`] seam through which the
//! copy engine observes lease loss.

use serde::{Deserialize, Serialize};
use std::os::fd::RawFd;

// ── Constants ────────────────────────────────────────────────────────────────

/// Distance in bytes above which two physical blocks belong to different
/// fragments. Roughly twice the readahead window of common disks.
pub const MAGICLEAP: i64 = 2 * 32 * 1024;

/// Files whose access times differ by less than this many seconds are
/// considered used together.
pub const MAGICTIME: i64 = 8;

/// Tolerance sentinel: files in a tier with this tolerance are never shaken.
pub const DISABLED_TOLERANCE: f64 = -1.0;

/// Bytes per unit of `st_blocks`.
pub const STAT_BLOCK_SIZE: u64 = 512;

const DAY: i64 = 24 * 60 * 60;
const KB: u64 = 1000;
const MB: u64 = 1000 * KB;

// ── Candidate classification ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
    Other,
}

impl FileKind {
    #[must_use]
    pub fn from_file_type(file_type: std::fs::FileType) -> Self {
        if file_type.is_symlink() {
            Self::Symlink
        } else if file_type.is_dir() {
            Self::Directory
        } else if file_type.is_file() {
            Self::Regular
        } else {
            Self::Other
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Guilt {
    #[default]
    Unjudged,
    Innocent,
    Guilty,
}

impl Guilt {
    #[must_use]
    pub const fn from_verdict(guilty: bool) -> Self {
        if guilty { Self::Guilty } else { Self::Innocent }
    }

    #[must_use]
    pub const fn is_guilty(self) -> bool {
        matches!(self, Self::Guilty)
    }
}

// ── Policy ──────────────────────────────────────────────────────────────────

/// Thresholds and switches shared read-only by every component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub max_fragments: u32,
    /// Fraction of the file size under which a fragment is a crumb.
    pub crumb_ratio: f64,
    pub max_crumbs: u32,
    /// Files smaller than this (bytes) use `small_tolerance`. 0 disables the tier.
    pub small_size: u64,
    /// Files bigger than this (bytes) use `big_tolerance`. 0 disables the tier.
    pub big_size: u64,
    pub small_tolerance: f64,
    pub big_tolerance: f64,
    /// Maximum distance in bytes between a file's start and its ideal
    /// position. 0 disables the check.
    pub max_deviance: u64,
    /// Files older than this (seconds) are always shaken.
    pub old: i64,
    /// Files younger than this (seconds) are never shaken.
    pub new: i64,
    pub pretend: bool,
    pub verbosity: u8,
    pub locks: bool,
    /// Do not descend into directories on another device.
    pub one_file_system: bool,
    /// Read and write the placement-time extended attribute.
    pub xattr: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            max_fragments: 21,
            crumb_ratio: 0.95 / 100.0,
            max_crumbs: 9,
            small_size: 16 * KB,
            big_size: 95 * MB,
            small_tolerance: 0.1,
            big_tolerance: DISABLED_TOLERANCE,
            max_deviance: MAGICLEAP.unsigned_abs() * 4,
            old: 8 * 31 * DAY,
            new: 31 * DAY,
            pretend: false,
            verbosity: 0,
            locks: true,
            one_file_system: true,
            xattr: true,
        }
    }
}

impl Policy {
    /// Set the "new" age in days, raising "old" if needed.
    pub fn set_new_days(&mut self, days: u32) {
        self.new = DAY * i64::from(days);
        if self.new > self.old {
            self.old = self.new;
        }
    }

    /// Set the "old" age in days, lowering "new" if needed.
    pub fn set_old_days(&mut self, days: u32) {
        self.old = DAY * i64::from(days);
        if self.old < self.new {
            self.new = self.old;
        }
    }

    pub fn set_small_size_kb(&mut self, kb: u64) {
        self.small_size = kb.saturating_mul(KB);
        if self.small_size > self.big_size {
            self.big_size = self.small_size;
        }
    }

    pub fn set_big_size_kb(&mut self, kb: u64) {
        self.big_size = kb.saturating_mul(KB);
        if self.big_size < self.small_size {
            self.small_size = self.big_size;
        }
    }

    /// Verbosity from which fragment positions are recorded.
    #[must_use]
    pub const fn logs_fragments(&self) -> bool {
        self.verbosity >= 3
    }
}

// ── Lease observation ───────────────────────────────────────────────────────

/// Lets the copy engine ask, between reads, whether the lease on the source
/// descriptor has been lost.
pub trait LeaseProbe {
    fn lease_lost(&self, fd: RawFd) -> bool;
}
