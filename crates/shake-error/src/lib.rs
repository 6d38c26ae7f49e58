#![forbid(unsafe_code)]
//! Error taxonomy for shake.
//!
//! Errors fall into two classes. Soft errors concern a single candidate:
//! the scan reports them and moves on, and the candidate's data is
//! guaranteed untouched. Fatal errors ([`ShakeError::is_fatal`]) end the
//! process: either the point of no return has been passed and the only
//! intact copy of a file is the scratch file, or the process could not be
//! set up at all.

use std::io;
use std::os::fd::RawFd;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ShakeError>;

/// Misuse or loss of an advisory lease.
#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("descriptor {0} already holds a lease")]
    AlreadyTracked(RawFd),
    #[error("descriptor {0} holds no lease")]
    NotTracked(RawFd),
    #[error("lease on descriptor {0} was broken by another process")]
    Broken(RawFd),
    #[error("lease table is full")]
    TableFull,
    #[error("kernel refused lease on descriptor {fd}: {source}")]
    Kernel {
        fd: RawFd,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ShakeError {
    /// A system call failed.
    #[error("{op} failed: {source}")]
    Os {
        op: &'static str,
        #[source]
        source: io::Error,
    },
    /// Attaches the candidate's path to another error.
    #[error("{}: {source}", .path.display())]
    Candidate {
        path: PathBuf,
        #[source]
        source: Box<ShakeError>,
    },
    #[error("file has moved between lstat and open")]
    Moved,
    #[error("concurrent access")]
    ConcurrentAccess,
    #[error("no open descriptor to relocate through")]
    NotOpen,
    #[error(transparent)]
    Lease(#[from] LeaseError),
    #[error("copy size mismatch: source is {source_len} bytes, destination is {dest_len} bytes")]
    SizeMismatch { source_len: u64, dest_len: u64 },
    /// The backup copy failed; the source has not been modified.
    #[error("{}: temporary copy failed: {source}", .path.display())]
    Backup {
        path: PathBuf,
        #[source]
        source: Box<ShakeError>,
    },
    /// Failure after the source was truncated.
    #[error("{}: {reason}; file has been saved at {}", .path.display(), .backup.display())]
    Unrecoverable {
        path: PathBuf,
        backup: PathBuf,
        reason: String,
    },
    #[error("setup failed: {0}")]
    Setup(String),
}

impl ShakeError {
    /// Wrap the last OS error for `op`.
    #[must_use]
    pub fn last_os(op: &'static str) -> Self {
        Self::Os {
            op,
            source: io::Error::last_os_error(),
        }
    }

    #[must_use]
    pub fn os(op: &'static str, source: io::Error) -> Self {
        Self::Os { op, source }
    }

    /// Attach `path` unless the error already names a path.
    #[must_use]
    pub fn at(self, path: impl Into<PathBuf>) -> Self {
        match self {
            Self::Candidate { .. } | Self::Backup { .. } | Self::Unrecoverable { .. } => self,
            other => Self::Candidate {
                path: path.into(),
                source: Box::new(other),
            },
        }
    }

    /// The process must stop: data is at risk or setup failed.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Unrecoverable { .. } | Self::Setup(_) => true,
            Self::Candidate { source, .. } => source.is_fatal(),
            _ => false,
        }
    }

    /// Errno of the innermost system call failure, if any.
    #[must_use]
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::Os { source, .. } => source.raw_os_error(),
            Self::Lease(LeaseError::Kernel { source, .. }) => source.raw_os_error(),
            Self::Candidate { source, .. } | Self::Backup { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}
