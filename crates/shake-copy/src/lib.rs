//! Copy engine shared by the backup and restore halves of a rewrite.
//!
//! [`copy`] streams one descriptor into another from offset 0. With a
//! non-zero `gap`, the destination becomes sparse: the engine reads in
//! units of the destination's physical block size and turns any run of
//! all-zero buffers at least `gap` bytes long into a hole. Shorter runs
//! are written out verbatim.
//!
//! With a [`LeaseProbe`], the engine checks before every read whether the
//! source lease is still held and stops early with
//! [`CopyOutcome::Cancelled`] when it is not.
//!
//! The copy only succeeds when source and destination end with the same
//! length.

#![forbid(unsafe_code)]

use nix::fcntl::{PosixFadviseAdvice, posix_fadvise};
use shake_error::{Result, ShakeError};
use shake_extent::physical_block_size;
use shake_types::LeaseProbe;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use tracing::{debug, trace};

/// Buffer size when not sparsifying.
pub const DEFAULT_BUFFER: usize = 65_535;

/// Upper bound on the zero bytes held back before they must be flushed or
/// skipped.
const MAX_PENDING_ZEROS: u64 = 0x7FFF_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyOutcome {
    Copied,
    /// The source lease was lost. The destination holds a partial copy.
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Layout {
    buffer_len: usize,
    /// Consecutive all-zero buffers that make a hole; 0 disables holes.
    gap_buffers: u64,
}

impl Layout {
    const DENSE: Self = Self {
        buffer_len: DEFAULT_BUFFER,
        gap_buffers: 0,
    };

    fn for_destination(dst: &File, gap: u64) -> Result<Self> {
        if gap == 0 {
            return Ok(Self::DENSE);
        }
        let block_size = physical_block_size(dst)?;
        let Ok(buffer_len) = usize::try_from(block_size) else {
            return Ok(Self::DENSE);
        };
        if buffer_len == 0 || isize::try_from(buffer_len).is_err() {
            return Ok(Self::DENSE);
        }
        Ok(Self {
            buffer_len,
            gap_buffers: gap.div_ceil(u64::from(block_size)),
        })
    }

    const fn sparse(self) -> bool {
        self.gap_buffers > 0
    }
}

/// Copy `src` over `dst`, making zero runs of at least `gap` bytes into
/// holes (`gap == 0` writes every byte).
///
/// `dst` is truncated first unless it is already empty, so space the
/// caller preallocated past its end survives.
pub fn copy(
    src: &File,
    dst: &File,
    gap: u64,
    cancel: Option<&dyn LeaseProbe>,
) -> Result<CopyOutcome> {
    let mut reader = src;
    let mut writer = dst;
    reader
        .seek(SeekFrom::Start(0))
        .map_err(|err| ShakeError::os("lseek", err))?;
    writer
        .seek(SeekFrom::Start(0))
        .map_err(|err| ShakeError::os("lseek", err))?;
    if apparent_len(dst)? != 0 {
        dst.set_len(0).map_err(|err| ShakeError::os("ftruncate", err))?;
    }
    advise_sequential(src);

    let layout = Layout::for_destination(dst, gap)?;
    debug!(
        target: "shake::copy",
        gap,
        buffer_len = layout.buffer_len,
        gap_buffers = layout.gap_buffers,
        "copy_started"
    );

    let mut buffer = vec![0_u8; layout.buffer_len];
    let zeros = if layout.sparse() {
        vec![0_u8; layout.buffer_len]
    } else {
        Vec::new()
    };
    let buffer_bytes = buffer.len() as u64;
    let mut pending: u64 = 0;
    let mut holes: u64 = 0;

    loop {
        if let Some(probe) = cancel {
            if probe.lease_lost(src.as_raw_fd()) {
                debug!(target: "shake::copy", "copy_cancelled_lease_lost");
                return Ok(CopyOutcome::Cancelled);
            }
        }

        let len = read_full(&mut reader, &mut buffer).map_err(|err| ShakeError::os("read", err))?;
        let eof = len < buffer.len();
        let chunk = &buffer[..len];

        if !layout.sparse() {
            write_all(&mut writer, chunk)?;
            if eof {
                break;
            }
            continue;
        }

        // The last buffer is always written so the destination ends at
        // the right length.
        let empty = !eof && chunk.iter().all(|&byte| byte == 0);
        if empty {
            pending += 1;
        }
        let must_flush = !empty || eof || (pending + 1) * buffer_bytes > MAX_PENDING_ZEROS;
        if must_flush && pending > 0 {
            if pending >= layout.gap_buffers && len != 0 {
                let skip = i64::try_from(pending * buffer_bytes)
                    .map_err(|_| ShakeError::os("lseek", io::Error::from(io::ErrorKind::InvalidInput)))?;
                writer
                    .seek(SeekFrom::Current(skip))
                    .map_err(|err| ShakeError::os("lseek", err))?;
                trace!(target: "shake::copy", bytes = skip, "hole_skipped");
                holes += 1;
            } else {
                for _ in 0..pending {
                    write_all(&mut writer, &zeros)?;
                }
            }
            pending = 0;
        }
        if !empty {
            write_all(&mut writer, chunk)?;
        }
        if eof {
            break;
        }
    }

    let source_len = apparent_len(src)?;
    let dest_len = apparent_len(dst)?;
    if source_len != dest_len {
        return Err(ShakeError::SizeMismatch {
            source_len,
            dest_len,
        });
    }
    debug!(target: "shake::copy", bytes = dest_len, holes, "copy_finished");
    Ok(CopyOutcome::Copied)
}

fn apparent_len(file: &File) -> Result<u64> {
    file.metadata()
        .map(|meta| meta.len())
        .map_err(|err| ShakeError::os("fstat", err))
}

/// Fill `buffer` unless end of file comes first.
fn read_full(reader: &mut impl Read, buffer: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        match reader.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

fn write_all(writer: &mut impl Write, bytes: &[u8]) -> Result<()> {
    writer
        .write_all(bytes)
        .map_err(|err| ShakeError::os("write", err))
}

/// Read-ahead hints; refusals are harmless.
fn advise_sequential(file: &File) {
    let fd = file.as_raw_fd();
    for advice in [
        PosixFadviseAdvice::POSIX_FADV_SEQUENTIAL,
        PosixFadviseAdvice::POSIX_FADV_WILLNEED,
    ] {
        if let Err(errno) = posix_fadvise(fd, 0, 0, advice) {
            trace!(target: "shake::copy", error = %errno, "fadvise_refused");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::fs::OpenOptions;
    use std::os::fd::RawFd;
    use std::os::unix::fs::MetadataExt;
    use std::path::Path;

    fn open_rw(path: &Path) -> File {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .unwrap()
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8 | 1).collect()
    }

    fn allocated(file: &File) -> u64 {
        file.metadata().unwrap().blocks() * 512
    }

    struct LostAfter {
        polls: Cell<u32>,
        limit: u32,
    }

    impl LostAfter {
        fn new(limit: u32) -> Self {
            Self {
                polls: Cell::new(0),
                limit,
            }
        }
    }

    impl LeaseProbe for LostAfter {
        fn lease_lost(&self, _fd: RawFd) -> bool {
            let polls = self.polls.get();
            self.polls.set(polls + 1);
            polls >= self.limit
        }
    }

    #[test]
    fn copy_there_and_back_preserves_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let original = pattern(200_003);
        std::fs::write(dir.path().join("a"), &original).unwrap();
        let a = open_rw(&dir.path().join("a"));
        let b = open_rw(&dir.path().join("b"));

        assert_eq!(copy(&a, &b, 0, None).unwrap(), CopyOutcome::Copied);
        assert_eq!(copy(&b, &a, 0, None).unwrap(), CopyOutcome::Copied);
        assert_eq!(std::fs::read(dir.path().join("a")).unwrap(), original);
        assert_eq!(std::fs::read(dir.path().join("b")).unwrap(), original);
    }

    #[test]
    fn copy_replaces_longer_destination() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"short").unwrap();
        std::fs::write(dir.path().join("b"), pattern(100_000)).unwrap();
        let a = open_rw(&dir.path().join("a"));
        let b = open_rw(&dir.path().join("b"));

        copy(&a, &b, 0, None).unwrap();
        assert_eq!(std::fs::read(dir.path().join("b")).unwrap(), b"short");
    }

    #[test]
    fn empty_source_gives_empty_destination() {
        let dir = tempfile::tempdir().unwrap();
        let a = open_rw(&dir.path().join("a"));
        let b = open_rw(&dir.path().join("b"));
        assert_eq!(copy(&a, &b, 65_536, None).unwrap(), CopyOutcome::Copied);
        assert_eq!(b.metadata().unwrap().len(), 0);
    }

    #[test]
    fn zeros_are_written_when_not_sparsifying() {
        let dir = tempfile::tempdir().unwrap();
        let zeros = vec![0_u8; 1 << 20];
        std::fs::write(dir.path().join("a"), &zeros).unwrap();
        let a = open_rw(&dir.path().join("a"));
        let b = open_rw(&dir.path().join("b"));

        copy(&a, &b, 0, None).unwrap();
        b.sync_all().unwrap();
        assert_eq!(std::fs::read(dir.path().join("b")).unwrap(), zeros);
        assert!(allocated(&b) >= zeros.len() as u64);
    }

    #[test]
    fn long_zero_runs_become_holes() {
        let dir = tempfile::tempdir().unwrap();
        let mut content = pattern(8192);
        content.extend(vec![0_u8; 1 << 20]);
        content.extend(pattern(8192));
        std::fs::write(dir.path().join("a"), &content).unwrap();
        let a = open_rw(&dir.path().join("a"));
        let b = open_rw(&dir.path().join("b"));

        copy(&a, &b, 65_536, None).unwrap();
        a.sync_all().unwrap();
        b.sync_all().unwrap();
        assert_eq!(b.metadata().unwrap().len(), content.len() as u64);
        assert_eq!(std::fs::read(dir.path().join("b")).unwrap(), content);
        assert!(allocated(&b) < allocated(&a));
    }

    #[test]
    fn short_zero_runs_are_written_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let mut content = pattern(16_384);
        content.extend(vec![0_u8; 8192]);
        content.extend(pattern(16_384));
        std::fs::write(dir.path().join("a"), &content).unwrap();
        let a = open_rw(&dir.path().join("a"));
        let b = open_rw(&dir.path().join("b"));

        copy(&a, &b, 65_536, None).unwrap();
        a.sync_all().unwrap();
        b.sync_all().unwrap();
        assert_eq!(std::fs::read(dir.path().join("b")).unwrap(), content);
        assert!(allocated(&b) >= allocated(&a));
    }

    #[test]
    fn trailing_zeros_keep_the_length() {
        let dir = tempfile::tempdir().unwrap();
        let mut content = pattern(4096);
        content.extend(vec![0_u8; 512 * 1024]);
        std::fs::write(dir.path().join("a"), &content).unwrap();
        let a = open_rw(&dir.path().join("a"));
        let b = open_rw(&dir.path().join("b"));

        copy(&a, &b, 65_536, None).unwrap();
        assert_eq!(b.metadata().unwrap().len(), content.len() as u64);
        assert_eq!(std::fs::read(dir.path().join("b")).unwrap(), content);
    }

    #[test]
    fn lost_lease_before_first_read_cancels() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), pattern(300_000)).unwrap();
        std::fs::write(dir.path().join("b"), b"stale").unwrap();
        let a = open_rw(&dir.path().join("a"));
        let b = open_rw(&dir.path().join("b"));

        let probe = LostAfter::new(0);
        assert_eq!(copy(&a, &b, 0, Some(&probe)).unwrap(), CopyOutcome::Cancelled);
        assert_eq!(b.metadata().unwrap().len(), 0);
    }

    #[test]
    fn lease_loss_mid_copy_stops_at_a_read_boundary() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), pattern(300_000)).unwrap();
        let a = open_rw(&dir.path().join("a"));
        let b = open_rw(&dir.path().join("b"));

        let probe = LostAfter::new(2);
        assert_eq!(copy(&a, &b, 0, Some(&probe)).unwrap(), CopyOutcome::Cancelled);
        assert_eq!(b.metadata().unwrap().len(), 2 * DEFAULT_BUFFER as u64);
        assert_eq!(probe.polls.get(), 3);
    }

    #[test]
    fn held_lease_lets_copy_finish() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), pattern(70_000)).unwrap();
        let a = open_rw(&dir.path().join("a"));
        let b = open_rw(&dir.path().join("b"));

        let probe = LostAfter::new(u32::MAX);
        assert_eq!(copy(&a, &b, 0, Some(&probe)).unwrap(), CopyOutcome::Copied);
    }

    /// Grows the destination behind the engine's back on a given poll.
    struct GrowsDestination {
        dst: File,
        polls: Cell<u32>,
        at: u32,
    }

    impl LeaseProbe for GrowsDestination {
        fn lease_lost(&self, _fd: RawFd) -> bool {
            let polls = self.polls.get();
            self.polls.set(polls + 1);
            if polls == self.at {
                self.dst.set_len(10_000_000).unwrap();
            }
            false
        }
    }

    #[test]
    fn length_mismatch_fails_the_copy() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), pattern(70_000)).unwrap();
        let a = open_rw(&dir.path().join("a"));
        let b = open_rw(&dir.path().join("b"));

        let intruder = GrowsDestination {
            dst: b.try_clone().unwrap(),
            polls: Cell::new(0),
            at: 1,
        };
        let err = copy(&a, &b, 0, Some(&intruder)).unwrap_err();
        assert!(matches!(
            err,
            ShakeError::SizeMismatch {
                source_len: 70_000,
                dest_len: 10_000_000,
            }
        ));
        assert!(!err.is_fatal());
    }
}
