//! Extent inspection: physical block layout of an open file.
//!
//! Walks the physical placement of a file and folds it into a
//! [`Testimony`]: fragment and crumb counts, first and last physical
//! positions and, on request, a log of every fragment.
//!
//! ## Strategies
//!
//! - **fiemap**: one `FS_IOC_FIEMAP` call per batch of extents.
//! - **fibmap**: one `FIBMAP` call per logical block, for filesystems
//!   without FIEMAP. Limited to the first `i32::MAX` blocks.
//!
//! [`ExtentStrategy::probe`] picks one for a file; both feed the same
//! [`FragmentTally`] so they agree on what a fragment is.

use serde::Serialize;
use shake_error::{Result, ShakeError};
use shake_types::MAGICLEAP;
use std::fs::File;
use std::os::fd::{AsRawFd, RawFd};
use tracing::debug;

// ── ioctl numbers ────────────────────────────────────────────────────────────

const FIBMAP: libc::c_ulong = 1;
const FIGETBSZ: libc::c_ulong = 2;
/// `_IOWR('f', 11, struct fiemap)`.
const FS_IOC_FIEMAP: libc::c_ulong = 0xC020_660B;

const FIEMAP_FLAG_SYNC: u32 = 0x0000_0001;
const FIEMAP_EXTENT_LAST: u32 = 0x0000_0001;
const FIEMAP_EXTENT_UNKNOWN: u32 = 0x0000_0002;
const FIEMAP_EXTENT_NOT_ALIGNED: u32 = 0x0000_0100;
const FIEMAP_EXTENT_SHARED: u32 = 0x0000_2000;

/// Extents carrying any of these flags have no usable physical position.
const POSITIONLESS: u32 = FIEMAP_EXTENT_UNKNOWN | FIEMAP_EXTENT_NOT_ALIGNED | FIEMAP_EXTENT_SHARED;

const FIEMAP_BATCH: usize = 128;

/// Highest block index FIBMAP can address.
const FIBMAP_MAX_BLOCKS: u64 = 0x7FFF_FFFF;

// ── Testimony ───────────────────────────────────────────────────────────────

/// One physically contiguous run of blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Fragment {
    /// Physical byte position of the first block.
    pub position: i64,
    /// Bytes in the run.
    pub size: u64,
}

/// What the extent map says about one file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Testimony {
    pub block_size: u32,
    /// Logical blocks covered by the measured size.
    pub blocks: u64,
    pub fragments: u32,
    pub crumbs: u32,
    /// Physical byte position of the first block; 0 when unknown.
    pub start: i64,
    /// Physical byte position of the last block; 0 when unknown.
    pub end: i64,
    pub fragment_log: Option<Vec<Fragment>>,
}

/// Folds physical runs, in logical order, into fragment statistics.
///
/// A run starts a new fragment when its first block lies more than
/// [`MAGICLEAP`] bytes away from the last block seen, or when a hole
/// precedes it. Hole bytes count towards the fragment before them.
///
/// A fragment is judged a crumb once the next one begins, so the last
/// fragment never counts as one.
#[derive(Debug)]
pub struct FragmentTally {
    block_size: u32,
    crumb_size: u64,
    prev_last_block: Option<i64>,
    current: u64,
    fragments: u32,
    crumbs: u32,
    start: i64,
    end: i64,
    log: Option<Vec<Fragment>>,
}

impl FragmentTally {
    #[must_use]
    pub fn new(block_size: u32, crumb_size: u64, log_fragments: bool) -> Self {
        Self {
            block_size,
            crumb_size,
            prev_last_block: None,
            current: 0,
            fragments: 0,
            crumbs: 0,
            start: 0,
            end: 0,
            log: log_fragments.then(Vec::new),
        }
    }

    /// Record `length` bytes stored contiguously at `physical`.
    pub fn observe(&mut self, physical: i64, length: u64) {
        if physical <= 0 {
            self.hole(length);
            return;
        }
        if length == 0 {
            return;
        }
        if self.start == 0 {
            self.start = physical;
        }
        let leaps = self
            .prev_last_block
            .is_none_or(|prev| (physical - prev).abs() > MAGICLEAP);
        if leaps {
            self.close_fragment();
            self.fragments += 1;
            if let Some(log) = self.log.as_mut() {
                log.push(Fragment {
                    position: physical,
                    size: 0,
                });
            }
        }
        self.current += length;
        let tail = i64::try_from(length.saturating_sub(u64::from(self.block_size)))
            .unwrap_or(i64::MAX);
        let last = physical.saturating_add(tail);
        self.prev_last_block = Some(last);
        self.end = last;
    }

    /// Record `length` logical bytes with no usable physical position.
    pub fn hole(&mut self, length: u64) {
        self.prev_last_block = None;
        if self.fragments > 0 {
            self.current = self.current.saturating_add(length);
        }
    }

    fn close_fragment(&mut self) {
        if self.current == 0 {
            return;
        }
        if self.current < self.crumb_size {
            self.crumbs += 1;
        }
        self.log_current_size();
        self.current = 0;
    }

    fn log_current_size(&mut self) {
        if let Some(last) = self.log.as_mut().and_then(|log| log.last_mut()) {
            last.size = self.current;
        }
    }

    #[must_use]
    pub fn finish(mut self, blocks: u64) -> Testimony {
        self.log_current_size();
        Testimony {
            block_size: self.block_size,
            blocks,
            fragments: self.fragments,
            crumbs: self.crumbs,
            start: self.start,
            end: self.end,
            fragment_log: self.log,
        }
    }
}

// ── Strategies ──────────────────────────────────────────────────────────────

/// Source of physical runs for one open file.
pub trait ExtentSource {
    fn name(&self) -> &'static str;

    /// Feed every allocated run of `file`, in logical order, into `tally`.
    fn walk(&self, file: &File, block_size: u32, tally: &mut FragmentTally) -> Result<()>;
}

/// Bulk query through `FS_IOC_FIEMAP`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Fiemap;

/// Per-block query through `FIBMAP`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Fibmap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExtentStrategy {
    Fiemap,
    Fibmap,
}

impl ExtentStrategy {
    /// Pick FIEMAP when the filesystem answers it, FIBMAP otherwise.
    pub fn probe(file: &File) -> Result<Self> {
        let mut request = FiemapRequest::new(0, u64::MAX, 0);
        match request.issue(file.as_raw_fd()) {
            Ok(()) => Ok(Self::Fiemap),
            Err(err) if is_unsupported(&err) => {
                debug!(target: "shake::extent", error = %err, "fiemap_unsupported");
                Ok(Self::Fibmap)
            }
            Err(err) => Err(err),
        }
    }

    #[must_use]
    pub fn source(self) -> &'static dyn ExtentSource {
        match self {
            Self::Fiemap => &Fiemap,
            Self::Fibmap => &Fibmap,
        }
    }
}

fn is_unsupported(err: &ShakeError) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EOPNOTSUPP | libc::ENOTTY | libc::EINVAL | libc::ENOSYS)
    )
}

/// Physical block size of the filesystem holding `file`.
pub fn physical_block_size(file: &File) -> Result<u32> {
    let mut size: libc::c_int = 0;
    // SAFETY: FIGETBSZ writes one int through the pointer, which refers to
    // a live local.
    let rc = unsafe { libc::ioctl(file.as_raw_fd(), FIGETBSZ as _, &raw mut size) };
    if rc == -1 {
        return Err(ShakeError::last_os("FIGETBSZ"));
    }
    u32::try_from(size)
        .ok()
        .filter(|&size| size > 0)
        .ok_or_else(|| ShakeError::os("FIGETBSZ", std::io::Error::from_raw_os_error(libc::EINVAL)))
}

/// Inspect the physical layout of `file`.
///
/// `size` is the allocated size measured at investigation time; it sets
/// the block count and the crumb threshold.
pub fn inspect(
    file: &File,
    strategy: ExtentStrategy,
    size: u64,
    crumb_ratio: f64,
    log_fragments: bool,
) -> Result<Testimony> {
    let block_size = physical_block_size(file)?;
    let blocks = size.div_ceil(u64::from(block_size));
    let mut tally = FragmentTally::new(block_size, crumb_size(size, crumb_ratio), log_fragments);
    strategy.source().walk(file, block_size, &mut tally)?;
    let testimony = tally.finish(blocks);
    debug!(
        target: "shake::extent",
        strategy = strategy.source().name(),
        blocks,
        fragments = testimony.fragments,
        crumbs = testimony.crumbs,
        "inspected"
    );
    Ok(testimony)
}

#[expect(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn crumb_size(size: u64, crumb_ratio: f64) -> u64 {
    (size as f64 * crumb_ratio).max(0.0) as u64
}

// ── FIEMAP ──────────────────────────────────────────────────────────────────

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct FiemapExtent {
    fe_logical: u64,
    fe_physical: u64,
    fe_length: u64,
    fe_reserved64: [u64; 2],
    fe_flags: u32,
    fe_reserved: [u32; 3],
}

/// `struct fiemap` followed by room for [`FIEMAP_BATCH`] extents.
#[repr(C)]
#[derive(Debug)]
struct FiemapRequest {
    fm_start: u64,
    fm_length: u64,
    fm_flags: u32,
    fm_mapped_extents: u32,
    fm_extent_count: u32,
    fm_reserved: u32,
    fm_extents: [FiemapExtent; FIEMAP_BATCH],
}

impl FiemapRequest {
    fn new(start: u64, length: u64, extent_count: u32) -> Box<Self> {
        Box::new(Self {
            fm_start: start,
            fm_length: length,
            fm_flags: FIEMAP_FLAG_SYNC,
            fm_mapped_extents: 0,
            fm_extent_count: extent_count,
            fm_reserved: 0,
            fm_extents: [FiemapExtent::default(); FIEMAP_BATCH],
        })
    }

    fn issue(&mut self, fd: RawFd) -> Result<()> {
        // SAFETY: `self` is a `struct fiemap` header followed by
        // `fm_extent_count <= FIEMAP_BATCH` extent slots, which is exactly
        // what the kernel may write.
        let rc = unsafe { libc::ioctl(fd, FS_IOC_FIEMAP as _, std::ptr::from_mut(self)) };
        if rc == -1 {
            return Err(ShakeError::last_os("FIEMAP"));
        }
        Ok(())
    }

    fn mapped(&self) -> &[FiemapExtent] {
        let count = usize::try_from(self.fm_mapped_extents)
            .unwrap_or(FIEMAP_BATCH)
            .min(FIEMAP_BATCH);
        &self.fm_extents[..count]
    }
}

impl ExtentSource for Fiemap {
    fn name(&self) -> &'static str {
        "fiemap"
    }

    fn walk(&self, file: &File, _block_size: u32, tally: &mut FragmentTally) -> Result<()> {
        let fd = file.as_raw_fd();
        let mut cursor = 0_u64;
        let mut next_logical = 0_u64;
        #[expect(clippy::cast_possible_truncation)]
        let batch = FIEMAP_BATCH as u32;
        loop {
            let mut request = FiemapRequest::new(cursor, u64::MAX - cursor, batch);
            request.issue(fd)?;
            let extents = request.mapped();
            let Some(tail) = extents.last() else {
                break;
            };
            for extent in extents {
                if extent.fe_logical > next_logical {
                    tally.hole(extent.fe_logical - next_logical);
                }
                next_logical = next_logical.max(extent.fe_logical.saturating_add(extent.fe_length));
                if extent.fe_flags & POSITIONLESS != 0 {
                    tally.hole(extent.fe_length);
                    continue;
                }
                let physical = i64::try_from(extent.fe_physical).unwrap_or(0);
                tally.observe(physical, extent.fe_length);
            }
            if tail.fe_flags & FIEMAP_EXTENT_LAST != 0 {
                break;
            }
            let next = tail.fe_logical.saturating_add(tail.fe_length);
            if next <= cursor {
                break;
            }
            cursor = next;
        }
        Ok(())
    }
}

// ── FIBMAP ──────────────────────────────────────────────────────────────────

impl ExtentSource for Fibmap {
    fn name(&self) -> &'static str {
        "fibmap"
    }

    fn walk(&self, file: &File, block_size: u32, tally: &mut FragmentTally) -> Result<()> {
        let fd = file.as_raw_fd();
        let length = file
            .metadata()
            .map_err(|err| ShakeError::os("fstat", err))?
            .len();
        let blocks = length.div_ceil(u64::from(block_size));
        let limit = blocks.min(FIBMAP_MAX_BLOCKS);
        if limit < blocks {
            debug!(target: "shake::extent", blocks, limit, "fibmap_partial");
        }
        for index in 0..limit {
            let mut block = libc::c_int::try_from(index).unwrap_or(libc::c_int::MAX);
            // SAFETY: FIBMAP reads and rewrites one int through the pointer,
            // which refers to a live local.
            let rc = unsafe { libc::ioctl(fd, FIBMAP as _, &raw mut block) };
            if rc == -1 {
                return Err(ShakeError::last_os("FIBMAP"));
            }
            // 0 is a hole; negative values come from broken drivers.
            if block > 0 {
                tally.observe(i64::from(block) * i64::from(block_size), u64::from(block_size));
            } else {
                tally.hole(u64::from(block_size));
            }
        }
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
