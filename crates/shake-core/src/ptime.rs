//! Placement time: when shake last relocated a file.
//!
//! Stored as a 4-byte big-endian Unix timestamp in the `user.shake.ptime`
//! extended attribute.

use shake_error::{Result, ShakeError};
use std::ffi::CStr;
use std::fs::File;
use std::os::fd::AsRawFd;

const PTIME_KEY: &CStr = c"user.shake.ptime";
const PTIME_LEN: usize = 4;

/// The stored placement time, or `None` when absent, malformed or later
/// than `now`.
#[must_use]
pub fn get(file: &File, now: i64) -> Option<i64> {
    let mut raw = [0_u8; PTIME_LEN];
    // SAFETY: `raw` is a live buffer of PTIME_LEN bytes and the key is
    // NUL-terminated.
    let read = unsafe {
        libc::fgetxattr(
            file.as_raw_fd(),
            PTIME_KEY.as_ptr(),
            raw.as_mut_ptr().cast(),
            PTIME_LEN,
        )
    };
    if usize::try_from(read).ok() != Some(PTIME_LEN) {
        return None;
    }
    decode(raw, now)
}

/// Record `now` as the placement time.
pub fn set(file: &File, now: i64) -> Result<()> {
    let raw = encode(now);
    // SAFETY: `raw` is a live buffer of PTIME_LEN bytes and the key is
    // NUL-terminated.
    let rc = unsafe {
        libc::fsetxattr(
            file.as_raw_fd(),
            PTIME_KEY.as_ptr(),
            raw.as_ptr().cast(),
            PTIME_LEN,
            0,
        )
    };
    if rc == -1 {
        return Err(ShakeError::last_os("fsetxattr"));
    }
    Ok(())
}

fn encode(now: i64) -> [u8; PTIME_LEN] {
    u32::try_from(now).unwrap_or(u32::MAX).to_be_bytes()
}

fn decode(raw: [u8; PTIME_LEN], now: i64) -> Option<i64> {
    let stamp = i64::from(u32::from_be_bytes(raw));
    (stamp <= now).then_some(stamp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamps_are_big_endian() {
        assert_eq!(encode(0x0102_0304), [1, 2, 3, 4]);
        assert_eq!(decode([1, 2, 3, 4], i64::MAX), Some(0x0102_0304));
    }

    #[test]
    fn future_stamps_are_ignored() {
        let now = 1_700_000_000;
        assert_eq!(decode(encode(now), now), Some(now));
        assert_eq!(decode(encode(now + 1), now), None);
    }

    #[test]
    fn roundtrip_through_xattr_when_supported() {
        let file = tempfile::tempfile_in(".").unwrap();
        let now = 1_700_000_000;
        if set(&file, now).is_err() {
            eprintln!("user xattrs unsupported here");
            return;
        }
        assert_eq!(get(&file, now + 10), Some(now));
        assert_eq!(get(&file, now - 10), None);
    }

    #[test]
    fn missing_attribute_reads_as_none() {
        let file = tempfile::tempfile().unwrap();
        assert_eq!(get(&file, i64::MAX), None);
    }
}
