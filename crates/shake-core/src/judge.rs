#![forbid(unsafe_code)]
//! Verdicts: whether a regular file should be shaken, and where it should
//! sit relative to the files used alongside it.

use crate::candidate::Candidate;
use shake_error::{Result, ShakeError};
use shake_types::{DISABLED_TOLERANCE, MAGICLEAP, MAGICTIME, Policy, STAT_BLOCK_SIZE};
use std::os::unix::fs::MetadataExt;

/// Multiplier applied to every threshold for this candidate's size tier.
#[must_use]
pub fn tolerance(candidate: &Candidate, policy: &Policy) -> f64 {
    if policy.small_size != 0 && candidate.size < policy.small_size {
        policy.small_tolerance
    } else if policy.big_size != 0 && candidate.size > policy.big_size {
        policy.big_tolerance
    } else {
        1.0
    }
}

fn is_disabled(tolerance: f64) -> bool {
    (tolerance - DISABLED_TOLERANCE).abs() < f64::EPSILON
}

/// Whether the candidate deserves to be shaken. Checks run in a fixed
/// order and the first decisive one wins.
#[must_use]
#[expect(clippy::cast_precision_loss)]
pub fn is_guilty(candidate: &Candidate, policy: &Policy) -> bool {
    let tol = tolerance(candidate, policy);
    if is_disabled(tol) {
        return false;
    }
    let age = candidate.age as f64;
    if age < policy.new as f64 * tol {
        return false;
    }
    if age > policy.old as f64 * tol {
        return true;
    }
    if f64::from(candidate.testimony.fragments) > f64::from(policy.max_fragments) * tol {
        return true;
    }
    if f64::from(candidate.testimony.crumbs) > f64::from(policy.max_crumbs) * tol {
        return true;
    }
    if policy.max_deviance != 0 && candidate.start() != 0 && candidate.ideal != 0 {
        let deviance = candidate.start().abs_diff(candidate.ideal) as f64;
        if deviance > policy.max_deviance as f64 * tol {
            return true;
        }
    }
    false
}

fn close_in_time(a: &Candidate, b: &Candidate) -> bool {
    (a.atime - b.atime).abs() < MAGICTIME
}

/// Ideal start of `middle` given its neighbours in an access-time sorted
/// listing. 0 when no neighbour qualifies.
#[must_use]
pub fn ideal(left: Option<&Candidate>, middle: &Candidate, right: Option<&Candidate>) -> i64 {
    if middle.start() == 0 {
        return 0;
    }
    let size = i64::try_from(middle.size).unwrap_or(i64::MAX);
    let left = left.filter(|x| x.end() != 0 && close_in_time(x, middle));
    let right = right.filter(|z| z.start() != 0 && close_in_time(z, middle));
    match (left, right) {
        (Some(x), Some(z)) => x
            .end()
            .saturating_add(z.start())
            .saturating_add(MAGICLEAP)
            .saturating_sub(size)
            / 2,
        (Some(x), None) => x.end().saturating_add(MAGICLEAP),
        (None, Some(z)) => z.start().saturating_sub(size).saturating_sub(MAGICLEAP),
        (None, None) => 0,
    }
}

/// Fail with [`ShakeError::ConcurrentAccess`] if the open file changed
/// since it was investigated.
pub fn recheck(candidate: &Candidate) -> Result<()> {
    let Some(file) = candidate.file() else {
        return Ok(());
    };
    let meta = file.metadata().map_err(|err| ShakeError::os("fstat", err))?;
    if meta.blocks() * STAT_BLOCK_SIZE != candidate.size
        || meta.mtime() != candidate.mtime
        || meta.mode() != candidate.mode
    {
        return Err(ShakeError::ConcurrentAccess);
    }
    Ok(())
}
