//! Scan orchestration.
//!
//! A [`Court`] judges listings candidate by candidate. Each regular file is
//! judged with its predecessor and successor in the listing still open,
//! so its ideal position can be derived from theirs. Directories are
//! descended into unless they belong to another filesystem.

use crate::candidate::{Candidate, investigate};
use crate::judge;
use crate::listing;
use crate::report::Report;
use crate::rewrite::{self, Relocation, Scratch};
use serde::Serialize;
use shake_error::{Result, ShakeError};
use shake_guard::{LeaseGuard, ModeMachine};
use shake_types::{FileKind, Guilt, Policy};
use std::io::{BufRead, Write};
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Running totals for one scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScanStats {
    pub investigated: u64,
    pub judged: u64,
    pub guilty: u64,
    pub relocated: u64,
    pub cancelled: u64,
    pub failed: u64,
}

pub struct Court<'a, W: Write> {
    policy: &'a Policy,
    scratch: &'a Scratch,
    guard: LeaseGuard,
    mode: &'static ModeMachine,
    report: Report<W>,
    /// Device directories must sit on; `None` until established.
    kingdom: Option<u64>,
    stats: ScanStats,
}

impl<'a, W: Write> Court<'a, W> {
    pub fn new(
        policy: &'a Policy,
        scratch: &'a Scratch,
        guard: LeaseGuard,
        mode: &'static ModeMachine,
        out: W,
    ) -> Self {
        Self {
            policy,
            scratch,
            guard,
            mode,
            report: Report::new(out, policy.verbosity),
            kingdom: None,
            stats: ScanStats::default(),
        }
    }

    #[must_use]
    pub const fn stats(&self) -> ScanStats {
        self.stats
    }

    pub fn report_header(&mut self) -> Result<()> {
        self.report
            .header()
            .map_err(|err| ShakeError::os("write", err))
    }

    /// Judge each named path on its own. Each one resets the filesystem
    /// boundary to its own device.
    pub fn judge_paths(&mut self, paths: &[PathBuf]) -> Result<ScanStats> {
        for path in paths {
            let Some(mut candidate) = self.investigate(path) else {
                continue;
            };
            if self.policy.one_file_system {
                self.kingdom = Some(candidate.device);
            }
            self.judge(&mut candidate)?;
        }
        self.finish()
    }

    /// Judge the newline-separated paths read from `input` as one listing.
    pub fn judge_lines(&mut self, input: impl BufRead) -> Result<ScanStats> {
        let paths = listing::from_lines(input)?;
        self.judge_list(paths)?;
        self.finish()
    }

    fn finish(&mut self) -> Result<ScanStats> {
        self.report
            .flush()
            .map_err(|err| ShakeError::os("write", err))?;
        info!(
            target: "shake::scan",
            investigated = self.stats.investigated,
            judged = self.stats.judged,
            guilty = self.stats.guilty,
            relocated = self.stats.relocated,
            cancelled = self.stats.cancelled,
            failed = self.stats.failed,
            "scan_finished"
        );
        Ok(self.stats)
    }

    /// Judge a listing with a sliding window of at most three open
    /// candidates: the one judged and its neighbours.
    fn judge_list(&mut self, paths: Vec<PathBuf>) -> Result<()> {
        let mut left: Option<Candidate> = None;
        let mut middle: Option<Candidate> = None;
        for path in paths {
            let Some(right) = self.investigate(&path) else {
                continue;
            };
            if self.policy.one_file_system && self.kingdom.is_none() {
                self.kingdom = Some(right.device);
            }
            if let Some(mut current) = middle.take() {
                self.judge_between(left.as_ref(), &mut current, Some(&right))?;
                left = Some(current);
            }
            middle = Some(right);
        }
        if let Some(mut current) = middle {
            self.judge_between(left.as_ref(), &mut current, None)?;
        }
        Ok(())
    }

    fn judge_between(
        &mut self,
        left: Option<&Candidate>,
        current: &mut Candidate,
        right: Option<&Candidate>,
    ) -> Result<()> {
        current.ideal = judge::ideal(left, current, right);
        self.judge(current)
    }

    fn investigate(&mut self, path: &Path) -> Option<Candidate> {
        match investigate(path, self.policy, &mut self.guard) {
            Ok(candidate) => {
                self.stats.investigated += 1;
                Some(candidate)
            }
            Err(err) => {
                warn!(target: "shake::scan", error = %err, "investigation_failed");
                self.stats.failed += 1;
                None
            }
        }
    }

    fn judge(&mut self, candidate: &mut Candidate) -> Result<()> {
        match candidate.kind {
            FileKind::Directory => self.judge_dir(candidate),
            FileKind::Regular if candidate.is_judgeable() => self.judge_regular(candidate),
            _ => Ok(()),
        }
    }

    fn judge_dir(&mut self, candidate: &Candidate) -> Result<()> {
        if let Some(kingdom) = self.kingdom {
            if self.policy.one_file_system && candidate.device != kingdom {
                debug!(target: "shake::scan", path = %candidate.path.display(), "other_filesystem_skipped");
                return Ok(());
            }
        }
        match listing::list_dir(&candidate.path) {
            Ok(entries) => self.judge_list(entries),
            Err(err) => {
                warn!(target: "shake::scan", error = %err, "listing_failed");
                self.stats.failed += 1;
                Ok(())
            }
        }
    }

    fn judge_regular(&mut self, candidate: &mut Candidate) -> Result<()> {
        let Some(fd) = candidate.fd() else {
            return Ok(());
        };
        if self.policy.locks {
            if let Err(err) = self.guard.acquire_read(fd, &candidate.path) {
                let err = ShakeError::from(err).at(&candidate.path);
                warn!(target: "shake::judge", error = %err, "lease_refused");
                self.stats.failed += 1;
                return Ok(());
            }
        }
        let verdict = self.deliberate(candidate);
        self.settle_lease(fd, &verdict);
        match verdict {
            Ok(relocation) => {
                self.report
                    .judged(candidate)
                    .map_err(|err| ShakeError::os("write", err))?;
                if relocation == Some(Relocation::Relocated) {
                    candidate.forget_placement();
                }
                Ok(())
            }
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                warn!(target: "shake::judge", error = %err, "judgment_aborted");
                self.stats.failed += 1;
                Ok(())
            }
        }
    }

    /// Drop the judging lease, unless the verdict is fatal: then the file
    /// stays leased until the process exits.
    fn settle_lease<T>(&mut self, fd: RawFd, verdict: &Result<T>) {
        if !self.policy.locks {
            return;
        }
        self.guard.report_notices();
        if let Err(err) = verdict {
            if err.is_fatal() {
                return;
            }
        }
        if let Err(err) = self.guard.release(fd) {
            debug!(target: "shake::judge", error = %err, "lease_release_failed");
        }
    }

    fn deliberate(&mut self, candidate: &mut Candidate) -> Result<Option<Relocation>> {
        judge::recheck(candidate).map_err(|err| err.at(&candidate.path))?;
        self.stats.judged += 1;
        candidate.guilt = Guilt::from_verdict(judge::is_guilty(candidate, self.policy));
        debug!(
            target: "shake::judge",
            path = %candidate.path.display(),
            guilty = candidate.guilt.is_guilty(),
            ideal = candidate.ideal,
            start = candidate.start(),
            "judged"
        );
        if !candidate.guilt.is_guilty() {
            return Ok(None);
        }
        self.stats.guilty += 1;
        let relocation = rewrite::shake(
            candidate,
            self.scratch,
            self.policy,
            &mut self.guard,
            self.mode,
        )
        .map_err(|err| err.at(&candidate.path))?;
        match relocation {
            Relocation::Relocated => self.stats.relocated += 1,
            Relocation::Cancelled => self.stats.cancelled += 1,
            Relocation::DryRun => {}
        }
        Ok(Some(relocation))
    }
}
