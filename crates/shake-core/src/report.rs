#![forbid(unsafe_code)]
//! Tab-separated report lines on standard output.

use crate::candidate::Candidate;
use std::fmt::Write as _;
use std::io::{self, Write};

pub const HEADER: &str = "IDEAL\tSTART\tEND\tFRAGC\tCRUMBC\tAGE\tSHOCKED\tNAME";

const DAY: i64 = 24 * 60 * 60;
const KIB: i64 = 1024;

pub struct Report<W: Write> {
    out: W,
    verbosity: u8,
}

impl<W: Write> Report<W> {
    pub fn new(out: W, verbosity: u8) -> Self {
        Self { out, verbosity }
    }

    /// Column names; printed only when verbose.
    pub fn header(&mut self) -> io::Result<()> {
        match self.verbosity {
            0 => Ok(()),
            1 | 2 => writeln!(self.out, "{HEADER}"),
            _ => writeln!(self.out, "{HEADER}\tFRAGS"),
        }
    }

    /// Report a judged file: guilty ones when verbose, every one when
    /// more verbose.
    pub fn judged(&mut self, candidate: &Candidate) -> io::Result<()> {
        let guilty = candidate.guilt.is_guilty();
        if (guilty && self.verbosity >= 1) || self.verbosity >= 2 {
            writeln!(self.out, "{}", line(candidate, self.verbosity >= 3))?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

/// One report line, without the trailing newline.
#[must_use]
pub fn line(candidate: &Candidate, with_fragments: bool) -> String {
    let testimony = &candidate.testimony;
    let mut line = format!(
        "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
        candidate.ideal,
        testimony.start,
        testimony.end,
        testimony.fragments,
        testimony.crumbs,
        candidate.age / DAY,
        u8::from(candidate.guilt.is_guilty()),
        candidate.path.display(),
    );
    if with_fragments {
        if let Some(log) = testimony.fragment_log.as_deref().filter(|log| !log.is_empty()) {
            line.push('\t');
            for (index, fragment) in log.iter().enumerate() {
                if index > 0 {
                    line.push(',');
                }
                let size = i64::try_from(fragment.size).unwrap_or(i64::MAX);
                let _ = write!(line, "{}:{}", fragment.position / KIB, size / KIB);
            }
        }
    }
    line
}
