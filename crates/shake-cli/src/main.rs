#![forbid(unsafe_code)]

mod logging;

use anyhow::{Context, Result};
use clap::{ArgAction, ArgMatches, CommandFactory, FromArgMatches, Parser};
use logging::LogFormat;
use shake_core::{Court, Scratch, ScanStats};
use shake_error::ShakeError;
use shake_guard::{LeaseGuard, MODE, signals};
use shake_types::Policy;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{error, info, info_span, warn};

// ── CLI definition ──────────────────────────────────────────────────────────

fn non_negative(raw: &str) -> std::result::Result<f64, String> {
    let value: f64 = raw.parse().map_err(|err| format!("{err}"))?;
    if value.is_finite() && value >= 0.0 {
        Ok(value)
    } else {
        Err(format!("{raw} is not a non-negative number"))
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "shake",
    version,
    about = "Find fragmented or badly placed files and rewrite them in place",
    long_about = "Judge the named files and directories, or the newline-separated \
                  paths on standard input when none are named, and relocate the \
                  guilty ones so the filesystem can allocate them contiguously."
)]
struct Cli {
    /// Maximum number of crumbs before a file is shaken.
    #[arg(short = 'c', long = "max-crumbc", value_name = "N")]
    max_crumbc: Option<u32>,
    /// Maximum number of fragments before a file is shaken.
    #[arg(short = 'C', long = "max-fragc", value_name = "N")]
    max_fragc: Option<u32>,
    /// Maximum distance in bytes between a file's start and its ideal
    /// position (0 disables).
    #[arg(short = 'd', long = "max-deviance", value_name = "BYTES")]
    max_deviance: Option<u64>,
    /// Do not take leases; concurrent writers are not detected.
    #[arg(short = 'L', long = "no-locks")]
    no_locks: bool,
    /// Descend into directories on other filesystems.
    #[arg(short = 'm', long = "many-fs")]
    many_fs: bool,
    /// Files younger than this many days are never shaken.
    #[arg(short = 'n', long = "new", value_name = "DAYS")]
    new: Option<u32>,
    /// Files older than this many days are always shaken.
    #[arg(short = 'o', long = "old", value_name = "DAYS")]
    old: Option<u32>,
    /// Judge and report, but never rewrite.
    #[arg(short = 'p', long = "pretend")]
    pretend: bool,
    /// Fraction of the file size under which a fragment is a crumb.
    #[arg(short = 'r', long = "crumbratio", value_name = "RATIO", value_parser = non_negative)]
    crumbratio: Option<f64>,
    /// Files smaller than this many kB use the small tolerance.
    #[arg(short = 's', long = "smallsize", value_name = "KB")]
    smallsize: Option<u64>,
    /// Files bigger than this many kB use the big tolerance.
    #[arg(short = 'S', long = "bigsize", value_name = "KB")]
    bigsize: Option<u64>,
    /// Threshold multiplier for small files.
    #[arg(short = 't', long = "small-tolerance", value_name = "X", value_parser = non_negative)]
    small_tolerance: Option<f64>,
    /// Threshold multiplier for big files.
    #[arg(short = 'T', long = "big-tolerance", value_name = "X", value_parser = non_negative)]
    big_tolerance: Option<f64>,
    /// Report guilty files; twice reports every file, three times adds
    /// fragment positions.
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbose: u8,
    /// Do not read or write the placement-time extended attribute.
    #[arg(short = 'X', long = "no-xattr")]
    no_xattr: bool,
    /// Log output format (`human` or `json`).
    ///
    /// Overrides `SHAKE_LOG_FORMAT`. Log filtering follows `SHAKE_LOG`.
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
    /// Files and directories to judge. Standard input is read when empty.
    paths: Vec<PathBuf>,
}

/// Settings that adjust a partner setting, applied in command-line order.
enum Clamp {
    New(u32),
    Old(u32),
    Small(u64),
    Big(u64),
}

impl Cli {
    fn parse_with_matches() -> Result<(Self, ArgMatches)> {
        let matches = Self::command().get_matches();
        let cli = Self::from_arg_matches(&matches)?;
        Ok((cli, matches))
    }

    fn policy(&self, matches: &ArgMatches) -> Policy {
        let mut policy = Policy::default();
        if let Some(crumbs) = self.max_crumbc {
            policy.max_crumbs = crumbs;
        }
        if let Some(fragments) = self.max_fragc {
            policy.max_fragments = fragments;
        }
        if let Some(deviance) = self.max_deviance {
            policy.max_deviance = deviance;
        }
        if let Some(ratio) = self.crumbratio {
            policy.crumb_ratio = ratio;
        }
        if let Some(tolerance) = self.small_tolerance {
            policy.small_tolerance = tolerance;
        }
        if let Some(tolerance) = self.big_tolerance {
            policy.big_tolerance = tolerance;
        }
        policy.pretend = self.pretend;
        policy.verbosity = self.verbose;
        policy.locks = !self.no_locks;
        policy.one_file_system = !self.many_fs;
        policy.xattr = !self.no_xattr;

        let mut clamps: Vec<(usize, Clamp)> = [
            (self.new.map(Clamp::New), "new"),
            (self.old.map(Clamp::Old), "old"),
            (self.smallsize.map(Clamp::Small), "smallsize"),
            (self.bigsize.map(Clamp::Big), "bigsize"),
        ]
        .into_iter()
        .filter_map(|(clamp, id)| Some((matches.index_of(id)?, clamp?)))
        .collect();
        clamps.sort_by_key(|(index, _)| *index);
        for (_, clamp) in clamps {
            match clamp {
                Clamp::New(days) => policy.set_new_days(days),
                Clamp::Old(days) => policy.set_old_days(days),
                Clamp::Small(kb) => policy.set_small_size_kb(kb),
                Clamp::Big(kb) => policy.set_big_size_kb(kb),
            }
        }
        policy
    }
}

// ── Main ────────────────────────────────────────────────────────────────────

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let (cli, matches) = Cli::parse_with_matches()?;
    let log_format = logging::init(cli.log_format)?;
    let policy = cli.policy(&matches);
    let source = if cli.paths.is_empty() { "stdin" } else { "paths" };
    let run_span = info_span!(
        target: "shake::cli",
        "shake",
        source,
        pretend = policy.pretend,
        log_format = log_format.as_str()
    );
    let _run_guard = run_span.enter();
    info!(target: "shake::cli", verbosity = policy.verbosity, locks = policy.locks, "shake_start");

    let (file, temp_path) = tempfile::Builder::new()
        .prefix("shake")
        .tempfile_in(".")
        .context("failed to create temporary file in the current directory")?
        .keep()
        .context("failed to keep temporary file")?;
    if let Err(err) = signals::install(&temp_path) {
        remove_scratch(&temp_path);
        return Err(err).context("failed to install signal handlers");
    }
    let scratch = Scratch::new(file, temp_path.clone());

    let result = judge(&cli, &policy, &scratch);
    match &result {
        Err(err) if err.downcast_ref::<ShakeError>().is_some_and(is_unrecoverable) => {
            error!(target: "shake::cli", backup = %temp_path.display(), "scratch_kept_for_recovery");
        }
        _ => remove_scratch(&temp_path),
    }
    let stats = result?;
    info!(
        target: "shake::cli",
        judged = stats.judged,
        relocated = stats.relocated,
        failed = stats.failed,
        "shake_finished"
    );
    Ok(())
}

fn judge(cli: &Cli, policy: &Policy, scratch: &Scratch) -> Result<ScanStats> {
    let mut court = Court::new(policy, scratch, LeaseGuard::global(), &MODE, io::stdout().lock());
    court.report_header()?;
    let stats = if cli.paths.is_empty() {
        court.judge_lines(io::stdin().lock())?
    } else {
        court.judge_paths(&cli.paths)?
    };
    Ok(stats)
}

fn is_unrecoverable(err: &ShakeError) -> bool {
    match err {
        ShakeError::Unrecoverable { .. } => true,
        ShakeError::Candidate { source, .. } => is_unrecoverable(source),
        _ => false,
    }
}

fn remove_scratch(path: &Path) {
    if let Err(err) = std::fs::remove_file(path) {
        warn!(target: "shake::cli", path = %path.display(), error = %err, "scratch_not_removed");
    }
}
