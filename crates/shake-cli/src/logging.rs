//! Diagnostics for the `shake` binary.
//!
//! Standard output belongs to the report, so every event goes to standard
//! error. `SHAKE_LOG` takes `EnvFilter` directives and defaults to `warn`,
//! which keeps a plain scan quiet apart from soft failures.

use anyhow::{Result, anyhow, bail};
use clap::ValueEnum;
use std::ffi::OsStr;
use std::io;
use tracing::Subscriber;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::MakeWriter;

pub const FILTER_ENV: &str = "SHAKE_LOG";
pub const FORMAT_ENV: &str = "SHAKE_LOG_FORMAT";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// One compact line per event, without timestamps.
    Human,
    /// One JSON object per event, fields flattened, with the enclosing span.
    Json,
}

impl LogFormat {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Human => "human",
            Self::Json => "json",
        }
    }
}

/// `--log-format` wins over the environment; human is the fallback.
pub fn resolve_format(flag: Option<LogFormat>, env: Option<&OsStr>) -> Result<LogFormat> {
    if let Some(format) = flag {
        return Ok(format);
    }
    let Some(raw) = env else {
        return Ok(LogFormat::Human);
    };
    let Some(raw) = raw.to_str() else {
        bail!("{FORMAT_ENV} is not valid UTF-8");
    };
    <LogFormat as ValueEnum>::from_str(raw.trim(), true)
        .map_err(|_| anyhow!("{FORMAT_ENV}={raw:?} is neither `human` nor `json`"))
}

pub fn filter(directives: Option<&str>) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .parse_lossy(directives.unwrap_or_default())
}

pub fn subscriber<W>(
    format: LogFormat,
    filter: EnvFilter,
    writer: W,
) -> Box<dyn Subscriber + Send + Sync>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer);
    match format {
        LogFormat::Human => Box::new(builder.compact().without_time().finish()),
        LogFormat::Json => Box::new(
            builder
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_span_list(false)
                .finish(),
        ),
    }
}

/// Install the process-wide subscriber writing to standard error.
pub fn init(flag: Option<LogFormat>) -> Result<LogFormat> {
    let format = resolve_format(flag, std::env::var_os(FORMAT_ENV).as_deref())?;
    let directives = std::env::var(FILTER_ENV).ok();
    tracing::subscriber::set_global_default(subscriber(
        format,
        filter(directives.as_deref()),
        io::stderr,
    ))
    .map_err(|err| anyhow!("cannot install the {} logger: {err}", format.as_str()))?;
    Ok(format)
}
