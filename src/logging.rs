//! Log output setup
//!
//! Human-readable lines go to stdout and JSON lines to a daily rolling file
//! under the configured log directory. The filter is taken from the command
//! line first, then `RUST_LOG`, then the configuration file.

use std::fmt;
use std::io;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt as fmt_layer, EnvFilter};

pub const LOG_FILE_PREFIX: &str = "mqtt-bridge.log";

#[derive(Debug)]
pub enum LoggingError {
    Io(io::Error),
    InvalidLevel(String),
    Init(String),
}

impl fmt::Display for LoggingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoggingError::Io(e) => write!(f, "Cannot create log directory: {}", e),
            LoggingError::InvalidLevel(level) => write!(f, "Invalid log level: {}", level),
            LoggingError::Init(msg) => write!(f, "Cannot install log subscriber: {}", msg),
        }
    }
}

impl std::error::Error for LoggingError {}

impl From<io::Error> for LoggingError {
    fn from(e: io::Error) -> Self {
        LoggingError::Io(e)
    }
}

fn parse_level(level: &str) -> Result<LevelFilter, LoggingError> {
    level
        .trim()
        .parse::<LevelFilter>()
        .map_err(|_| LoggingError::InvalidLevel(level.to_string()))
}

/// Build the event filter. `RUST_LOG` is only consulted when no level was
/// given on the command line.
pub fn resolve_filter(
    cli_level: Option<&str>,
    config_level: &str,
) -> Result<EnvFilter, LoggingError> {
    if let Some(level) = cli_level {
        return Ok(EnvFilter::default().add_directive(parse_level(level)?.into()));
    }
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    Ok(EnvFilter::default().add_directive(parse_level(config_level)?.into()))
}

/// Install the global subscriber. The returned guard flushes the file
/// writer on drop and must be held for the life of the process.
pub fn init(log_dir: &Path, filter: EnvFilter) -> Result<WorkerGuard, LoggingError> {
    std::fs::create_dir_all(log_dir)?;

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let console = fmt_layer::layer()
        .with_target(false)
        .with_thread_ids(true)
        .compact();
    let file = fmt_layer::layer()
        .json()
        .with_ansi(false)
        .with_writer(file_writer);

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init()
        .map_err(|e| LoggingError::Init(e.to_string()))?;

    Ok(guard)
}
