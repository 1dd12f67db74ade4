//! Thin wrapper around `slog` so the stack can take a parent logger from the
//! application or fall back to a discarding root.

pub use slog::{debug, error, info, o, trace, warn, Discard, Drain, Logger};

use sloggers::file::FileLoggerBuilder;
use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;
use std::path::PathBuf;

/// Log sink configuration, filled in from the session's debug configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Destination file; `None` logs to stderr.
    pub file: Option<PathBuf>,
    /// Rotate the file once it exceeds this many bytes (0 = no rotation).
    pub max_file_size: u64,
    pub level: Level,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Error,
    Warning,
    Info,
    Debug,
    Trace,
}

impl Default for LogConfig {
    fn default() -> LogConfig {
        LogConfig {
            file: None,
            max_file_size: 0,
            level: Level::Info,
        }
    }
}

impl From<Level> for Severity {
    fn from(level: Level) -> Severity {
        match level {
            Level::Error => Severity::Error,
            Level::Warning => Severity::Warning,
            Level::Info => Severity::Info,
            Level::Debug => Severity::Debug,
            Level::Trace => Severity::Trace,
        }
    }
}

/// Builds a root logger for the given configuration.
pub fn root(config: &LogConfig) -> Logger {
    let logger = match &config.file {
        Some(path) => {
            let mut builder = FileLoggerBuilder::new(path);
            builder.level(config.level.into());
            if config.max_file_size > 0 {
                builder.rotate_size(config.max_file_size);
            }
            builder.build()
        }
        None => {
            let mut builder = TerminalLoggerBuilder::new();
            builder.level(config.level.into());
            builder.destination(Destination::Stderr);
            builder.build()
        }
    };

    // Fall back to a discarding root rather than failing session open over an
    // unwritable log destination.
    logger.unwrap_or_else(|_| discard())
}

/// A logger that swallows everything. Used when no parent logger is supplied.
#[inline]
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}
