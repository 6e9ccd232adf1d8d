//! Structured logging setup: console output plus an optional file tee.
use std::path::Path;
use std::str::FromStr;

use thiserror::Error;
use tracing::level_filters::LevelFilter;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("init logging error: `{0}`")]
    TryInit(String),

    #[error("invalid log level `{0}`")]
    InvalidLevel(String),

    #[error("could not open log file `{path}`: {source}")]
    LogFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// A `-L/--log-level` value, parsed from its textual name (`error`/`warn`/`info`/`debug`/`trace`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogLevel(pub Level);

impl Default for LogLevel {
    fn default() -> Self {
        Self(Level::INFO)
    }
}

impl FromStr for LogLevel {
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Level::from_str(s)
            .map(Self)
            .map_err(|_| LoggingError::InvalidLevel(s.to_string()))
    }
}

/// Retained across the process lifetime to keep the file-logging worker thread alive.
pub type LoggingGuard = Option<WorkerGuard>;

/// Installs the global `tracing` subscriber: a console layer filtered by `level`
/// (overridable per-module via `RUST_LOG`), plus an optional file layer when
/// `log_file` is given.
pub fn try_init(level: LogLevel, log_file: Option<&Path>) -> Result<LoggingGuard, LoggingError> {
    let console_filter = env_filter(level);
    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_filter(console_filter);

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| LoggingError::LogFile {
                    path: path.display().to_string(),
                    source,
                })?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .with_filter(env_filter(level));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::Registry::default()
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|err| LoggingError::TryInit(err.to_string()))?;

    Ok(guard)
}

fn env_filter(level: LogLevel) -> EnvFilter {
    let directive: LevelFilter = level.0.into();
    EnvFilter::builder()
        .with_default_directive(directive.into())
        .from_env_lossy()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_levels() {
        assert_eq!(LogLevel::from_str("debug").unwrap().0, Level::DEBUG);
        assert_eq!(LogLevel::from_str("ERROR").unwrap().0, Level::ERROR);
    }

    #[test]
    fn rejects_unknown_level() {
        assert!(LogLevel::from_str("bogus").is_err());
    }
}
