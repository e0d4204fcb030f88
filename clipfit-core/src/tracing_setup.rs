//! Tracing setup for Clipfit
//!
//! Console diagnostics go to stderr at the level the user picks, leaving
//! stdout to status lines and JSON events. An optional run log captures the
//! full trace, including span close timings, so a failed transcode can be
//! diagnosed after the fact.

use std::fs::{File, create_dir_all};
use std::path::PathBuf;

use thiserror::Error;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, Layer, fmt};

/// File name of the per-run trace log inside the logs directory.
pub const RUN_LOG_FILE: &str = "clipfit-last-run.log";

/// Errors raised while installing the subscriber.
#[derive(Debug, Error)]
pub enum TracingSetupError {
    #[error("Cannot create logs directory {path}: {source}")]
    LogsDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot open run log {path}: {source}")]
    RunLog {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("A global subscriber is already installed: {0}")]
    AlreadyInstalled(#[from] TryInitError),
}

/// Where diagnostics go.
#[derive(Debug, Clone)]
pub struct TracingOptions {
    /// Console level; `RUST_LOG` takes precedence
    pub console_level: Level,
    /// Directory for the run log; `None` disables it
    pub logs_dir: Option<PathBuf>,
}

impl TracingOptions {
    pub fn new(console_level: Level) -> Self {
        Self {
            console_level,
            logs_dir: None,
        }
    }

    pub fn with_logs_dir(mut self, logs_dir: impl Into<PathBuf>) -> Self {
        self.logs_dir = Some(logs_dir.into());
        self
    }

    /// Path of the run log, if one is enabled.
    pub fn run_log_path(&self) -> Option<PathBuf> {
        self.logs_dir.as_ref().map(|dir| dir.join(RUN_LOG_FILE))
    }
}

/// Installs the global subscriber and returns the run log path, if any.
///
/// The run log is truncated on every call.
///
/// # Errors
///
/// - `TracingSetupError::LogsDir` / `TracingSetupError::RunLog` - Run log cannot be created
/// - `TracingSetupError::AlreadyInstalled` - Called twice in one process
pub fn init_tracing(options: &TracingOptions) -> Result<Option<PathBuf>, TracingSetupError> {
    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(options.console_level.to_string()));
    let console_layer = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(console_filter);

    let run_log = match (&options.logs_dir, options.run_log_path()) {
        (Some(dir), Some(path)) => {
            create_dir_all(dir).map_err(|source| TracingSetupError::LogsDir {
                path: dir.clone(),
                source,
            })?;
            let file = File::create(&path).map_err(|source| TracingSetupError::RunLog {
                path: path.clone(),
                source,
            })?;
            Some((file, path))
        }
        _ => None,
    };
    let run_log_path = run_log.as_ref().map(|(_, path)| path.clone());

    let file_layer = run_log.map(|(file, _)| {
        fmt::layer()
            .with_target(true)
            .with_thread_names(true)
            .with_file(true)
            .with_line_number(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_ansi(false)
            .with_writer(file)
            .with_filter(EnvFilter::new("trace"))
    });

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    tracing::debug!(
        "Tracing initialized: console={}, run_log={:?}",
        options.console_level,
        run_log_path
    );
    Ok(run_log_path)
}

/// Console verbosity accepted on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum CliLogLevel {
    /// Only failures
    Error,
    /// Failures plus clamping and fallback notices
    Warn,
    /// Run milestones
    Info,
    /// Stage lifecycle and negotiation probes
    Debug,
    /// Everything, per sample
    Trace,
}

impl From<CliLogLevel> for Level {
    fn from(level: CliLogLevel) -> Self {
        match level {
            CliLogLevel::Error => Level::ERROR,
            CliLogLevel::Warn => Level::WARN,
            CliLogLevel::Info => Level::INFO,
            CliLogLevel::Debug => Level::DEBUG,
            CliLogLevel::Trace => Level::TRACE,
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::ValueEnum;

    use super::*;

    #[test]
    fn test_log_level_names() {
        assert_eq!(CliLogLevel::from_str("warn", true), Ok(CliLogLevel::Warn));
        assert_eq!(CliLogLevel::from_str("DEBUG", true), Ok(CliLogLevel::Debug));
        assert!(CliLogLevel::from_str("verbose", true).is_err());
        assert_eq!(Level::from(CliLogLevel::Trace), Level::TRACE);
    }

    #[test]
    fn test_run_log_path() {
        let options = TracingOptions::new(Level::INFO);
        assert_eq!(options.run_log_path(), None);

        let options = options.with_logs_dir("/tmp/clipfit-logs");
        assert_eq!(
            options.run_log_path(),
            Some(PathBuf::from("/tmp/clipfit-logs").join(RUN_LOG_FILE))
        );
    }
}
