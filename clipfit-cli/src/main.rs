//! Clipfit CLI - Command-line interface
//!
//! Fits a video or animated image into a byte budget from the command line.

mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use clipfit_core::tracing_setup::{CliLogLevel, TracingOptions, init_tracing};
use clipfit_core::transcoding::InputError;
use clipfit_core::{ClipfitError, ConfigError, SourceError, TranscodeError};

#[derive(Parser)]
#[command(name = "clipfit")]
#[command(about = "Re-encode a video to fit a target file size")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: commands::Commands,

    /// Console log level (RUST_LOG overrides)
    #[arg(long, global = true, value_enum, default_value = "warn")]
    log_level: CliLogLevel,

    /// Write a full trace of the run into this directory
    #[arg(long, global = true)]
    logs_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut tracing_options = TracingOptions::new(cli.log_level.into());
    if let Some(dir) = cli.logs_dir {
        tracing_options = tracing_options.with_logs_dir(dir);
    }
    match init_tracing(&tracing_options) {
        Ok(Some(run_log)) => tracing::info!("Run log: {}", run_log.display()),
        Ok(None) => {}
        Err(e) => eprintln!("Warning: logging disabled: {e}"),
    }

    match commands::handle_command(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => ExitCode::from(report(e)),
    }
}

/// Prints a failure and picks the exit code: 2 for bad input, 1 otherwise.
fn report(error: anyhow::Error) -> u8 {
    match classify(error) {
        Ok(error) => {
            tracing::debug!("Run failed: {:?}", error);
            eprintln!("Error: {}", error.user_message());
            if error.is_user_error() { 2 } else { 1 }
        }
        Err(other) => {
            eprintln!("Error: {other:#}");
            1
        }
    }
}

/// Recovers the library error behind an `anyhow` chain, if there is one.
fn classify(error: anyhow::Error) -> Result<ClipfitError, anyhow::Error> {
    let error = match error.downcast::<TranscodeError>() {
        Ok(e) => return Ok(e.into()),
        Err(error) => error,
    };
    let error = match error.downcast::<InputError>() {
        Ok(e) => return Ok(TranscodeError::from(e).into()),
        Err(error) => error,
    };
    let error = match error.downcast::<SourceError>() {
        Ok(e) => return Ok(e.into()),
        Err(error) => error,
    };
    error.downcast::<ConfigError>().map(ClipfitError::from)
}
