//! Subcommands of the `clipfit` binary

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use bytes::Bytes;
use clap::{Args, Subcommand};
use clipfit_core::codec::EncoderConfig;
use clipfit_core::demux::{SampleSource, open_source};
use clipfit_core::media::OutputFormat;
use clipfit_core::transcoding::{
    Budget, CodecBackend, RatePlan, TranscodeEvent, TranscodeRequest, Transcoder,
};
use clipfit_core::{ClipfitConfig, strip_webp_metadata};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Subcommands
#[derive(Subcommand)]
pub enum Commands {
    /// Re-encode a video to fit a target size
    Transcode(TranscodeArgs),
    /// Show the rate plan and encoder candidates without encoding
    Plan {
        /// Input video or animated image
        input: PathBuf,
        /// Target output size, e.g. 8MB or 500K (binary multiples)
        #[arg(short, long, value_parser = parse_size)]
        target_size: u64,
        /// Output container (defaults from the input)
        #[arg(short, long)]
        format: Option<OutputFormat>,
        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },
    /// Remove EXIF, XMP and ICC metadata from a WebP file
    StripWebp {
        /// Input WebP file
        input: PathBuf,
        /// Output path (defaults to <input>.stripped.webp)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Args)]
pub struct TranscodeArgs {
    /// Input video or animated image
    input: PathBuf,
    /// Target output size, e.g. 8MB or 500K (binary multiples)
    #[arg(short, long, value_parser = parse_size)]
    target_size: u64,
    /// Output path (defaults to <input>.fit.<ext>)
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Output container (defaults from the input)
    #[arg(short, long)]
    format: Option<OutputFormat>,
    /// Emit status and progress as JSON lines
    #[arg(long)]
    json: bool,
    /// Use the simulated codecs instead of FFmpeg
    #[arg(long)]
    simulate: bool,
}

/// Runs one subcommand to completion.
///
/// # Errors
/// Returns the failure of the command that ran
pub async fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Transcode(args) => transcode(args).await,
        Commands::Plan {
            input,
            target_size,
            format,
            json,
        } => show_plan(input, target_size, format, json).await,
        Commands::StripWebp { input, output } => strip_webp(input, output).await,
    }
}

/// Run the full pipeline and write the result
///
/// # Errors
/// - `TranscodeError` - Planning, codec setup, or the run itself failed
/// - `std::io::Error` - Input unreadable or output unwritable
pub async fn transcode(args: TranscodeArgs) -> anyhow::Result<()> {
    let config = ClipfitConfig::from_env();
    config.validate()?;

    let source = open_input(&args.input, args.simulate)?;
    let mut request = TranscodeRequest::new(Budget::new(args.target_size)?);
    if let Some(format) = args.format {
        request = request.with_format(format);
    }
    let format = request.output_format(source.as_ref());
    let backend = codec_backend(format, &config, args.simulate)?;
    let output = args
        .output
        .unwrap_or_else(|| default_output(&args.input, format));

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupt received, cancelling run");
                cancel.cancel();
            }
        })
    };
    let printer = tokio::spawn(print_events(events_rx, args.json));

    let transcoder = Transcoder::new(config);
    let result = transcoder
        .run(source.as_ref(), request, backend, events_tx, cancel)
        .await;
    interrupt.abort();
    printer.await??;
    let outcome = result?;

    tokio::fs::write(&output, &outcome.payload)
        .await
        .with_context(|| format!("writing {}", output.display()))?;

    if args.json {
        println!("{}", serde_json::to_string(&outcome)?);
    } else {
        println!(
            "Wrote {} ({:.2} MB, {}x{}, {}) to {}",
            outcome.format,
            outcome.payload_bytes as f64 / 1_048_576.0,
            outcome.encoder_config.width,
            outcome.encoder_config.height,
            outcome.encoder_config.codec,
            output.display()
        );
        if outcome.payload_bytes > args.target_size {
            println!(
                "  Output is {} bytes over the target",
                outcome.payload_bytes - args.target_size
            );
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct PlanReport<'a> {
    plan: &'a RatePlan,
    candidates: &'a [EncoderConfig],
}

/// Print the rate plan and the encoder ladder for an input
///
/// # Errors
/// - `TranscodeError::Input` - No video track, no samples, or no duration
/// - `SourceError` - Input could not be demultiplexed
pub async fn show_plan(
    input: PathBuf,
    target_size: u64,
    format: Option<OutputFormat>,
    json: bool,
) -> anyhow::Result<()> {
    let config = ClipfitConfig::from_env();
    let source = open_input(&input, false)?;
    let mut request = TranscodeRequest::new(Budget::new(target_size)?);
    if let Some(format) = format {
        request = request.with_format(format);
    }

    let transcoder = Transcoder::new(config);
    let plan = transcoder.plan(source.as_ref(), &request)?;
    let candidates = transcoder.candidates(&plan);

    if json {
        let report = PlanReport {
            plan: &plan,
            candidates: &candidates,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Rate plan for {}", input.display());
    println!("{:-<60}", "");
    println!("  Container:   {}", source.container());
    println!("  Output:      {}", plan.format);
    println!("  Duration:    {:.2}s", plan.duration_seconds);
    println!("  Budget:      {} bytes", plan.budget_bytes);
    println!(
        "  Bitrate:     {} kbps{}",
        plan.bitrate / 1000,
        if plan.clamped { " (raised to minimum)" } else { "" }
    );
    println!("  Framerate:   {:.2} fps", plan.framerate);
    if plan.downscaled {
        println!(
            "  Resolution:  {}x{} (from {}x{})",
            plan.width, plan.height, plan.source_width, plan.source_height
        );
    } else {
        println!("  Resolution:  {}x{}", plan.width, plan.height);
    }
    println!("\nEncoder candidates:");
    for (index, candidate) in candidates.iter().enumerate() {
        println!(
            "  {}. {} {}",
            index + 1,
            candidate.codec,
            candidate.bitrate_mode
        );
    }
    Ok(())
}

/// Strip metadata chunks from a WebP file
///
/// # Errors
/// - `WebpError` - Malformed chunk structure
/// - `std::io::Error` - File system operation failed
pub async fn strip_webp(input: PathBuf, output: Option<PathBuf>) -> anyhow::Result<()> {
    let data = tokio::fs::read(&input)
        .await
        .with_context(|| format!("reading {}", input.display()))?;
    let original_len = data.len();
    let stripped = strip_webp_metadata(Bytes::from(data))?;

    let output = output.unwrap_or_else(|| input.with_extension("stripped.webp"));
    tokio::fs::write(&output, &stripped)
        .await
        .with_context(|| format!("writing {}", output.display()))?;

    println!(
        "Removed {} bytes of metadata, wrote {}",
        original_len.saturating_sub(stripped.len()),
        output.display()
    );
    Ok(())
}

async fn print_events(
    mut events: mpsc::UnboundedReceiver<TranscodeEvent>,
    json: bool,
) -> anyhow::Result<()> {
    let mut stdout = std::io::stdout();
    while let Some(event) = events.recv().await {
        if let Some(line) = render_event(&event, json)? {
            writeln!(stdout, "{line}")?;
        }
    }
    Ok(())
}

/// Text for one event line. In text mode errors are left to `main`, which
/// prints them once alongside the exit code.
fn render_event(event: &TranscodeEvent, json: bool) -> anyhow::Result<Option<String>> {
    if json {
        return Ok(Some(serde_json::to_string(event)?));
    }
    Ok(match event {
        TranscodeEvent::Status { message } => Some(message.clone()),
        TranscodeEvent::Progress { value } => Some(format!("Progress: {value}%")),
        TranscodeEvent::Done { payload } => Some(format!("Done: {} bytes", payload.len())),
        TranscodeEvent::Error { .. } => None,
    })
}

/// Opens the input with FFmpeg when available, otherwise with the built-in
/// MP4/MOV demuxer.
fn open_input(path: &Path, simulate: bool) -> anyhow::Result<Box<dyn SampleSource>> {
    if !simulate {
        if let Some(source) = open_with_ffmpeg(path)? {
            return Ok(source);
        }
    }
    let data = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(open_source(Bytes::from(data))?)
}

#[cfg(feature = "ffmpeg")]
fn open_with_ffmpeg(path: &Path) -> anyhow::Result<Option<Box<dyn SampleSource>>> {
    let source = clipfit_core::codec::ffmpeg::FfmpegSampleSource::open(path)?;
    Ok(Some(Box::new(source)))
}

#[cfg(not(feature = "ffmpeg"))]
fn open_with_ffmpeg(_path: &Path) -> anyhow::Result<Option<Box<dyn SampleSource>>> {
    Ok(None)
}

#[cfg(feature = "ffmpeg")]
fn codec_backend(
    format: OutputFormat,
    config: &ClipfitConfig,
    simulate: bool,
) -> anyhow::Result<CodecBackend> {
    if simulate {
        return Ok(CodecBackend::simulated());
    }
    Ok(CodecBackend::ffmpeg(format, config.pipeline.codec_threads))
}

#[cfg(not(feature = "ffmpeg"))]
fn codec_backend(
    _format: OutputFormat,
    _config: &ClipfitConfig,
    simulate: bool,
) -> anyhow::Result<CodecBackend> {
    if simulate {
        return Ok(CodecBackend::simulated());
    }
    anyhow::bail!("this build has no codec backend; rebuild with --features ffmpeg or pass --simulate")
}

fn default_output(input: &Path, format: OutputFormat) -> PathBuf {
    input.with_extension(format!("fit.{}", format.extension()))
}

/// Parses a byte size with an optional binary suffix (`B`, `K`, `KB`, `KiB`,
/// `M`, `MB`, `MiB`, `G`, `GB`, `GiB`). Fractions are allowed: `1.5M`.
pub fn parse_size(input: &str) -> Result<u64, String> {
    let trimmed = input.trim();
    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);

    let value: f64 = number
        .parse()
        .map_err(|_| format!("invalid size: {input}"))?;
    let multiplier: u64 = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KIB" => 1 << 10,
        "M" | "MB" | "MIB" => 1 << 20,
        "G" | "GB" | "GIB" => 1 << 30,
        other => return Err(format!("unknown size unit: {other}")),
    };

    let bytes = (value * multiplier as f64).round();
    if !bytes.is_finite() || bytes < 1.0 {
        return Err(format!("size must be at least one byte: {input}"));
    }
    Ok(bytes as u64)
}
