//! Budget-driven transcoding.
//!
//! A run estimates a bitrate from the byte budget, plans the output size,
//! negotiates an encoder configuration, and then streams every sample through
//! the decode/encode stages into the sink. All of that is fixed before the
//! first sample is decoded; nothing is re-planned mid-stream.

pub mod estimator;
pub mod negotiator;
pub mod pipeline;
pub mod planner;
pub mod progress;
pub mod stage;

use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::codec::simulation::{MemorySink, SimulatedDecoder, SimulatedEncoder, SimulatedSupport};
use crate::codec::{
    AreaScaler, ChunkSink, CodecError, DecoderConfig, EncoderConfig, EncoderSupport, FrameScaler,
    VideoDecoder, VideoEncoder,
};
use crate::config::{ClipfitConfig, ConfigError};
use crate::demux::{SampleSource, SourceError};
use crate::media::{OutputFormat, TrackMetadata};

pub use estimator::{Budget, InputError};
pub use negotiator::Negotiation;
pub use pipeline::PipelineStats;
pub use planner::{RatePlan, ResolutionPlan};
pub use progress::{ProgressReporter, TranscodeEvent};

use pipeline::PipelineDriver;
use stage::{DecoderStage, EncoderStage, Stage};

/// Errors that end a transcode run.
#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("{0}")]
    Input(#[from] InputError),

    #[error("Source error: {0}")]
    Source(SourceError),

    #[error("Encoder unavailable for {codec}: {source}")]
    EncoderUnavailable {
        codec: String,
        #[source]
        source: CodecError,
    },

    #[error("Decoder configuration failed for {codec}: {source}")]
    DecoderConfig {
        codec: String,
        #[source]
        source: CodecError,
    },

    #[error("{stage} failed: {source}")]
    RuntimeCodec {
        stage: &'static str,
        #[source]
        source: CodecError,
    },

    #[error("Output container failed: {source}")]
    Sink {
        #[source]
        source: CodecError,
    },

    #[error("{stage} stopped unexpectedly: {reason}")]
    StageStopped { stage: &'static str, reason: String },

    #[error("Transcode cancelled")]
    Cancelled,

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

impl From<SourceError> for TranscodeError {
    fn from(error: SourceError) -> Self {
        match error {
            SourceError::NoVideoTrack => TranscodeError::Input(InputError::NoVideoTrack),
            other => TranscodeError::Source(other),
        }
    }
}

impl TranscodeError {
    /// Problems with the input itself rather than the codecs or the run.
    pub fn is_input_error(&self) -> bool {
        matches!(self, TranscodeError::Input(_) | TranscodeError::Source(_))
    }
}

/// Unique identifier for a run, attached to its tracing span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct RunId(Uuid);

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The codec collaborators a run drives.
pub struct CodecBackend {
    pub decoder: Box<dyn VideoDecoder>,
    pub encoder: Box<dyn VideoEncoder>,
    pub scaler: Box<dyn FrameScaler>,
    pub support: Box<dyn EncoderSupport>,
    pub sink: Box<dyn ChunkSink>,
}

impl CodecBackend {
    /// Deterministic in-process codecs accepting every configuration.
    pub fn simulated() -> Self {
        Self {
            decoder: Box::new(SimulatedDecoder::new()),
            encoder: Box::new(SimulatedEncoder::new()),
            scaler: Box::new(AreaScaler::new()),
            support: Box::new(SimulatedSupport::accept_all()),
            sink: Box::new(MemorySink::new()),
        }
    }

    /// libav codecs writing `format`, each codec using up to `threads` threads.
    #[cfg(feature = "ffmpeg")]
    pub fn ffmpeg(format: OutputFormat, threads: usize) -> Self {
        use crate::codec::ffmpeg::{
            FfmpegDecoder, FfmpegEncoder, FfmpegMuxSink, FfmpegScaler, FfmpegSupport,
        };

        Self {
            decoder: Box::new(FfmpegDecoder::new(threads)),
            encoder: Box::new(FfmpegEncoder::new(threads)),
            scaler: Box::new(FfmpegScaler::new()),
            support: Box::new(FfmpegSupport::new(1)),
            sink: Box::new(FfmpegMuxSink::new(format)),
        }
    }
}

impl std::fmt::Debug for CodecBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecBackend").finish_non_exhaustive()
    }
}

/// What the caller wants out of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranscodeRequest {
    pub budget: Budget,
    /// Explicit output format; otherwise chosen from the source container
    pub format: Option<OutputFormat>,
}

impl TranscodeRequest {
    pub fn new(budget: Budget) -> Self {
        Self {
            budget,
            format: None,
        }
    }

    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = Some(format);
        self
    }

    /// Output format for a source: explicit choice, else WebM for animated
    /// images and MP4 for everything else.
    pub fn output_format(&self, source: &dyn SampleSource) -> OutputFormat {
        self.format
            .unwrap_or_else(|| OutputFormat::for_container(source.container()))
    }
}

/// Summary of a successful run.
#[derive(Debug, Clone, Serialize)]
pub struct TranscodeOutcome {
    pub run_id: RunId,
    pub format: OutputFormat,
    #[serde(skip)]
    pub payload: Bytes,
    pub payload_bytes: u64,
    pub plan: RatePlan,
    pub encoder_config: EncoderConfig,
    pub degraded: bool,
    pub stats: PipelineStats,
}

/// Entry point: plans and executes transcode runs with one configuration.
#[derive(Debug, Clone, Default)]
pub struct Transcoder {
    config: ClipfitConfig,
}

impl Transcoder {
    pub fn new(config: ClipfitConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClipfitConfig {
        &self.config
    }

    /// Computes the rate plan without touching any codec.
    ///
    /// # Errors
    ///
    /// - `TranscodeError::Config` - Configuration out of range
    /// - `TranscodeError::Input` - No video track, no samples, or no duration
    pub fn plan(
        &self,
        source: &dyn SampleSource,
        request: &TranscodeRequest,
    ) -> Result<RatePlan, TranscodeError> {
        self.config.validate()?;
        let track = source.track_metadata().ok_or(InputError::NoVideoTrack)?;
        let plan = RatePlan::compute(
            track,
            source.samples(),
            request.budget,
            request.output_format(source),
            &self.config,
        )?;
        Ok(plan)
    }

    /// Encoder candidates for a plan in probe order.
    pub fn candidates(&self, plan: &RatePlan) -> Vec<EncoderConfig> {
        negotiator::build_candidates(self.config.negotiation.ladder(plan.format), plan)
    }

    /// Runs the full pipeline.
    ///
    /// Status and progress go to `events`, which receives exactly one
    /// terminal event: `Done` on success, `Error` otherwise. The same outcome
    /// is returned.
    ///
    /// # Errors
    ///
    /// - `TranscodeError::Input` / `TranscodeError::Config` - Rejected before any codec is touched
    /// - `TranscodeError::EncoderUnavailable` / `TranscodeError::DecoderConfig` - Codec setup failed
    /// - `TranscodeError::RuntimeCodec` / `TranscodeError::Sink` - Mid-stream failure
    /// - `TranscodeError::Cancelled` - `cancel` fired
    pub async fn run(
        &self,
        source: &dyn SampleSource,
        request: TranscodeRequest,
        backend: CodecBackend,
        events: mpsc::UnboundedSender<TranscodeEvent>,
        cancel: CancellationToken,
    ) -> Result<TranscodeOutcome, TranscodeError> {
        let run_id = RunId::new();
        let span = tracing::info_span!("transcode", run = %run_id);
        let mut reporter = ProgressReporter::new(
            events,
            source.samples().len() as u64,
            self.config.pipeline.progress_granularity,
        );

        let result = self
            .execute(run_id, source, request, backend, &mut reporter, cancel)
            .instrument(span)
            .await;

        match &result {
            Ok(outcome) => {
                tracing::info!(
                    "Run {} finished: {} bytes in {} chunks",
                    run_id,
                    outcome.payload_bytes,
                    outcome.stats.chunks_written
                );
                reporter.complete(outcome.payload.clone());
            }
            Err(e) => {
                tracing::error!("Run {} failed: {}", run_id, e);
                reporter.fail(e.to_string());
            }
        }
        result
    }

    async fn execute(
        &self,
        run_id: RunId,
        source: &dyn SampleSource,
        request: TranscodeRequest,
        backend: CodecBackend,
        reporter: &mut ProgressReporter,
        cancel: CancellationToken,
    ) -> Result<TranscodeOutcome, TranscodeError> {
        let plan = self.plan(source, &request)?;
        let track = source.track_metadata().ok_or(InputError::NoVideoTrack)?;
        let samples = source.samples();
        if cancel.is_cancelled() {
            return Err(TranscodeError::Cancelled);
        }

        reporter.status(format!(
            "Video: {:.1}s. Target: {}. Bitrate: {}kbps",
            plan.duration_seconds,
            request.budget,
            plan.bitrate / 1000
        ));
        if plan.clamped {
            tracing::warn!("Bitrate clamped to floor of {}bps", plan.bitrate);
            reporter.status(format!(
                "Bitrate raised to the {}kbps minimum; output may exceed the target size",
                plan.bitrate / 1000
            ));
        }
        if plan.downscaled {
            reporter.status(format!(
                "Downscaling {}x{} to {}x{}",
                plan.source_width, plan.source_height, plan.width, plan.height
            ));
        }

        let CodecBackend {
            decoder,
            encoder,
            scaler,
            support,
            mut sink,
        } = backend;

        let ladder = self.config.negotiation.ladder(plan.format);
        let negotiation = negotiator::negotiate(
            support.as_ref(),
            negotiator::build_candidates(ladder, &plan),
            negotiator::fallback_config(ladder, &plan),
        );
        if negotiation.degraded {
            reporter.status(format!(
                "No preferred encoder profile is supported; falling back to {} ({})",
                negotiation.config.codec, negotiation.config.bitrate_mode
            ));
        }
        let active = negotiation.config;

        reporter.status("Configuring encoder...");
        let encoder = configure_encoder(encoder, active.clone()).await?;
        sink.begin(&active)
            .map_err(|source| TranscodeError::Sink { source })?;

        reporter.status("Configuring decoder...");
        let decoder = configure_decoder(decoder, decoder_config(track)).await?;

        reporter.status(format!("Encoding {} frames...", samples.len()));
        reporter.start();
        tracing::info!(
            "Run {}: {} at {}x{}, {}bps, {:.2}fps",
            run_id,
            active.codec,
            active.width,
            active.height,
            active.bitrate,
            active.framerate
        );

        let limit = self.config.pipeline.queue_depth_limit;
        let driver = PipelineDriver::new(
            Stage::spawn(DecoderStage::new(decoder), limit),
            Stage::spawn(EncoderStage::new(encoder, scaler, plan.width, plan.height), limit),
            sink,
            reporter,
            cancel,
            source.container().is_animated_image(),
        );
        let (payload, stats) = driver.run(samples, track.time_base).await?;

        Ok(TranscodeOutcome {
            run_id,
            format: plan.format,
            payload_bytes: payload.len() as u64,
            payload,
            plan,
            encoder_config: active,
            degraded: negotiation.degraded,
            stats,
        })
    }
}

fn decoder_config(track: &TrackMetadata) -> DecoderConfig {
    DecoderConfig {
        codec: track.codec.clone(),
        coded_width: track.width,
        coded_height: track.height,
        description: track.description.clone(),
    }
}

async fn configure_encoder(
    mut encoder: Box<dyn VideoEncoder>,
    config: EncoderConfig,
) -> Result<Box<dyn VideoEncoder>, TranscodeError> {
    let codec = config.codec.clone();
    let (encoder, result) = tokio::task::spawn_blocking(move || {
        let result = encoder.configure(&config);
        (encoder, result)
    })
    .await
    .map_err(|e| TranscodeError::StageStopped {
        stage: "encoder",
        reason: e.to_string(),
    })?;

    result.map_err(|source| TranscodeError::EncoderUnavailable { codec, source })?;
    Ok(encoder)
}

async fn configure_decoder(
    mut decoder: Box<dyn VideoDecoder>,
    config: DecoderConfig,
) -> Result<Box<dyn VideoDecoder>, TranscodeError> {
    let codec = config.codec.clone();
    let (decoder, result) = tokio::task::spawn_blocking(move || {
        let result = decoder.configure(&config);
        (decoder, result)
    })
    .await
    .map_err(|e| TranscodeError::StageStopped {
        stage: "decoder",
        reason: e.to_string(),
    })?;

    result.map_err(|source| TranscodeError::DecoderConfig { codec, source })?;
    Ok(decoder)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demux::SyntheticSource;

    #[test]
    fn test_source_error_mapping() {
        assert!(matches!(
            TranscodeError::from(SourceError::NoVideoTrack),
            TranscodeError::Input(InputError::NoVideoTrack)
        ));
        let malformed = TranscodeError::from(SourceError::Malformed {
            reason: "bad".to_string(),
        });
        assert!(matches!(malformed, TranscodeError::Source(_)));
        assert!(malformed.is_input_error());
        assert!(!TranscodeError::Cancelled.is_input_error());
    }

    #[test]
    fn test_plan_missing_track() {
        let source = SyntheticSource::builder().without_video_track().build();
        let request = TranscodeRequest::new(Budget::new(1_000_000).unwrap());
        let result = Transcoder::default().plan(&source, &request);
        assert!(matches!(
            result,
            Err(TranscodeError::Input(InputError::NoVideoTrack))
        ));
    }

    #[test]
    fn test_output_format_follows_container() {
        let gif = SyntheticSource::builder()
            .container(crate::media::ContainerFormat::Gif)
            .build();
        let request = TranscodeRequest::new(Budget::new(1).unwrap());
        assert_eq!(request.output_format(&gif), OutputFormat::WebM);
        assert_eq!(
            request.with_format(OutputFormat::Mp4).output_format(&gif),
            OutputFormat::Mp4
        );
    }

    #[tokio::test]
    async fn test_simulated_run_succeeds() {
        let source = SyntheticSource::builder()
            .dimensions(640, 360)
            .frames(45, 1_001, 30_000)
            .build();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let outcome = Transcoder::new(ClipfitConfig::for_testing())
            .run(
                &source,
                TranscodeRequest::new(Budget::new(512 * 1024).unwrap()),
                CodecBackend::simulated(),
                tx,
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(!outcome.payload.is_empty());
        assert_eq!(outcome.stats.samples_submitted, 45);
        assert_eq!(outcome.stats.frames_decoded, 45);
        assert_eq!(outcome.encoder_config.codec, "avc1.64002a");

        let mut terminal = 0;
        while let Ok(event) = rx.try_recv() {
            if event.is_terminal() {
                terminal += 1;
                assert!(matches!(event, TranscodeEvent::Done { .. }));
            }
        }
        assert_eq!(terminal, 1);
    }
}
