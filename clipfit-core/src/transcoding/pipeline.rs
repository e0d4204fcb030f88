//! The streaming decode/encode driver.
//!
//! A single driver task owns all run state. It feeds samples to the decoder
//! stage in order, forwards decoded frames to the encoder stage in completion
//! order, and writes encoded chunks to the sink in completion order. Every
//! wait for an admission slot keeps draining completion events so neither
//! stage can stall on a full event queue, and every wait is raced against
//! cancellation.

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::OwnedSemaphorePermit;
use tokio_util::sync::CancellationToken;

use super::TranscodeError;
use super::progress::ProgressReporter;
use super::stage::{DecoderStage, EncoderStage, Stage, StageCodec, StageEvent};
use crate::codec::ChunkSink;
use crate::media::{DecodeUnit, EncodedChunk, Sample, VideoFrame};

/// Counters for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub samples_submitted: u64,
    pub frames_decoded: u64,
    pub frames_encoded: u64,
    pub chunks_written: u64,
    pub decoder_high_water: usize,
    pub encoder_high_water: usize,
}

/// Re-times animated-image frames onto a gapless timeline starting at zero.
#[derive(Debug, Default)]
struct TimestampRebase {
    next_start_us: i64,
}

impl TimestampRebase {
    fn apply(&mut self, frame: &mut VideoFrame) {
        frame.timestamp_us = self.next_start_us;
        let duration = i64::try_from(frame.duration_us).unwrap_or(i64::MAX);
        self.next_start_us = self.next_start_us.saturating_add(duration);
    }
}

pub(crate) struct PipelineDriver<'a> {
    decoder: Stage<DecoderStage>,
    encoder: Stage<EncoderStage>,
    sink: Box<dyn ChunkSink>,
    reporter: &'a mut ProgressReporter,
    cancel: CancellationToken,
    rebase: Option<TimestampRebase>,
    stats: PipelineStats,
    decoder_flushed: bool,
    encoder_flushed: bool,
}

impl<'a> PipelineDriver<'a> {
    pub(crate) fn new(
        decoder: Stage<DecoderStage>,
        encoder: Stage<EncoderStage>,
        sink: Box<dyn ChunkSink>,
        reporter: &'a mut ProgressReporter,
        cancel: CancellationToken,
        rebase_timestamps: bool,
    ) -> Self {
        Self {
            decoder,
            encoder,
            sink,
            reporter,
            cancel,
            rebase: rebase_timestamps.then(TimestampRebase::default),
            stats: PipelineStats::default(),
            decoder_flushed: false,
            encoder_flushed: false,
        }
    }

    /// Pumps every sample through both stages, drains them, and finalizes the
    /// sink.
    ///
    /// # Errors
    ///
    /// - `TranscodeError::Cancelled` - Token fired before the sink finalized
    /// - `TranscodeError::RuntimeCodec` - Decoder, scaler or encoder failed
    /// - `TranscodeError::Sink` - Chunk rejected or finalize failed
    /// - `TranscodeError::StageStopped` - A worker vanished
    pub(crate) async fn run(
        mut self,
        samples: &[Sample],
        time_base: u32,
    ) -> Result<(Bytes, PipelineStats), TranscodeError> {
        for sample in samples {
            if self.cancel.is_cancelled() {
                return Err(TranscodeError::Cancelled);
            }
            let unit = DecodeUnit::from_sample(sample, time_base);
            let permit = self.decoder_slot().await?;
            self.decoder.submit(unit, permit)?;
            self.stats.samples_submitted += 1;
        }
        tracing::debug!("All {} samples submitted, draining", self.stats.samples_submitted);

        self.drain_decoder().await?;
        self.drain_encoder().await?;

        self.stats.decoder_high_water = self.decoder.high_water();
        self.stats.encoder_high_water = self.encoder.high_water();
        if self.stats.frames_decoded != self.stats.samples_submitted {
            tracing::warn!(
                "Decoder produced {} frames for {} samples",
                self.stats.frames_decoded,
                self.stats.samples_submitted
            );
        }

        let Self {
            decoder,
            encoder,
            mut sink,
            stats,
            ..
        } = self;
        decoder.shutdown().await;
        encoder.shutdown().await;

        let payload = tokio::task::spawn_blocking(move || sink.finalize())
            .await
            .map_err(|e| TranscodeError::StageStopped {
                stage: "sink",
                reason: e.to_string(),
            })?
            .map_err(|source| TranscodeError::Sink { source })?;

        Ok((payload, stats))
    }

    /// Waits for a decoder slot while servicing both stages.
    async fn decoder_slot(&mut self) -> Result<OwnedSemaphorePermit, TranscodeError> {
        let slot = self.decoder.slot();
        tokio::pin!(slot);
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(TranscodeError::Cancelled),
                event = self.encoder.next_event() => self.on_encoder_event(event)?,
                event = self.decoder.next_event() => self.on_decoder_event(event).await?,
                permit = &mut slot => return permit,
            }
        }
    }

    /// Waits for an encoder slot while servicing the encoder. Decoder events
    /// stay queued; the decoder blocks on its own event queue at worst.
    async fn encoder_slot(&mut self) -> Result<OwnedSemaphorePermit, TranscodeError> {
        let slot = self.encoder.slot();
        tokio::pin!(slot);
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(TranscodeError::Cancelled),
                event = self.encoder.next_event() => self.on_encoder_event(event)?,
                permit = &mut slot => return permit,
            }
        }
    }

    async fn on_decoder_event(
        &mut self,
        event: Option<StageEvent<VideoFrame>>,
    ) -> Result<(), TranscodeError> {
        match event {
            Some(StageEvent::Output(mut frame)) => {
                self.stats.frames_decoded += 1;
                if let Some(rebase) = self.rebase.as_mut() {
                    rebase.apply(&mut frame);
                }
                let permit = self.encoder_slot().await?;
                self.encoder.submit(frame, permit)?;
                self.stats.frames_encoded += 1;
                Ok(())
            }
            Some(StageEvent::Flushed) => {
                tracing::debug!("Decoder drained after {} frames", self.stats.frames_decoded);
                self.decoder_flushed = true;
                Ok(())
            }
            Some(StageEvent::Failed(source)) => Err(TranscodeError::RuntimeCodec {
                stage: DecoderStage::NAME,
                source,
            }),
            None => Err(stopped(DecoderStage::NAME)),
        }
    }

    fn on_encoder_event(&mut self, event: Option<StageEvent<EncodedChunk>>) -> Result<(), TranscodeError> {
        match event {
            Some(StageEvent::Output(chunk)) => {
                self.sink
                    .add_chunk(chunk)
                    .map_err(|source| TranscodeError::Sink { source })?;
                self.stats.chunks_written += 1;
                self.reporter.chunk_written(self.stats.chunks_written);
                Ok(())
            }
            Some(StageEvent::Flushed) => {
                tracing::debug!("Encoder drained after {} chunks", self.stats.chunks_written);
                self.encoder_flushed = true;
                Ok(())
            }
            Some(StageEvent::Failed(source)) => Err(TranscodeError::RuntimeCodec {
                stage: EncoderStage::NAME,
                source,
            }),
            None => Err(stopped(EncoderStage::NAME)),
        }
    }

    async fn drain_decoder(&mut self) -> Result<(), TranscodeError> {
        self.decoder.flush()?;
        while !self.decoder_flushed {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(TranscodeError::Cancelled),
                event = self.encoder.next_event() => self.on_encoder_event(event)?,
                event = self.decoder.next_event() => self.on_decoder_event(event).await?,
            }
        }
        Ok(())
    }

    async fn drain_encoder(&mut self) -> Result<(), TranscodeError> {
        self.encoder.flush()?;
        while !self.encoder_flushed {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(TranscodeError::Cancelled),
                event = self.encoder.next_event() => self.on_encoder_event(event)?,
            }
        }
        Ok(())
    }
}

fn stopped(stage: &'static str) -> TranscodeError {
    TranscodeError::StageStopped {
        stage,
        reason: "worker exited without reporting".to_string(),
    }
}
