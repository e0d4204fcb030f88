//! Codec stage workers.
//!
//! Each stage owns one synchronous codec on a blocking thread and talks to the
//! pipeline driver over two bounded channels: commands in, events out. Work
//! admission is governed by a semaphore with `queue_depth_limit` permits; a
//! permit travels with each submitted item and is released once the codec has
//! processed it, so the number of pending items can never exceed the limit.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::JoinHandle;

use super::TranscodeError;
use crate::codec::{CodecError, CodecResult, FrameScaler, VideoDecoder, VideoEncoder};
use crate::media::{DecodeUnit, EncodedChunk, VideoFrame};

/// A synchronous codec that a [`Stage`] can drive.
pub trait StageCodec: Send + 'static {
    type Input: Send + 'static;
    type Output: Send + 'static;

    /// Short name used in logs and errors.
    const NAME: &'static str;

    /// # Errors
    ///
    /// Any codec failure; the stage stops after reporting it.
    fn process(&mut self, input: Self::Input) -> CodecResult<Vec<Self::Output>>;

    /// # Errors
    ///
    /// Any codec failure while draining.
    fn flush(&mut self) -> CodecResult<Vec<Self::Output>>;
}

/// Decoder half of the pipeline.
pub struct DecoderStage {
    decoder: Box<dyn VideoDecoder>,
}

impl DecoderStage {
    pub fn new(decoder: Box<dyn VideoDecoder>) -> Self {
        Self { decoder }
    }
}

impl StageCodec for DecoderStage {
    type Input = DecodeUnit;
    type Output = VideoFrame;

    const NAME: &'static str = "decoder";

    fn process(&mut self, unit: DecodeUnit) -> CodecResult<Vec<VideoFrame>> {
        self.decoder.decode(unit)
    }

    fn flush(&mut self) -> CodecResult<Vec<VideoFrame>> {
        self.decoder.flush()
    }
}

/// Encoder half of the pipeline, resampling frames that do not match the
/// planned output size.
pub struct EncoderStage {
    encoder: Box<dyn VideoEncoder>,
    scaler: Box<dyn FrameScaler>,
    width: u32,
    height: u32,
    frames_resampled: u64,
}

impl EncoderStage {
    pub fn new(
        encoder: Box<dyn VideoEncoder>,
        scaler: Box<dyn FrameScaler>,
        width: u32,
        height: u32,
    ) -> Self {
        Self {
            encoder,
            scaler,
            width,
            height,
            frames_resampled: 0,
        }
    }
}

impl StageCodec for EncoderStage {
    type Input = VideoFrame;
    type Output = EncodedChunk;

    const NAME: &'static str = "encoder";

    fn process(&mut self, frame: VideoFrame) -> CodecResult<Vec<EncodedChunk>> {
        let frame = if frame.has_dimensions(self.width, self.height) {
            frame
        } else {
            let scaled = self.scaler.scale(&frame, self.width, self.height)?;
            self.frames_resampled += 1;
            scaled
        };
        self.encoder.encode(frame)
    }

    fn flush(&mut self) -> CodecResult<Vec<EncodedChunk>> {
        if self.frames_resampled > 0 {
            tracing::debug!(
                "Resampled {} frames to {}x{}",
                self.frames_resampled,
                self.width,
                self.height
            );
        }
        self.encoder.flush()
    }
}

enum StageCommand<I> {
    Process(I, OwnedSemaphorePermit),
    Flush,
}

/// Completion events delivered to the driver.
#[derive(Debug)]
pub enum StageEvent<O> {
    Output(O),
    /// Every item submitted before the flush has been processed and its
    /// outputs delivered.
    Flushed,
    /// The codec failed; no further events follow.
    Failed(CodecError),
}

/// Driver-side handle to a running stage worker.
pub struct Stage<C: StageCodec> {
    commands: mpsc::Sender<StageCommand<C::Input>>,
    events: mpsc::Receiver<StageEvent<C::Output>>,
    slots: Arc<Semaphore>,
    limit: usize,
    high_water: usize,
    worker: JoinHandle<()>,
}

impl<C: StageCodec> Stage<C> {
    /// Starts the worker thread for `codec`.
    pub fn spawn(codec: C, limit: usize) -> Self {
        let limit = limit.max(1);
        // Room for every admitted item plus the flush command.
        let (command_tx, command_rx) = mpsc::channel(limit + 1);
        let (event_tx, event_rx) = mpsc::channel(limit * 2);

        let worker = tokio::task::spawn_blocking(move || run_worker(codec, command_rx, event_tx));
        tracing::debug!("Started {} stage with queue depth {}", C::NAME, limit);

        Self {
            commands: command_tx,
            events: event_rx,
            slots: Arc::new(Semaphore::new(limit)),
            limit,
            high_water: 0,
            worker,
        }
    }

    /// A future resolving to an admission slot. It owns its handle to the
    /// semaphore, so the driver may keep receiving events while it waits.
    pub fn slot(&self) -> impl Future<Output = Result<OwnedSemaphorePermit, TranscodeError>> + use<C> {
        let slots = Arc::clone(&self.slots);
        async move {
            slots
                .acquire_owned()
                .await
                .map_err(|_| TranscodeError::StageStopped {
                    stage: C::NAME,
                    reason: "admission closed".to_string(),
                })
        }
    }

    /// Hands an item to the worker.
    ///
    /// # Errors
    ///
    /// - `TranscodeError::StageStopped` - Worker has exited
    pub fn submit(&mut self, input: C::Input, permit: OwnedSemaphorePermit) -> Result<(), TranscodeError> {
        self.send(StageCommand::Process(input, permit))?;
        self.high_water = self.high_water.max(self.pending());
        Ok(())
    }

    /// Asks the worker to drain its codec. A `Flushed` event follows once all
    /// earlier items are done.
    ///
    /// # Errors
    ///
    /// - `TranscodeError::StageStopped` - Worker has exited
    pub fn flush(&mut self) -> Result<(), TranscodeError> {
        self.send(StageCommand::Flush)
    }

    fn send(&self, command: StageCommand<C::Input>) -> Result<(), TranscodeError> {
        self.commands.try_send(command).map_err(|e| {
            let reason = match e {
                mpsc::error::TrySendError::Full(_) => "command queue full",
                mpsc::error::TrySendError::Closed(_) => "worker exited",
            };
            TranscodeError::StageStopped {
                stage: C::NAME,
                reason: reason.to_string(),
            }
        })
    }

    /// Next completion event; `None` once the worker has gone away.
    pub async fn next_event(&mut self) -> Option<StageEvent<C::Output>> {
        self.events.recv().await
    }

    /// Items admitted but not yet processed.
    pub fn pending(&self) -> usize {
        self.limit - self.slots.available_permits()
    }

    pub fn high_water(&self) -> usize {
        self.high_water
    }

    /// Closes the command queue and waits for the worker thread to exit.
    pub async fn shutdown(self) {
        let Self {
            commands,
            events,
            worker,
            ..
        } = self;
        drop(commands);
        drop(events);
        if let Err(e) = worker.await {
            tracing::warn!("{} stage worker ended abnormally: {}", C::NAME, e);
        }
    }
}

fn run_worker<C: StageCodec>(
    mut codec: C,
    mut commands: mpsc::Receiver<StageCommand<C::Input>>,
    events: mpsc::Sender<StageEvent<C::Output>>,
) {
    while let Some(command) = commands.blocking_recv() {
        let (result, flushed) = match command {
            StageCommand::Process(input, permit) => {
                let result = codec.process(input);
                drop(permit);
                (result, false)
            }
            StageCommand::Flush => (codec.flush(), true),
        };

        match result {
            Ok(outputs) => {
                for output in outputs {
                    if events.blocking_send(StageEvent::Output(output)).is_err() {
                        return;
                    }
                }
                if flushed && events.blocking_send(StageEvent::Flushed).is_err() {
                    return;
                }
            }
            Err(e) => {
                tracing::error!("{} failed: {}", C::NAME, e);
                let _ = events.blocking_send(StageEvent::Failed(e));
                return;
            }
        }
    }
    tracing::debug!("{} stage worker exiting", C::NAME);
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    /// Doubles every input, failing on a chosen value.
    struct Doubler {
        fail_on: Option<u32>,
        delay: Duration,
    }

    impl StageCodec for Doubler {
        type Input = u32;
        type Output = u32;

        const NAME: &'static str = "doubler";

        fn process(&mut self, input: u32) -> CodecResult<Vec<u32>> {
            std::thread::sleep(self.delay);
            if self.fail_on == Some(input) {
                return Err(CodecError::Backend {
                    reason: format!("refused {input}"),
                });
            }
            Ok(vec![input * 2])
        }

        fn flush(&mut self) -> CodecResult<Vec<u32>> {
            Ok(vec![u32::MAX])
        }
    }

    #[tokio::test]
    async fn test_outputs_in_order_then_flushed() {
        let mut stage = Stage::spawn(
            Doubler {
                fail_on: None,
                delay: Duration::ZERO,
            },
            2,
        );

        let mut outputs = Vec::new();
        for input in 1..=5 {
            let slot = stage.slot();
            tokio::pin!(slot);
            let permit = loop {
                tokio::select! {
                    biased;
                    Some(StageEvent::Output(value)) = stage.next_event() => outputs.push(value),
                    permit = &mut slot => break permit.unwrap(),
                }
            };
            stage.submit(input, permit).unwrap();
            assert!(stage.pending() <= 2);
        }
        stage.flush().unwrap();

        loop {
            match stage.next_event().await {
                Some(StageEvent::Output(value)) => outputs.push(value),
                Some(StageEvent::Flushed) => break,
                other => panic!("unexpected event {other:?}"),
            }
        }

        assert_eq!(outputs, vec![2, 4, 6, 8, 10, u32::MAX]);
        assert!(stage.high_water() <= 2);
        stage.shutdown().await;
    }

    #[tokio::test]
    async fn test_failure_is_reported_once() {
        let mut stage = Stage::spawn(
            Doubler {
                fail_on: Some(2),
                delay: Duration::from_millis(1),
            },
            4,
        );
        for input in 1..=3 {
            let permit = stage.slot().await.unwrap();
            stage.submit(input, permit).unwrap();
        }

        assert!(matches!(stage.next_event().await, Some(StageEvent::Output(2))));
        assert!(matches!(
            stage.next_event().await,
            Some(StageEvent::Failed(CodecError::Backend { .. }))
        ));
        assert!(stage.next_event().await.is_none());
    }
}
