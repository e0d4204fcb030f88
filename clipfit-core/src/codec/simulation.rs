//! Deterministic codec simulations.
//!
//! These stand in for real codecs in tests and in `clipfit --simulate`. They
//! honour the same contracts (configure before use, frames held back until
//! flush, first chunk carries a decoder configuration) and expose knobs for
//! failure injection and per-item latency so pipeline edge cases can be
//! reproduced without a codec library.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use super::{
    ChunkSink, CodecError, CodecResult, DecoderConfig, EncoderConfig, EncoderSupport,
    VideoDecoder, VideoEncoder,
};
use crate::media::{ChunkKind, CodecString, DecodeUnit, EncodedChunk, VideoFrame};

/// Decoder that turns every unit into a blank frame of the coded size.
#[derive(Debug, Default)]
pub struct SimulatedDecoder {
    config: Option<DecoderConfig>,
    pending: VecDeque<VideoFrame>,
    decoded_units: u64,
    lookahead: usize,
    fail_at: Option<u64>,
    fail_configure: bool,
    latency: Duration,
}

impl SimulatedDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Holds back up to `frames` decoded frames until later input or flush.
    pub fn with_lookahead(mut self, frames: usize) -> Self {
        self.lookahead = frames;
        self
    }

    /// Fails the decode call for the zero-based unit `index`.
    pub fn fail_at(mut self, index: u64) -> Self {
        self.fail_at = Some(index);
        self
    }

    /// Rejects every configuration.
    pub fn fail_configure(mut self) -> Self {
        self.fail_configure = true;
        self
    }

    /// Blocks for `latency` on every decode call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

impl VideoDecoder for SimulatedDecoder {
    fn configure(&mut self, config: &DecoderConfig) -> CodecResult<()> {
        if self.fail_configure {
            return Err(CodecError::InvalidConfig {
                reason: format!("simulated decoder rejected {}", config.codec),
            });
        }
        if config.coded_width == 0 || config.coded_height == 0 {
            return Err(CodecError::InvalidConfig {
                reason: "coded dimensions must be non-zero".to_string(),
            });
        }
        self.config = Some(config.clone());
        Ok(())
    }

    fn decode(&mut self, unit: DecodeUnit) -> CodecResult<Vec<VideoFrame>> {
        let config = self.config.as_ref().ok_or(CodecError::NotConfigured)?;
        let index = self.decoded_units;
        self.decoded_units += 1;

        if self.fail_at == Some(index) {
            return Err(CodecError::DecodeFailed {
                reason: format!("simulated failure at unit {index}"),
            });
        }
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }

        self.pending.push_back(VideoFrame::blank(
            config.coded_width,
            config.coded_height,
            unit.timestamp_us,
            unit.duration_us,
        ));

        let ready = self.pending.len().saturating_sub(self.lookahead);
        Ok(self.pending.drain(..ready).collect())
    }

    fn flush(&mut self) -> CodecResult<Vec<VideoFrame>> {
        if self.config.is_none() {
            return Err(CodecError::NotConfigured);
        }
        Ok(self.pending.drain(..).collect())
    }
}

/// Encoder producing pseudo-random chunk sizes around the configured bitrate.
#[derive(Debug)]
pub struct SimulatedEncoder {
    config: Option<EncoderConfig>,
    rng: ChaCha8Rng,
    pending: VecDeque<VideoFrame>,
    frames_seen: u64,
    chunks_emitted: u64,
    lookahead: usize,
    frames_per_chunk: usize,
    keyframe_interval: u64,
    fail_at: Option<u64>,
    fail_configure: bool,
    latency: Duration,
}

impl Default for SimulatedEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedEncoder {
    pub fn new() -> Self {
        Self::with_seed(42)
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            config: None,
            rng: ChaCha8Rng::seed_from_u64(seed),
            pending: VecDeque::new(),
            frames_seen: 0,
            chunks_emitted: 0,
            lookahead: 0,
            frames_per_chunk: 1,
            keyframe_interval: 60,
            fail_at: None,
            fail_configure: false,
            latency: Duration::ZERO,
        }
    }

    /// Holds back up to `frames` frames, like a real encoder's lookahead.
    pub fn with_lookahead(mut self, frames: usize) -> Self {
        self.lookahead = frames;
        self
    }

    /// Packs `frames` consecutive frames into each chunk.
    pub fn with_frames_per_chunk(mut self, frames: usize) -> Self {
        self.frames_per_chunk = frames.max(1);
        self
    }

    pub fn with_keyframe_interval(mut self, interval: u64) -> Self {
        self.keyframe_interval = interval.max(1);
        self
    }

    /// Fails the encode call for the zero-based frame `index`.
    pub fn fail_at(mut self, index: u64) -> Self {
        self.fail_at = Some(index);
        self
    }

    /// Rejects every configuration.
    pub fn fail_configure(mut self) -> Self {
        self.fail_configure = true;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn emit_ready(&mut self, draining: bool) -> CodecResult<Vec<EncodedChunk>> {
        let config = self.config.clone().ok_or(CodecError::NotConfigured)?;
        let mut chunks = Vec::new();

        loop {
            let available = self.pending.len().saturating_sub(if draining { 0 } else { self.lookahead });
            if available == 0 || (!draining && available < self.frames_per_chunk) {
                break;
            }
            let take = available.min(self.frames_per_chunk);
            let frames: Vec<VideoFrame> = self.pending.drain(..take).collect();
            chunks.push(self.make_chunk(&config, &frames));
        }

        Ok(chunks)
    }

    fn make_chunk(&mut self, config: &EncoderConfig, frames: &[VideoFrame]) -> EncodedChunk {
        let per_frame = config.bitrate as f64 / config.framerate.max(1.0) / 8.0;
        let jitter = self.rng.random_range(0.8..1.2);
        let size = ((per_frame * frames.len() as f64 * jitter) as usize).max(1);

        let index = self.chunks_emitted;
        self.chunks_emitted += 1;
        let is_key = index % self.keyframe_interval == 0;

        let first = &frames[0];
        let duration_us = frames.iter().map(|frame| frame.duration_us).sum();

        EncodedChunk {
            kind: if is_key { ChunkKind::Key } else { ChunkKind::Delta },
            timestamp_us: first.timestamp_us,
            duration_us,
            data: Bytes::from(vec![(index % 251) as u8; size]),
            decoder_config: (index == 0).then(|| simulated_decoder_config(&config.codec)),
        }
    }
}

impl VideoEncoder for SimulatedEncoder {
    fn configure(&mut self, config: &EncoderConfig) -> CodecResult<()> {
        if self.fail_configure {
            return Err(CodecError::InvalidConfig {
                reason: format!("simulated encoder rejected {}", config.codec),
            });
        }
        config.codec.parse::<CodecString>()?;
        if config.width == 0 || config.height == 0 || config.bitrate == 0 {
            return Err(CodecError::InvalidConfig {
                reason: "dimensions and bitrate must be non-zero".to_string(),
            });
        }
        self.config = Some(config.clone());
        Ok(())
    }

    fn encode(&mut self, frame: VideoFrame) -> CodecResult<Vec<EncodedChunk>> {
        let config = self.config.as_ref().ok_or(CodecError::NotConfigured)?;
        if !frame.has_dimensions(config.width, config.height) {
            return Err(CodecError::EncodeFailed {
                reason: format!(
                    "frame is {}x{}, encoder expects {}x{}",
                    frame.width(),
                    frame.height(),
                    config.width,
                    config.height
                ),
            });
        }

        let index = self.frames_seen;
        self.frames_seen += 1;
        if self.fail_at == Some(index) {
            return Err(CodecError::EncodeFailed {
                reason: format!("simulated failure at frame {index}"),
            });
        }
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }

        self.pending.push_back(frame);
        self.emit_ready(false)
    }

    fn flush(&mut self) -> CodecResult<Vec<EncodedChunk>> {
        self.emit_ready(true)
    }
}

/// AVC configuration records start with version, profile, compatibility and
/// level; other codecs get an opaque marker.
fn simulated_decoder_config(codec: &str) -> Bytes {
    match codec.parse::<CodecString>() {
        Ok(CodecString::Avc {
            profile_idc,
            constraint_flags,
            level_idc,
            ..
        }) => Bytes::from(vec![1, profile_idc, constraint_flags, level_idc, 0xFF, 0xE0, 0x00]),
        _ => Bytes::from_static(b"simulated-config"),
    }
}

type ProbeFn = dyn Fn(&EncoderConfig) -> CodecResult<bool> + Send + Sync;

/// Support probe backed by a predicate, recording every probed configuration.
pub struct SimulatedSupport {
    predicate: Box<ProbeFn>,
    probes: Arc<Mutex<Vec<EncoderConfig>>>,
}

impl std::fmt::Debug for SimulatedSupport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedSupport").finish_non_exhaustive()
    }
}

impl SimulatedSupport {
    pub fn with_predicate<F>(predicate: F) -> Self
    where
        F: Fn(&EncoderConfig) -> CodecResult<bool> + Send + Sync + 'static,
    {
        Self {
            predicate: Box::new(predicate),
            probes: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn accept_all() -> Self {
        Self::with_predicate(|_| Ok(true))
    }

    pub fn reject_all() -> Self {
        Self::with_predicate(|_| Ok(false))
    }

    /// Every probe fails with a backend error.
    pub fn failing() -> Self {
        Self::with_predicate(|config| {
            Err(CodecError::Backend {
                reason: format!("probe for {} crashed", config.codec),
            })
        })
    }

    /// Shared log of probed configurations, in probe order.
    pub fn probe_log(&self) -> Arc<Mutex<Vec<EncoderConfig>>> {
        Arc::clone(&self.probes)
    }
}

impl EncoderSupport for SimulatedSupport {
    fn probe_support(&self, config: &EncoderConfig) -> CodecResult<bool> {
        if let Ok(mut probes) = self.probes.lock() {
            probes.push(config.clone());
        }
        (self.predicate)(config)
    }
}

const PAYLOAD_MAGIC: &[u8; 6] = b"CFSIM1";

/// In-memory sink writing a simple length-prefixed chunk log.
///
/// The payload layout is the magic `CFSIM1` followed by one record per chunk:
/// kind (u8), has-config (u8), timestamp (i64), duration (u64), data length
/// (u32), data, and, when flagged, config length (u32) plus config bytes.
#[derive(Debug, Default)]
pub struct MemorySink {
    buffer: BytesMut,
    config: Option<EncoderConfig>,
    chunks_written: u64,
    finalized: bool,
    fail_at: Option<u64>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects the zero-based chunk `index`.
    pub fn fail_at(mut self, index: u64) -> Self {
        self.fail_at = Some(index);
        self
    }

    pub fn chunks_written(&self) -> u64 {
        self.chunks_written
    }
}

impl ChunkSink for MemorySink {
    fn begin(&mut self, config: &EncoderConfig) -> CodecResult<()> {
        if self.config.is_some() {
            return Err(CodecError::MuxFailed {
                reason: "sink already started".to_string(),
            });
        }
        self.config = Some(config.clone());
        self.buffer.put_slice(PAYLOAD_MAGIC);
        Ok(())
    }

    fn add_chunk(&mut self, chunk: EncodedChunk) -> CodecResult<()> {
        if self.config.is_none() || self.finalized {
            return Err(CodecError::MuxFailed {
                reason: "chunk added outside begin/finalize".to_string(),
            });
        }
        if self.fail_at == Some(self.chunks_written) {
            return Err(CodecError::MuxFailed {
                reason: format!("simulated failure at chunk {}", self.chunks_written),
            });
        }

        self.buffer.put_u8(match chunk.kind {
            ChunkKind::Key => 1,
            ChunkKind::Delta => 0,
        });
        self.buffer.put_u8(u8::from(chunk.decoder_config.is_some()));
        self.buffer.put_i64(chunk.timestamp_us);
        self.buffer.put_u64(chunk.duration_us);
        self.buffer.put_u32(chunk.data.len() as u32);
        self.buffer.put_slice(&chunk.data);
        if let Some(config) = &chunk.decoder_config {
            self.buffer.put_u32(config.len() as u32);
            self.buffer.put_slice(config);
        }

        self.chunks_written += 1;
        Ok(())
    }

    fn finalize(&mut self) -> CodecResult<Bytes> {
        if self.finalized {
            return Err(CodecError::MuxFailed {
                reason: "sink already finalized".to_string(),
            });
        }
        if self.chunks_written == 0 {
            return Err(CodecError::MuxFailed {
                reason: "no chunks were written".to_string(),
            });
        }
        self.finalized = true;
        Ok(std::mem::take(&mut self.buffer).freeze())
    }
}

/// Decodes a [`MemorySink`] payload back into its chunks.
///
/// # Errors
///
/// - `CodecError::MuxFailed` - Missing magic or truncated record
pub fn parse_payload(payload: &[u8]) -> CodecResult<Vec<EncodedChunk>> {
    let truncated = || CodecError::MuxFailed {
        reason: "truncated simulated payload".to_string(),
    };

    let mut cursor = payload
        .strip_prefix(PAYLOAD_MAGIC.as_slice())
        .ok_or_else(|| CodecError::MuxFailed {
            reason: "not a simulated payload".to_string(),
        })?;

    let mut chunks = Vec::new();
    while cursor.has_remaining() {
        if cursor.remaining() < 2 + 8 + 8 + 4 {
            return Err(truncated());
        }
        let kind = if cursor.get_u8() == 1 {
            ChunkKind::Key
        } else {
            ChunkKind::Delta
        };
        let has_config = cursor.get_u8() == 1;
        let timestamp_us = cursor.get_i64();
        let duration_us = cursor.get_u64();
        let len = cursor.get_u32() as usize;
        if cursor.remaining() < len {
            return Err(truncated());
        }
        let data = Bytes::copy_from_slice(&cursor[..len]);
        cursor.advance(len);

        let decoder_config = if has_config {
            if cursor.remaining() < 4 {
                return Err(truncated());
            }
            let config_len = cursor.get_u32() as usize;
            if cursor.remaining() < config_len {
                return Err(truncated());
            }
            let config = Bytes::copy_from_slice(&cursor[..config_len]);
            cursor.advance(config_len);
            Some(config)
        } else {
            None
        };

        chunks.push(EncodedChunk {
            kind,
            timestamp_us,
            duration_us,
            data,
            decoder_config,
        });
    }

    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::BitrateMode;

    fn encoder_config() -> EncoderConfig {
        EncoderConfig {
            codec: "avc1.64002a".to_string(),
            width: 64,
            height: 48,
            bitrate: 240_000,
            framerate: 30.0,
            bitrate_mode: BitrateMode::Constant,
        }
    }

    fn decoder_config() -> DecoderConfig {
        DecoderConfig {
            codec: "avc1.64002a".to_string(),
            coded_width: 64,
            coded_height: 48,
            description: None,
        }
    }

    fn unit(index: i64) -> DecodeUnit {
        DecodeUnit {
            kind: ChunkKind::from_random_access(index == 0),
            timestamp_us: index * 33_333,
            duration_us: 33_333,
            data: Bytes::from_static(&[0; 16]),
        }
    }

    #[test]
    fn test_decoder_requires_configure() {
        let mut decoder = SimulatedDecoder::new();
        assert!(matches!(decoder.decode(unit(0)), Err(CodecError::NotConfigured)));
    }

    #[test]
    fn test_decoder_lookahead_released_on_flush() {
        let mut decoder = SimulatedDecoder::new().with_lookahead(2);
        decoder.configure(&decoder_config()).unwrap();

        let mut frames = Vec::new();
        for index in 0..5 {
            frames.extend(decoder.decode(unit(index)).unwrap());
        }
        assert_eq!(frames.len(), 3);

        frames.extend(decoder.flush().unwrap());
        assert_eq!(frames.len(), 5);
        let timestamps: Vec<i64> = frames.iter().map(|frame| frame.timestamp_us).collect();
        assert_eq!(timestamps, vec![0, 33_333, 66_666, 99_999, 133_332]);
    }

    #[test]
    fn test_decoder_failure_injection() {
        let mut decoder = SimulatedDecoder::new().fail_at(1);
        decoder.configure(&decoder_config()).unwrap();
        assert!(decoder.decode(unit(0)).is_ok());
        assert!(matches!(decoder.decode(unit(1)), Err(CodecError::DecodeFailed { .. })));

        let mut rejecting = SimulatedDecoder::new().fail_configure();
        assert!(rejecting.configure(&decoder_config()).is_err());
    }

    #[test]
    fn test_encoder_first_chunk_carries_config() {
        let mut encoder = SimulatedEncoder::new();
        encoder.configure(&encoder_config()).unwrap();

        let first = encoder.encode(VideoFrame::blank(64, 48, 0, 33_333)).unwrap();
        let second = encoder.encode(VideoFrame::blank(64, 48, 33_333, 33_333)).unwrap();

        assert_eq!(first.len(), 1);
        assert_eq!(first[0].kind, ChunkKind::Key);
        assert_eq!(
            first[0].decoder_config.as_deref(),
            Some(&[1, 0x64, 0x00, 0x2a, 0xFF, 0xE0, 0x00][..])
        );
        assert!(second[0].decoder_config.is_none());
        assert_eq!(second[0].kind, ChunkKind::Delta);
    }

    #[test]
    fn test_encoder_chunk_size_tracks_bitrate() {
        let mut encoder = SimulatedEncoder::new();
        encoder.configure(&encoder_config()).unwrap();

        // 240 kbps at 30 fps is 1000 bytes per frame, +-20%
        for index in 0..20 {
            let chunks = encoder
                .encode(VideoFrame::blank(64, 48, index * 33_333, 33_333))
                .unwrap();
            let size = chunks[0].data.len();
            assert!((800..=1200).contains(&size), "chunk size {size}");
        }
    }

    #[test]
    fn test_encoder_groups_frames_and_drains() {
        let mut encoder = SimulatedEncoder::new().with_frames_per_chunk(3);
        encoder.configure(&encoder_config()).unwrap();

        let mut chunks = Vec::new();
        for index in 0..7 {
            chunks.extend(
                encoder
                    .encode(VideoFrame::blank(64, 48, index * 100, 100))
                    .unwrap(),
            );
        }
        assert_eq!(chunks.len(), 2);
        chunks.extend(encoder.flush().unwrap());
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].timestamp_us, 600);
        assert_eq!(chunks[0].duration_us, 300);
    }

    #[test]
    fn test_encoder_rejects_mismatched_frame() {
        let mut encoder = SimulatedEncoder::new();
        encoder.configure(&encoder_config()).unwrap();
        let result = encoder.encode(VideoFrame::blank(1920, 1080, 0, 0));
        assert!(matches!(result, Err(CodecError::EncodeFailed { .. })));
    }

    #[test]
    fn test_support_records_probes() {
        let support = SimulatedSupport::with_predicate(|config| {
            Ok(config.bitrate_mode == BitrateMode::Variable)
        });
        let log = support.probe_log();

        let mut config = encoder_config();
        assert!(!support.probe_support(&config).unwrap());
        config.bitrate_mode = BitrateMode::Variable;
        assert!(support.probe_support(&config).unwrap());
        assert_eq!(log.lock().unwrap().len(), 2);

        assert!(SimulatedSupport::failing().probe_support(&config).is_err());
    }

    #[test]
    fn test_memory_sink_payload_parses_back() {
        let mut encoder = SimulatedEncoder::new();
        encoder.configure(&encoder_config()).unwrap();
        let mut sink = MemorySink::new();
        sink.begin(&encoder_config()).unwrap();

        let mut produced = Vec::new();
        for index in 0..4 {
            for chunk in encoder
                .encode(VideoFrame::blank(64, 48, index * 33_333, 33_333))
                .unwrap()
            {
                produced.push(chunk.clone());
                sink.add_chunk(chunk).unwrap();
            }
        }

        let payload = sink.finalize().unwrap();
        assert_eq!(parse_payload(&payload).unwrap(), produced);
        assert!(sink.finalize().is_err());
        assert!(sink.add_chunk(produced[0].clone()).is_err());
    }

    #[test]
    fn test_memory_sink_rejects_empty_and_unstarted() {
        let mut sink = MemorySink::new();
        assert!(sink.add_chunk(EncodedChunk {
            kind: ChunkKind::Key,
            timestamp_us: 0,
            duration_us: 0,
            data: Bytes::new(),
            decoder_config: None,
        })
        .is_err());

        sink.begin(&encoder_config()).unwrap();
        assert!(sink.finalize().is_err());
        assert!(parse_payload(b"nope").is_err());
    }
}
