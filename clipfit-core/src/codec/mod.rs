//! Codec collaborator boundary.
//!
//! The pipeline never talks to a concrete codec library. It drives objects
//! implementing the traits below, which have synchronous call-and-return
//! semantics; the stage workers in `transcoding::stage` turn them into the
//! asynchronous bounded-queue interface. Two families of implementations
//! exist: deterministic simulations for tests and `--simulate`, and FFmpeg
//! bindings behind the `ffmpeg` feature.

pub mod scale;
pub mod simulation;

#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;

use bytes::Bytes;
use thiserror::Error;

use crate::media::{DecodeUnit, EncodedChunk, VideoFrame};

pub use scale::AreaScaler;

/// Errors raised by codec collaborators.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Unsupported codec: {codec}")]
    UnsupportedCodec { codec: String },

    #[error("Invalid codec configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("Codec used before configure")]
    NotConfigured,

    #[error("Invalid frame: {reason}")]
    InvalidFrame { reason: String },

    #[error("Decode failed: {reason}")]
    DecodeFailed { reason: String },

    #[error("Encode failed: {reason}")]
    EncodeFailed { reason: String },

    #[error("Scale failed: {reason}")]
    ScaleFailed { reason: String },

    #[error("Mux failed: {reason}")]
    MuxFailed { reason: String },

    #[error("Codec backend error: {reason}")]
    Backend { reason: String },

    #[error("IO error during {operation}: {source}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },
}

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Encoder rate-control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BitrateMode {
    Constant,
    Variable,
}

impl std::fmt::Display for BitrateMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BitrateMode::Constant => f.write_str("constant"),
            BitrateMode::Variable => f.write_str("variable"),
        }
    }
}

/// One candidate (and eventually the active) encoder configuration.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct EncoderConfig {
    pub codec: String,
    pub width: u32,
    pub height: u32,
    /// Bits per second
    pub bitrate: u64,
    pub framerate: f64,
    pub bitrate_mode: BitrateMode,
}

/// Decoder configuration derived from the source track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecoderConfig {
    pub codec: String,
    pub coded_width: u32,
    pub coded_height: u32,
    pub description: Option<Bytes>,
}

/// Synchronous video decoder.
///
/// `decode` may return zero or more frames; frames held back for reordering
/// must be released by `flush`.
pub trait VideoDecoder: Send + 'static {
    /// # Errors
    ///
    /// - `CodecError::UnsupportedCodec` / `CodecError::InvalidConfig` - Decoder cannot be set up
    fn configure(&mut self, config: &DecoderConfig) -> CodecResult<()>;

    /// # Errors
    ///
    /// - `CodecError::DecodeFailed` - Corrupt or unexpected input
    fn decode(&mut self, unit: DecodeUnit) -> CodecResult<Vec<VideoFrame>>;

    /// # Errors
    ///
    /// - `CodecError::DecodeFailed` - Draining the decoder failed
    fn flush(&mut self) -> CodecResult<Vec<VideoFrame>>;
}

/// Synchronous video encoder.
pub trait VideoEncoder: Send + 'static {
    /// # Errors
    ///
    /// - `CodecError::UnsupportedCodec` / `CodecError::InvalidConfig` - Encoder cannot be set up
    fn configure(&mut self, config: &EncoderConfig) -> CodecResult<()>;

    /// # Errors
    ///
    /// - `CodecError::EncodeFailed` - Frame rejected or encoder failure
    fn encode(&mut self, frame: VideoFrame) -> CodecResult<Vec<EncodedChunk>>;

    /// # Errors
    ///
    /// - `CodecError::EncodeFailed` - Draining the encoder failed
    fn flush(&mut self) -> CodecResult<Vec<EncodedChunk>>;
}

/// Capability probe used by encoder negotiation.
pub trait EncoderSupport: Send + Sync {
    /// Whether an encoder can be configured with `config`.
    ///
    /// # Errors
    ///
    /// Any error; callers treat it the same as `Ok(false)`.
    fn probe_support(&self, config: &EncoderConfig) -> CodecResult<bool>;
}

/// Frame resampler.
pub trait FrameScaler: Send + 'static {
    /// Returns a new frame of the requested size with the source timing.
    ///
    /// # Errors
    ///
    /// - `CodecError::ScaleFailed` - Scaling backend failure
    fn scale(&mut self, frame: &VideoFrame, width: u32, height: u32) -> CodecResult<VideoFrame>;
}

/// Output container writer.
pub trait ChunkSink: Send {
    /// Prepares the container for the active encoder configuration.
    ///
    /// # Errors
    ///
    /// - `CodecError::MuxFailed` - Container cannot be created
    fn begin(&mut self, config: &EncoderConfig) -> CodecResult<()>;

    /// # Errors
    ///
    /// - `CodecError::MuxFailed` - Chunk rejected
    fn add_chunk(&mut self, chunk: EncodedChunk) -> CodecResult<()>;

    /// Completes the container and returns its bytes.
    ///
    /// # Errors
    ///
    /// - `CodecError::MuxFailed` - Trailer or read-back failure
    fn finalize(&mut self) -> CodecResult<Bytes>;
}
