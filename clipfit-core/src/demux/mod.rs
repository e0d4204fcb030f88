//! Sample sources: container demultiplexing into timed samples.
//!
//! A source exposes the video track's static metadata and its complete,
//! ordered sample list. The pipeline reads both once up front; nothing is
//! streamed lazily from the container.

pub mod atoms;
pub mod mp4;
pub mod synthetic;

use bytes::Bytes;
use thiserror::Error;

use crate::media::{ContainerFormat, DetectionError, Sample, TrackMetadata, detect_container_format};

pub use mp4::Mp4SampleSource;
pub use synthetic::SyntheticSource;

/// Errors raised while opening or parsing a source.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("No video track found")]
    NoVideoTrack,

    #[error("Malformed container: {reason}")]
    Malformed { reason: String },

    #[error("Container format not supported: {format}")]
    UnsupportedContainer { format: ContainerFormat },

    #[error("Video codec not supported: {fourcc}")]
    UnsupportedCodec { fourcc: String },

    #[error("Format detection failed: {0}")]
    Detection(#[from] DetectionError),

    #[error("Demuxer error: {reason}")]
    Backend { reason: String },

    #[error("IO error during {operation}: {source}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },
}

/// Result type for source operations.
pub type SourceResult<T> = Result<T, SourceError>;

/// A demultiplexed video track.
pub trait SampleSource: Send + Sync {
    /// Container the samples came from.
    fn container(&self) -> ContainerFormat;

    /// Metadata of the selected video track, `None` when the input has none.
    fn track_metadata(&self) -> Option<&TrackMetadata>;

    /// All samples of the video track in decode order.
    fn samples(&self) -> &[Sample];
}

/// Opens in-memory input with the built-in demuxers.
///
/// # Errors
///
/// - `SourceError::Detection` - Input too short to identify
/// - `SourceError::UnsupportedContainer` - No built-in demuxer for the format
/// - `SourceError::Malformed` / `SourceError::NoVideoTrack` - Parse failures
pub fn open_source(data: Bytes) -> SourceResult<Box<dyn SampleSource>> {
    let format = detect_container_format(&data)?;
    tracing::debug!("Detected container format: {}", format);

    if format.is_iso_bmff() {
        return Ok(Box::new(Mp4SampleSource::parse(data)?));
    }

    Err(SourceError::UnsupportedContainer { format })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_source_rejects_unknown() {
        let result = open_source(Bytes::from_static(b"GIF89a\x01\x00\x01\x00\x00\x00\x00"));
        assert!(matches!(
            result,
            Err(SourceError::UnsupportedContainer {
                format: ContainerFormat::Gif
            })
        ));

        let result = open_source(Bytes::from_static(b"tiny"));
        assert!(matches!(result, Err(SourceError::Detection(_))));
    }
}
