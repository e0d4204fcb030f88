//! Clipfit Core - Budget-driven video re-encoding
//!
//! This crate provides the building blocks for fitting a video (or animated
//! image) into a caller-specified byte budget: duration and bitrate estimation,
//! resolution planning, encoder negotiation, and the backpressure-controlled
//! decode/encode pipeline that ties them together.

pub mod codec;
pub mod config;
pub mod demux;
pub mod media;
pub mod tracing_setup;
pub mod transcoding;
pub mod webp;

pub use codec::{CodecError, CodecResult};
pub use config::{ClipfitConfig, ConfigError};
pub use demux::{SampleSource, SourceError};
pub use transcoding::{TranscodeError, TranscodeEvent, TranscodeOutcome, Transcoder};
pub use webp::{WebpError, strip_webp_metadata};

/// Any failure a Clipfit caller can see, tagged by subsystem.
#[derive(Debug, thiserror::Error)]
pub enum ClipfitError {
    #[error("Transcode error: {0}")]
    Transcode(#[from] TranscodeError),

    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("WebP error: {0}")]
    Webp(#[from] WebpError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClipfitError {
    /// One-line message for end users, without internal detail.
    pub fn user_message(&self) -> String {
        match self {
            ClipfitError::Transcode(e) => match e {
                TranscodeError::Input(input) => format!("Unusable input: {input}"),
                TranscodeError::Source(source) => format!("Could not read video: {source}"),
                TranscodeError::EncoderUnavailable { codec, .. } => {
                    format!("No usable encoder for {codec}")
                }
                TranscodeError::Cancelled => "Transcode cancelled".to_string(),
                _ => "Transcode failed".to_string(),
            },
            ClipfitError::Source(e) => format!("Could not read video: {e}"),
            ClipfitError::Webp(_) => "Image post-processing failed".to_string(),
            ClipfitError::Configuration(e) => format!("Invalid configuration: {e}"),
            ClipfitError::Io(_) => "File system error occurred".to_string(),
        }
    }

    /// True when the input or the requested budget is at fault.
    pub fn is_user_error(&self) -> bool {
        match self {
            ClipfitError::Transcode(e) => e.is_input_error(),
            ClipfitError::Source(_) | ClipfitError::Configuration(_) => true,
            ClipfitError::Webp(_) | ClipfitError::Io(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcoding::InputError;

    #[test]
    fn test_input_errors_are_user_errors() {
        let error = ClipfitError::from(TranscodeError::Input(InputError::NoSamples));
        assert!(error.is_user_error());
        assert!(error.user_message().contains("Unusable input"));
    }

    #[test]
    fn test_runtime_errors_are_not_user_errors() {
        let error = ClipfitError::from(TranscodeError::Cancelled);
        assert!(!error.is_user_error());
        assert_eq!(error.user_message(), "Transcode cancelled");
    }
}
