//! Duration and bitrate estimation from a byte budget.

use thiserror::Error;

use crate::config::RateConfig;
use crate::media::{Sample, TrackMetadata};

/// Input problems detected before any codec is configured.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum InputError {
    #[error("No video track found")]
    NoVideoTrack,

    #[error("Video track has no samples")]
    NoSamples,

    #[error("Invalid duration: {reason}")]
    InvalidDuration { reason: String },

    #[error("Invalid budget: {bytes} bytes")]
    InvalidBudget { bytes: u64 },
}

/// Target output size in bytes; always positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
pub struct Budget(u64);

impl Budget {
    /// # Errors
    ///
    /// - `InputError::InvalidBudget` - Zero bytes
    pub fn new(bytes: u64) -> Result<Self, InputError> {
        if bytes == 0 {
            return Err(InputError::InvalidBudget { bytes });
        }
        Ok(Self(bytes))
    }

    pub fn bytes(self) -> u64 {
        self.0
    }

    pub fn megabytes(self) -> f64 {
        self.0 as f64 / (1024.0 * 1024.0)
    }
}

impl std::fmt::Display for Budget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.1}MB", self.megabytes())
    }
}

/// Target bitrate and whether the floor had to be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitrateEstimate {
    pub bitrate: u64,
    pub clamped: bool,
}

/// Playback duration of the track in seconds.
///
/// The container's declared duration wins when positive; otherwise the span
/// from the earliest sample start to the latest sample end is used, which
/// also covers decode-ordered sample lists.
///
/// # Errors
///
/// - `InputError::NoSamples` - Empty sample list
/// - `InputError::InvalidDuration` - Neither source yields a positive duration
pub fn estimate_duration(track: &TrackMetadata, samples: &[Sample]) -> Result<f64, InputError> {
    if samples.is_empty() {
        return Err(InputError::NoSamples);
    }
    if let Some(declared) = track.declared_duration_seconds() {
        return Ok(declared);
    }
    if track.time_base == 0 {
        return Err(InputError::InvalidDuration {
            reason: "track time base is zero".to_string(),
        });
    }

    let start = samples.iter().map(|sample| sample.timestamp).min().unwrap_or(0);
    let end = samples.iter().map(Sample::end).max().unwrap_or(0);
    let span = end.saturating_sub(start);
    if span <= 0 {
        return Err(InputError::InvalidDuration {
            reason: format!("samples span {span} ticks"),
        });
    }

    Ok(span as f64 / f64::from(track.time_base))
}

/// `floor(budget * 8 * safety_factor / duration)`, raised to the floor.
///
/// # Errors
///
/// - `InputError::InvalidDuration` - Duration not positive and finite
pub fn estimate_bitrate(
    budget: Budget,
    duration_seconds: f64,
    safety_factor: f64,
    min_bitrate_bps: u64,
) -> Result<BitrateEstimate, InputError> {
    if !(duration_seconds.is_finite() && duration_seconds > 0.0) {
        return Err(InputError::InvalidDuration {
            reason: format!("{duration_seconds} seconds"),
        });
    }

    let raw = (budget.bytes() as f64 * 8.0 * safety_factor / duration_seconds).floor();
    // Float-to-int casts saturate, so huge budgets cannot wrap.
    let bitrate = raw as u64;
    if bitrate < min_bitrate_bps {
        return Ok(BitrateEstimate {
            bitrate: min_bitrate_bps,
            clamped: true,
        });
    }
    Ok(BitrateEstimate {
        bitrate,
        clamped: false,
    })
}

/// Encoder framerate: samples per second, clamped, with a default fallback.
pub fn estimate_framerate(sample_count: usize, duration_seconds: f64, rate: &RateConfig) -> f64 {
    let framerate = sample_count as f64 / duration_seconds;
    if framerate.is_finite() && framerate > 0.0 {
        framerate.clamp(1.0, rate.max_framerate.max(1.0))
    } else {
        rate.default_framerate
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use proptest::prelude::*;

    use super::*;

    fn track(time_base: u32, duration_ticks: Option<u64>) -> TrackMetadata {
        TrackMetadata {
            track_id: 1,
            width: 1920,
            height: 1080,
            time_base,
            codec: "avc1.640028".to_string(),
            description: None,
            duration_ticks,
        }
    }

    fn samples(timestamps: &[i64], duration: u64) -> Vec<Sample> {
        timestamps
            .iter()
            .map(|&timestamp| Sample {
                data: Bytes::new(),
                timestamp,
                duration,
                is_random_access: true,
            })
            .collect()
    }

    #[test]
    fn test_declared_duration_preferred() {
        let duration = estimate_duration(&track(1_000, Some(10_000)), &samples(&[0], 40)).unwrap();
        assert_eq!(duration, 10.0);
    }

    #[test]
    fn test_sample_span_fallback() {
        // Decode order with a reordered frame; span runs from 0 to 200
        let list = samples(&[0, 120, 40, 80, 160], 40);
        let duration = estimate_duration(&track(1_000, None), &list).unwrap();
        assert_eq!(duration, 0.2);
    }

    #[test]
    fn test_duration_errors() {
        assert_eq!(
            estimate_duration(&track(1_000, Some(5)), &[]),
            Err(InputError::NoSamples)
        );
        assert!(matches!(
            estimate_duration(&track(1_000, None), &samples(&[0, 0], 0)),
            Err(InputError::InvalidDuration { .. })
        ));
        assert!(matches!(
            estimate_duration(&track(0, None), &samples(&[0], 10)),
            Err(InputError::InvalidDuration { .. })
        ));
    }

    #[test]
    fn test_reference_bitrate() {
        // 2 MiB over 10 s at 0.90
        let estimate = estimate_bitrate(Budget::new(2 * 1024 * 1024).unwrap(), 10.0, 0.90, 50_000)
            .unwrap();
        assert_eq!(estimate.bitrate, 1_509_949);
        assert!(!estimate.clamped);
    }

    #[test]
    fn test_bitrate_clamped_to_floor() {
        let estimate = estimate_bitrate(Budget::new(10_000).unwrap(), 600.0, 0.90, 50_000).unwrap();
        assert_eq!(estimate.bitrate, 50_000);
        assert!(estimate.clamped);
    }

    #[test]
    fn test_budget_validation() {
        assert_eq!(Budget::new(0), Err(InputError::InvalidBudget { bytes: 0 }));
        assert_eq!(Budget::new(3 * 1024 * 1024).unwrap().to_string(), "3.0MB");
    }

    #[test]
    fn test_framerate_estimate() {
        let rate = RateConfig::default();
        assert_eq!(estimate_framerate(300, 10.0, &rate), 30.0);
        assert_eq!(estimate_framerate(1, 10.0, &rate), 1.0);
        assert_eq!(estimate_framerate(10_000, 1.0, &rate), 120.0);
        assert_eq!(estimate_framerate(10, 0.0, &rate), 30.0);
    }

    proptest! {
        #[test]
        fn test_bitrate_never_below_floor(
            bytes in 1u64..=u64::from(u32::MAX),
            duration in 0.001f64..100_000.0,
            safety in 0.01f64..0.99,
            floor in 0u64..=1_000_000,
        ) {
            let estimate = estimate_bitrate(Budget::new(bytes).unwrap(), duration, safety, floor).unwrap();
            prop_assert!(estimate.bitrate >= floor);
            prop_assert!(!estimate.clamped || estimate.bitrate == floor);
        }
    }
}
