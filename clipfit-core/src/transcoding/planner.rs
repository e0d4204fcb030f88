//! Output resolution and the per-run rate plan.

use serde::Serialize;

use super::estimator::{Budget, InputError, estimate_bitrate, estimate_duration, estimate_framerate};
use crate::config::{ClipfitConfig, ResolutionBand};
use crate::media::{OutputFormat, Sample, TrackMetadata};

/// Output dimensions chosen for a bitrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResolutionPlan {
    pub width: u32,
    pub height: u32,
    /// A band limited the height below the source's
    pub downscaled: bool,
}

/// Picks output dimensions for `bitrate` given the source size.
///
/// The first band whose ceiling lies above the bitrate caps the output height;
/// both axes shrink by the same factor. Dimensions are always even and at
/// least 2, since 4:2:0 encoders reject odd sizes.
pub fn plan_resolution(
    bitrate: u64,
    source_width: u32,
    source_height: u32,
    bands: &[ResolutionBand],
) -> ResolutionPlan {
    let band = bands.iter().find(|band| bitrate < band.max_bitrate_bps);

    let (width, height, downscaled) = match band {
        Some(band) if source_height > band.target_height => {
            let ratio = f64::from(band.target_height) / f64::from(source_height);
            let width = (f64::from(source_width) * ratio).round() as u32;
            (width, band.target_height, true)
        }
        _ => (source_width, source_height, false),
    };

    ResolutionPlan {
        width: even(width),
        height: even(height),
        downscaled,
    }
}

fn even(value: u32) -> u32 {
    (value - value % 2).max(2)
}

/// Everything fixed before the first sample is decoded.
///
/// Computed once per run and never revised mid-stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RatePlan {
    pub format: OutputFormat,
    pub duration_seconds: f64,
    pub budget_bytes: u64,
    pub safety_factor: f64,
    /// Bits per second
    pub bitrate: u64,
    /// The minimum bitrate replaced a lower estimate
    pub clamped: bool,
    pub framerate: f64,
    pub source_width: u32,
    pub source_height: u32,
    pub width: u32,
    pub height: u32,
    pub downscaled: bool,
}

impl RatePlan {
    /// Estimates duration and bitrate, then plans the output size.
    ///
    /// # Errors
    ///
    /// - `InputError::NoSamples` - Empty sample list
    /// - `InputError::InvalidDuration` - No positive duration available
    pub fn compute(
        track: &TrackMetadata,
        samples: &[Sample],
        budget: Budget,
        format: OutputFormat,
        config: &ClipfitConfig,
    ) -> Result<Self, InputError> {
        let duration_seconds = estimate_duration(track, samples)?;
        let safety_factor = config.rate.safety_factor_for(format);
        let estimate = estimate_bitrate(
            budget,
            duration_seconds,
            safety_factor,
            config.rate.min_bitrate_bps,
        )?;
        let resolution = plan_resolution(
            estimate.bitrate,
            track.width,
            track.height,
            &config.resolution.bands,
        );
        let framerate = estimate_framerate(samples.len(), duration_seconds, &config.rate);

        Ok(Self {
            format,
            duration_seconds,
            budget_bytes: budget.bytes(),
            safety_factor,
            bitrate: estimate.bitrate,
            clamped: estimate.clamped,
            framerate,
            source_width: track.width,
            source_height: track.height,
            width: resolution.width,
            height: resolution.height,
            downscaled: resolution.downscaled,
        })
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use proptest::prelude::*;

    use super::*;
    use crate::config::ResolutionConfig;

    fn bands() -> Vec<ResolutionBand> {
        ResolutionConfig::default().bands
    }

    #[test]
    fn test_low_bitrate_1080p_goes_to_480() {
        let plan = plan_resolution(800_000, 1920, 1080, &bands());
        assert_eq!(plan.height, 480);
        assert_eq!(plan.width, 852);
        assert!(plan.downscaled);
    }

    #[test]
    fn test_mid_bitrate_1080p_goes_to_720() {
        let plan = plan_resolution(1_800_000, 1920, 1080, &bands());
        assert_eq!((plan.width, plan.height), (1280, 720));
        assert!(plan.downscaled);
    }

    #[test]
    fn test_high_bitrate_keeps_source() {
        let plan = plan_resolution(4_000_000, 1280, 720, &bands());
        assert_eq!((plan.width, plan.height), (1280, 720));
        assert!(!plan.downscaled);
    }

    #[test]
    fn test_small_source_is_never_upscaled() {
        let plan = plan_resolution(100_000, 640, 360, &bands());
        assert_eq!((plan.width, plan.height), (640, 360));
        assert!(!plan.downscaled);
    }

    #[test]
    fn test_odd_source_made_even() {
        let plan = plan_resolution(4_000_000, 1279, 719, &bands());
        assert_eq!((plan.width, plan.height), (1278, 718));
        assert!(!plan.downscaled);

        let tiny = plan_resolution(4_000_000, 1, 1, &bands());
        assert_eq!((tiny.width, tiny.height), (2, 2));
    }

    #[test]
    fn test_rate_plan_reference_case() {
        let track = TrackMetadata {
            track_id: 1,
            width: 1920,
            height: 1080,
            time_base: 1_000,
            codec: "avc1.640028".to_string(),
            description: None,
            duration_ticks: Some(10_000),
        };
        let samples: Vec<Sample> = (0..300)
            .map(|index| Sample {
                data: Bytes::new(),
                timestamp: index * 33,
                duration: 33,
                is_random_access: index == 0,
            })
            .collect();

        let plan = RatePlan::compute(
            &track,
            &samples,
            Budget::new(2 * 1024 * 1024).unwrap(),
            OutputFormat::Mp4,
            &ClipfitConfig::default(),
        )
        .unwrap();

        assert_eq!(plan.bitrate, 1_509_949);
        assert!(!plan.clamped);
        assert_eq!((plan.width, plan.height), (1280, 720));
        assert!(plan.downscaled);
        assert_eq!(plan.framerate, 30.0);
        assert_eq!(plan.safety_factor, 0.90);
    }

    proptest! {
        #[test]
        fn test_plan_dimensions_even_and_bounded(
            bitrate in 0u64..10_000_000,
            width in 1u32..8_000,
            height in 1u32..5_000,
        ) {
            let plan = plan_resolution(bitrate, width, height, &bands());
            prop_assert!(plan.width % 2 == 0 && plan.height % 2 == 0);
            prop_assert!(plan.width >= 2 && plan.height >= 2);
            prop_assert!(plan.height <= height.max(2));
            if plan.downscaled {
                prop_assert!(plan.height < height);
            }
        }
    }
}
