//! Centralized configuration for Clipfit.
//!
//! Every tunable constant of the transcode pipeline lives here: the rate
//! estimator's safety factor and floor, the downscaling bands, the queue depth
//! that bounds in-flight codec work, and the encoder negotiation ladders.

use crate::codec::BitrateMode;
use crate::media::OutputFormat;

/// Invalid configuration values detected by [`ClipfitConfig::validate`].
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Pipeline tunables, one section per stage of a run.
#[derive(Debug, Clone, Default)]
pub struct ClipfitConfig {
    pub rate: RateConfig,
    pub resolution: ResolutionConfig,
    pub pipeline: PipelineConfig,
    pub negotiation: NegotiationConfig,
}

/// Bitrate estimation parameters.
#[derive(Debug, Clone)]
pub struct RateConfig {
    /// Overrides the per-format safety factor when set
    pub safety_factor: Option<f64>,
    /// Lower bound applied to the computed bitrate
    pub min_bitrate_bps: u64,
    /// Framerate used when the source gives no usable timing
    pub default_framerate: f64,
    /// Upper clamp for the derived framerate
    pub max_framerate: f64,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            safety_factor: None,
            min_bitrate_bps: 50_000,
            default_framerate: 30.0,
            max_framerate: 120.0,
        }
    }
}

impl RateConfig {
    /// Safety factor for the given output format, honoring the override.
    pub fn safety_factor_for(&self, format: OutputFormat) -> f64 {
        self.safety_factor
            .unwrap_or_else(|| format.default_safety_factor())
    }
}

/// One downscaling band: bitrates strictly below `max_bitrate_bps` are
/// limited to `target_height` lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolutionBand {
    pub max_bitrate_bps: u64,
    pub target_height: u32,
}

/// Resolution planning bands, ordered by ascending bitrate ceiling.
#[derive(Debug, Clone)]
pub struct ResolutionConfig {
    pub bands: Vec<ResolutionBand>,
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            bands: vec![
                ResolutionBand {
                    max_bitrate_bps: 1_000_000,
                    target_height: 480,
                },
                ResolutionBand {
                    max_bitrate_bps: 2_500_000,
                    target_height: 720,
                },
            ],
        }
    }
}

/// Streaming pipeline limits.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Maximum pending items per codec stage
    pub queue_depth_limit: usize,
    /// Emit progress every N encoded chunks
    pub progress_granularity: u64,
    /// Thread count handed to codec backends that support it
    pub codec_threads: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_depth_limit: 10,
            progress_granularity: 10,
            codec_threads: num_cpus::get().clamp(1, 8),
        }
    }
}

/// A prioritized list of encoder candidates plus the conservative fallback.
#[derive(Debug, Clone)]
pub struct LadderConfig {
    /// Codec strings in priority order
    pub codecs: Vec<String>,
    /// Rate-control modes tried for each codec, in order
    pub modes: Vec<BitrateMode>,
    pub fallback_codec: String,
    pub fallback_mode: BitrateMode,
}

/// Encoder negotiation ladders per output format.
#[derive(Debug, Clone)]
pub struct NegotiationConfig {
    pub mp4: LadderConfig,
    pub webm: LadderConfig,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            mp4: LadderConfig {
                codecs: vec![
                    "avc1.64002a".to_string(), // High 4.2
                    "avc1.4d002a".to_string(), // Main 4.2
                    "avc1.42002a".to_string(), // Baseline 4.2
                    "avc1.640033".to_string(), // High 5.1
                ],
                modes: vec![BitrateMode::Constant, BitrateMode::Variable],
                fallback_codec: "avc1.42002a".to_string(),
                fallback_mode: BitrateMode::Variable,
            },
            webm: LadderConfig {
                codecs: vec!["vp09.00.10.08".to_string()],
                modes: vec![BitrateMode::Constant],
                fallback_codec: "vp09.00.10.08".to_string(),
                fallback_mode: BitrateMode::Constant,
            },
        }
    }
}

impl NegotiationConfig {
    /// Ladder used for the given output format.
    pub fn ladder(&self, format: OutputFormat) -> &LadderConfig {
        match format {
            OutputFormat::Mp4 => &self.mp4,
            OutputFormat::WebM => &self.webm,
        }
    }
}

impl ClipfitConfig {
    /// Defaults overridden by `CLIPFIT_*` environment variables.
    ///
    /// Unparseable values are ignored and the default is kept. Call
    /// [`validate`](Self::validate) afterwards to reject out-of-range values.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(factor) = env_parse::<f64>("CLIPFIT_SAFETY_FACTOR") {
            config.rate.safety_factor = Some(factor);
        }

        if let Some(floor) = env_parse::<u64>("CLIPFIT_MIN_BITRATE") {
            config.rate.min_bitrate_bps = floor;
        }

        if let Some(depth) = env_parse::<usize>("CLIPFIT_QUEUE_DEPTH") {
            config.pipeline.queue_depth_limit = depth;
        }

        if let Some(granularity) = env_parse::<u64>("CLIPFIT_PROGRESS_GRANULARITY") {
            config.pipeline.progress_granularity = granularity;
        }

        if let Some(threads) = env_parse::<usize>("CLIPFIT_CODEC_THREADS") {
            config.pipeline.codec_threads = threads;
        }

        if let Ok(ladder) = std::env::var("CLIPFIT_AVC_LADDER") {
            let codecs: Vec<String> = ladder
                .split(',')
                .map(str::trim)
                .filter(|codec| !codec.is_empty())
                .map(str::to_string)
                .collect();
            if !codecs.is_empty() {
                config.negotiation.mp4.codecs = codecs;
            }
        }

        config
    }

    /// Keeps the documented rate constants but shrinks the queues so that
    /// backpressure is exercised with short synthetic inputs.
    pub fn for_testing() -> Self {
        Self {
            pipeline: PipelineConfig {
                queue_depth_limit: 4,
                progress_granularity: 10,
                codec_threads: 1,
            },
            ..Default::default()
        }
    }

    /// Checks that every value is in range.
    ///
    /// # Errors
    ///
    /// - `ConfigError::InvalidValue` - Safety factor outside (0, 1), zero queue
    ///   depth or granularity, or empty/unsorted resolution bands
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(factor) = self.rate.safety_factor {
            if !(factor > 0.0 && factor < 1.0) {
                return Err(invalid(
                    "rate.safety_factor",
                    format!("{factor} is outside (0, 1)"),
                ));
            }
        }

        if self.rate.default_framerate <= 0.0 || self.rate.max_framerate < 1.0 {
            return Err(invalid("rate.framerate", "framerates must be positive".to_string()));
        }

        if self.pipeline.queue_depth_limit == 0 {
            return Err(invalid("pipeline.queue_depth_limit", "must be at least 1".to_string()));
        }

        if self.pipeline.progress_granularity == 0 {
            return Err(invalid(
                "pipeline.progress_granularity",
                "must be at least 1".to_string(),
            ));
        }

        if self.resolution.bands.is_empty() {
            return Err(invalid("resolution.bands", "at least one band is required".to_string()));
        }

        for pair in self.resolution.bands.windows(2) {
            if pair[0].max_bitrate_bps >= pair[1].max_bitrate_bps {
                return Err(invalid(
                    "resolution.bands",
                    "bitrate ceilings must be strictly ascending".to_string(),
                ));
            }
        }

        if let Some(band) = self.resolution.bands.iter().find(|band| band.target_height < 2) {
            return Err(invalid(
                "resolution.bands",
                format!("target height {} is below 2", band.target_height),
            ));
        }

        let ladders = [
            ("negotiation.mp4", &self.negotiation.mp4),
            ("negotiation.webm", &self.negotiation.webm),
        ];
        for (name, ladder) in ladders {
            if ladder.modes.is_empty() {
                return Err(invalid(
                    name,
                    "at least one rate-control mode is required".to_string(),
                ));
            }
        }

        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.trim().parse().ok()
}

fn invalid(field: &'static str, reason: String) -> ConfigError {
    ConfigError::InvalidValue { field, reason }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = ClipfitConfig::default();

        assert_eq!(config.rate.min_bitrate_bps, 50_000);
        assert_eq!(config.rate.safety_factor, None);
        assert_eq!(config.pipeline.queue_depth_limit, 10);
        assert_eq!(config.pipeline.progress_granularity, 10);
        assert!(config.pipeline.codec_threads >= 1);
        assert_eq!(config.resolution.bands.len(), 2);
        assert_eq!(config.negotiation.mp4.codecs[0], "avc1.64002a");
        assert_eq!(config.negotiation.mp4.fallback_codec, "avc1.42002a");
        assert_eq!(config.negotiation.mp4.fallback_mode, BitrateMode::Variable);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_safety_factor_per_format() {
        let mut rate = RateConfig::default();
        assert_eq!(rate.safety_factor_for(OutputFormat::Mp4), 0.90);
        assert_eq!(rate.safety_factor_for(OutputFormat::WebM), 0.98);

        rate.safety_factor = Some(0.5);
        assert_eq!(rate.safety_factor_for(OutputFormat::WebM), 0.5);
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let mut config = ClipfitConfig::default();
        config.rate.safety_factor = Some(1.5);
        assert!(config.validate().is_err());

        let mut config = ClipfitConfig::default();
        config.pipeline.queue_depth_limit = 0;
        assert!(config.validate().is_err());

        let mut config = ClipfitConfig::default();
        config.pipeline.progress_granularity = 0;
        assert!(config.validate().is_err());

        let mut config = ClipfitConfig::default();
        config.resolution.bands.reverse();
        assert!(config.validate().is_err());

        let mut config = ClipfitConfig::default();
        config.resolution.bands.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_testing_preset() {
        let config = ClipfitConfig::for_testing();
        assert_eq!(config.pipeline.queue_depth_limit, 4);
        assert_eq!(config.pipeline.codec_threads, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_override() {
        unsafe {
            std::env::set_var("CLIPFIT_SAFETY_FACTOR", "0.8");
            std::env::set_var("CLIPFIT_MIN_BITRATE", "64000");
            std::env::set_var("CLIPFIT_QUEUE_DEPTH", "3");
            std::env::set_var("CLIPFIT_PROGRESS_GRANULARITY", "5");
            std::env::set_var("CLIPFIT_AVC_LADDER", "avc1.42002a, avc1.4d002a");
        }

        let config = ClipfitConfig::from_env();

        assert_eq!(config.rate.safety_factor, Some(0.8));
        assert_eq!(config.rate.min_bitrate_bps, 64_000);
        assert_eq!(config.pipeline.queue_depth_limit, 3);
        assert_eq!(config.pipeline.progress_granularity, 5);
        assert_eq!(config.negotiation.mp4.codecs, vec!["avc1.42002a", "avc1.4d002a"]);

        // Cleanup
        unsafe {
            std::env::remove_var("CLIPFIT_SAFETY_FACTOR");
            std::env::remove_var("CLIPFIT_MIN_BITRATE");
            std::env::remove_var("CLIPFIT_QUEUE_DEPTH");
            std::env::remove_var("CLIPFIT_PROGRESS_GRANULARITY");
            std::env::remove_var("CLIPFIT_AVC_LADDER");
        }
    }
}
