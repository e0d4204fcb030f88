//! Encoder configuration negotiation.
//!
//! Candidates are probed in ladder order and the first one the runtime accepts
//! becomes the active configuration. A probe that errors is treated exactly
//! like one that says "no"; when nothing is accepted the ladder's conservative
//! fallback is used and the run is flagged as degraded.

use serde::Serialize;

use super::planner::RatePlan;
use crate::codec::{BitrateMode, EncoderConfig, EncoderSupport};
use crate::config::LadderConfig;

/// Result of probing a ladder.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Negotiation {
    pub config: EncoderConfig,
    /// No candidate was accepted and the fallback was chosen
    pub degraded: bool,
    /// Probes issued before a decision was reached
    pub attempts: usize,
}

fn candidate(codec: &str, plan: &RatePlan, mode: BitrateMode) -> EncoderConfig {
    EncoderConfig {
        codec: codec.to_string(),
        width: plan.width,
        height: plan.height,
        bitrate: plan.bitrate,
        framerate: plan.framerate,
        bitrate_mode: mode,
    }
}

/// Expands a ladder into concrete configurations, codec-major then mode.
pub fn build_candidates(ladder: &LadderConfig, plan: &RatePlan) -> Vec<EncoderConfig> {
    ladder
        .codecs
        .iter()
        .flat_map(|codec| ladder.modes.iter().map(move |&mode| candidate(codec, plan, mode)))
        .collect()
}

/// Conservative configuration used when every candidate is rejected.
pub fn fallback_config(ladder: &LadderConfig, plan: &RatePlan) -> EncoderConfig {
    candidate(&ladder.fallback_codec, plan, ladder.fallback_mode)
}

/// Picks the first supported candidate, or the fallback.
pub fn negotiate(
    support: &dyn EncoderSupport,
    candidates: Vec<EncoderConfig>,
    fallback: EncoderConfig,
) -> Negotiation {
    let mut attempts = 0;

    for config in candidates {
        attempts += 1;
        match support.probe_support(&config) {
            Ok(true) => {
                tracing::debug!(
                    "Encoder candidate {} ({}) accepted after {} probes",
                    config.codec,
                    config.bitrate_mode,
                    attempts
                );
                return Negotiation {
                    config,
                    degraded: false,
                    attempts,
                };
            }
            Ok(false) => {
                tracing::debug!("Encoder candidate {} ({}) unsupported", config.codec, config.bitrate_mode);
            }
            Err(e) => {
                tracing::debug!(
                    "Support probe for {} ({}) failed, treating as unsupported: {}",
                    config.codec,
                    config.bitrate_mode,
                    e
                );
            }
        }
    }

    tracing::warn!(
        "No encoder candidate accepted after {} probes, falling back to {} ({})",
        attempts,
        fallback.codec,
        fallback.bitrate_mode
    );
    Negotiation {
        config: fallback,
        degraded: true,
        attempts,
    }
}
