/// Clap classifier
///
/// Decides from a single frame peak whether the frame is a clap impulse.
/// Two policies: absolute-only, and absolute-and-relative where the peak
/// must also stand out from the measured ambient noise by a multiplier.

use crate::config::{ThresholdConfig, ThresholdPolicy};
use tracing::trace;

/// Outcome of classifying one frame peak
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClapDecision {
    Clap,

    /// Peak did not exceed `clap_threshold`
    BelowAbsolute,

    /// Peak exceeded `clap_threshold` but not `ambient_noise_level * clap_multiplier`
    BelowRelative,
}

impl ClapDecision {
    pub fn is_clap(self) -> bool {
        self == ClapDecision::Clap
    }
}

/// Classify a peak against a threshold configuration
pub fn classify(peak: f32, config: &ThresholdConfig) -> ClapDecision {
    if !(peak > config.clap_threshold) {
        return ClapDecision::BelowAbsolute;
    }

    match config.policy {
        ThresholdPolicy::Absolute => ClapDecision::Clap,
        ThresholdPolicy::Adaptive {
            clap_multiplier,
            ambient_noise_level,
        } => {
            if peak > ambient_noise_level * clap_multiplier {
                ClapDecision::Clap
            } else {
                ClapDecision::BelowRelative
            }
        }
    }
}

pub fn is_clap(peak: f32, config: &ThresholdConfig) -> bool {
    classify(peak, config).is_clap()
}

/// Classifier bound to one configuration
#[derive(Debug, Clone)]
pub struct ClapClassifier {
    config: ThresholdConfig,
}

impl ClapClassifier {
    pub fn new(config: ThresholdConfig) -> Self {
        Self { config }
    }

    pub fn classify(&self, peak: f32) -> ClapDecision {
        let decision = classify(peak, &self.config);
        trace!("peak={:.4} -> {:?}", peak, decision);
        decision
    }

    pub fn is_clap(&self, peak: f32) -> bool {
        self.classify(peak).is_clap()
    }

    /// Whether the signal has dropped below the silence ceiling
    pub fn is_settled(&self, peak: f32) -> bool {
        peak < self.config.silence_threshold
    }
}
