/// Detector configuration
///
/// Threshold parameters, audio input parameters and the loop timing
/// constants. Everything is validated once at load time and read-only
/// while detection runs.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Default sample rate for the live input
pub const DEFAULT_SAMPLE_RATE: u32 = 44_100;

/// Default block size in samples (~46ms at 44.1kHz)
pub const DEFAULT_BLOCK_SIZE: usize = 2048;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error(
        "silence_threshold ({silence}) must be below clap_threshold ({clap}); \
         clap detection is unreachable otherwise"
    )]
    MisconfiguredThresholds { silence: f32, clap: f32 },

    #[error("min_clap_gap ({min_ms}ms) must be shorter than max_clap_gap ({max_ms}ms)")]
    InvalidGap { min_ms: u64, max_ms: u64 },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Failed to read profile {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse profile: {0}")]
    Parse(#[from] serde_json::Error),
}

/// How the clap classifier decides a frame is loud enough
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ThresholdPolicy {
    /// `peak > clap_threshold`
    Absolute,

    /// `peak > clap_threshold && peak > ambient_noise_level * clap_multiplier`
    Adaptive {
        clap_multiplier: f32,
        ambient_noise_level: f32,
    },
}

impl ThresholdPolicy {
    pub fn is_adaptive(&self) -> bool {
        matches!(self, ThresholdPolicy::Adaptive { .. })
    }
}

/// Tunable detection thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdConfig {
    /// Absolute amplitude floor a frame peak must exceed to count as a clap
    pub clap_threshold: f32,

    /// Amplitude ceiling below which the first clap's tail is considered settled
    pub silence_threshold: f32,

    /// Minimum time between the two claps
    pub min_clap_gap_ms: u64,

    /// Maximum time between the two claps
    pub max_clap_gap_ms: u64,

    #[serde(default = "default_policy")]
    pub policy: ThresholdPolicy,
}

fn default_policy() -> ThresholdPolicy {
    ThresholdPolicy::Absolute
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            clap_threshold: 0.3,
            silence_threshold: 0.05,
            min_clap_gap_ms: 100,
            max_clap_gap_ms: 800,
            policy: ThresholdPolicy::Absolute,
        }
    }
}

impl ThresholdConfig {
    pub fn min_clap_gap(&self) -> Duration {
        Duration::from_millis(self.min_clap_gap_ms)
    }

    pub fn max_clap_gap(&self) -> Duration {
        Duration::from_millis(self.max_clap_gap_ms)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("clap_threshold", self.clap_threshold),
            ("silence_threshold", self.silence_threshold),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::InvalidParameter(format!(
                    "{} must be a non-negative number, got {}",
                    name, value
                )));
            }
        }

        if self.silence_threshold >= self.clap_threshold {
            return Err(ConfigError::MisconfiguredThresholds {
                silence: self.silence_threshold,
                clap: self.clap_threshold,
            });
        }

        if self.min_clap_gap_ms >= self.max_clap_gap_ms {
            return Err(ConfigError::InvalidGap {
                min_ms: self.min_clap_gap_ms,
                max_ms: self.max_clap_gap_ms,
            });
        }

        if let ThresholdPolicy::Adaptive {
            clap_multiplier,
            ambient_noise_level,
        } = self.policy
        {
            if !clap_multiplier.is_finite() || clap_multiplier <= 0.0 {
                return Err(ConfigError::InvalidParameter(format!(
                    "clap_multiplier must be positive, got {}",
                    clap_multiplier
                )));
            }
            if !ambient_noise_level.is_finite() || ambient_noise_level < 0.0 {
                return Err(ConfigError::InvalidParameter(format!(
                    "ambient_noise_level must be non-negative, got {}",
                    ambient_noise_level
                )));
            }
        }

        Ok(())
    }

    /// Load a threshold profile written by calibration
    pub fn load_profile(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: ThresholdConfig = serde_json::from_str(&raw)?;
        config.validate()?;

        info!("Loaded threshold profile from {}", path.display());
        debug!("Profile: {:?}", config);
        Ok(config)
    }

    /// Write this configuration as a JSON profile
    pub fn save_profile(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;

        info!("Saved threshold profile to {}", path.display());
        Ok(())
    }
}

/// Audio input parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioConfig {
    pub sample_rate: u32,

    /// Samples per frame
    pub block_size: usize,

    /// Input device name; `None` selects the host default
    pub device: Option<String>,

    /// Upper bound on a single blocking frame read
    pub read_timeout_ms: u64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            block_size: DEFAULT_BLOCK_SIZE,
            device: None,
            read_timeout_ms: 2000,
        }
    }
}

impl AudioConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_rate == 0 {
            return Err(ConfigError::InvalidParameter(
                "sample_rate must be greater than 0".to_string(),
            ));
        }

        if self.block_size == 0 {
            return Err(ConfigError::InvalidParameter(
                "block_size must be greater than 0".to_string(),
            ));
        }

        if self.read_timeout_ms == 0 {
            return Err(ConfigError::InvalidParameter(
                "read_timeout_ms must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// Full detector configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorConfig {
    pub audio: AudioConfig,
    pub thresholds: ThresholdConfig,

    /// Sleep between polls while waiting for the first clap
    pub idle_poll_ms: u64,

    /// Window of source time after a detected double clap during which
    /// frames are skipped, suppressing re-triggers on the same clap
    pub cooldown_ms: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            audio: AudioConfig::default(),
            thresholds: ThresholdConfig::default(),
            idle_poll_ms: 10,
            cooldown_ms: 500,
        }
    }
}

impl DetectorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.audio.validate()?;
        self.thresholds.validate()
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config_is_valid() {
        assert!(DetectorConfig::default().validate().is_ok());
    }

    #[test]
    fn test_silence_at_or_above_clap_is_rejected() {
        let config = ThresholdConfig {
            silence_threshold: 0.3,
            clap_threshold: 0.3,
            ..Default::default()
        };

        match config.validate() {
            Err(ConfigError::MisconfiguredThresholds { silence, clap }) => {
                assert_eq!(silence, 0.3);
                assert_eq!(clap, 0.3);
            }
            other => panic!("Expected MisconfiguredThresholds, got {:?}", other),
        }
    }

    #[test]
    fn test_gap_bounds_must_be_ordered() {
        let config = ThresholdConfig {
            min_clap_gap_ms: 800,
            max_clap_gap_ms: 800,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidGap { min_ms: 800, max_ms: 800 })
        ));
    }

    #[test]
    fn test_negative_threshold_is_rejected() {
        let config = ThresholdConfig {
            silence_threshold: -0.1,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_adaptive_multiplier_must_be_positive() {
        let mut config = ThresholdConfig {
            policy: ThresholdPolicy::Adaptive {
                clap_multiplier: 0.0,
                ambient_noise_level: 0.01,
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());

        config.policy = ThresholdPolicy::Adaptive {
            clap_multiplier: 3.0,
            ambient_noise_level: 0.01,
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_audio_config_validation() {
        let mut audio = AudioConfig::default();
        assert!(audio.validate().is_ok());

        audio.block_size = 0;
        assert!(audio.validate().is_err());

        audio.block_size = 1024;
        audio.sample_rate = 0;
        assert!(audio.validate().is_err());
    }

    #[test]
    fn test_profile_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("profile.json");

        let config = ThresholdConfig {
            clap_threshold: 0.54,
            silence_threshold: 0.03,
            policy: ThresholdPolicy::Adaptive {
                clap_multiplier: 4.5,
                ambient_noise_level: 0.015,
            },
            ..Default::default()
        };
        config.save_profile(&path).unwrap();

        let loaded = ThresholdConfig::load_profile(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_profile_without_policy_defaults_to_absolute() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("profile.json");
        fs::write(
            &path,
            r#"{"clap_threshold":0.4,"silence_threshold":0.02,"min_clap_gap_ms":120,"max_clap_gap_ms":700}"#,
        )
        .unwrap();

        let loaded = ThresholdConfig::load_profile(&path).unwrap();
        assert_eq!(loaded.policy, ThresholdPolicy::Absolute);
        assert_eq!(loaded.min_clap_gap(), Duration::from_millis(120));
    }

    #[test]
    fn test_invalid_profile_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("profile.json");
        fs::write(
            &path,
            r#"{"clap_threshold":0.02,"silence_threshold":0.4,"min_clap_gap_ms":100,"max_clap_gap_ms":800}"#,
        )
        .unwrap();

        assert!(matches!(
            ThresholdConfig::load_profile(&path),
            Err(ConfigError::MisconfiguredThresholds { .. })
        ));
    }

    #[test]
    fn test_missing_profile_is_io_error() {
        let dir = tempdir().unwrap();
        let result = ThresholdConfig::load_profile(dir.path().join("missing.json"));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }
}
