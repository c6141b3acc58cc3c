/// Calibration engine
///
/// Two timed measurement phases over the live input: ambient noise first,
/// then a clap exercise. The collected peak statistics are turned into
/// recommended thresholds by [`recommend`], a pure function.

use crate::config::{ConfigError, ThresholdConfig, ThresholdPolicy};
use crate::frame_source::{Frame, FrameRead, FrameSource, FrameSourceError};
use crate::level::peak_amplitude;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

#[derive(Error, Debug)]
pub enum CalibrationError {
    #[error("Audio input failed: {0}")]
    FrameRead(#[from] FrameSourceError),

    #[error("Calibration cancelled")]
    Cancelled,

    #[error("No audio captured during the noise phase")]
    NoNoiseData,

    #[error("Recommended thresholds are invalid: {0}")]
    Config(#[from] ConfigError),
}

/// Running min/avg/max over polled frame peaks
#[derive(Debug, Clone, Default)]
pub struct PeakStats {
    min: Option<f32>,
    max: f32,
    sum: f64,
    count: u64,
}

impl PeakStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, peak: f32) {
        self.min = Some(self.min.map_or(peak, |m| m.min(peak)));
        self.max = self.max.max(peak);
        self.sum += peak as f64;
        self.count += 1;
    }

    pub fn min(&self) -> f32 {
        self.min.unwrap_or(0.0)
    }

    pub fn max(&self) -> f32 {
        self.max
    }

    pub fn avg(&self) -> f32 {
        if self.count == 0 {
            0.0
        } else {
            (self.sum / self.count as f64) as f32
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// Ambient noise measured in the first phase
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct NoiseMeasurement {
    pub min: f32,
    pub avg: f32,
    pub max: f32,
    pub polls: u64,
}

impl From<&PeakStats> for NoiseMeasurement {
    fn from(stats: &PeakStats) -> Self {
        Self {
            min: stats.min(),
            avg: stats.avg(),
            max: stats.max(),
            polls: stats.count(),
        }
    }
}

/// Clap exercise results from the second phase
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ExerciseMeasurement {
    pub max_clap_seen: f32,

    /// Polled peaks above the clap threshold in effect during calibration
    pub claps_above_threshold: u32,

    pub polls: u64,
}

/// Accumulates the exercise phase against the current clap threshold
#[derive(Debug, Clone)]
pub struct ExerciseTally {
    clap_threshold: f32,
    stats: PeakStats,
    claps_above_threshold: u32,
}

impl ExerciseTally {
    pub fn new(clap_threshold: f32) -> Self {
        Self {
            clap_threshold,
            stats: PeakStats::new(),
            claps_above_threshold: 0,
        }
    }

    pub fn record(&mut self, peak: f32) {
        self.stats.record(peak);
        if peak > self.clap_threshold {
            self.claps_above_threshold += 1;
            debug!("Clap {} observed: peak={:.3}", self.claps_above_threshold, peak);
        }
    }

    pub fn measurement(&self) -> ExerciseMeasurement {
        ExerciseMeasurement {
            max_clap_seen: self.stats.max(),
            claps_above_threshold: self.claps_above_threshold,
            polls: self.stats.count(),
        }
    }
}

/// Scaling constants for the recommendation
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CalibrationFactors {
    /// K1: recommended clap threshold as a fraction of the loudest clap
    pub clap_fraction: f32,

    /// K2: how far above average noise the silence ceiling sits, in units of (max - avg)
    pub silence_spread: f32,

    /// K3: fraction of the clap-to-noise ratio used as the adaptive multiplier
    pub multiplier_fraction: f32,
}

impl CalibrationFactors {
    pub const ABSOLUTE: Self = Self {
        clap_fraction: 0.7,
        silence_spread: 2.0,
        multiplier_fraction: 0.5,
    };

    pub const ADAPTIVE: Self = Self {
        clap_fraction: 0.6,
        silence_spread: 1.5,
        multiplier_fraction: 0.5,
    };

    pub fn for_policy(policy: &ThresholdPolicy) -> Self {
        if policy.is_adaptive() {
            Self::ADAPTIVE
        } else {
            Self::ABSOLUTE
        }
    }
}

/// Calibration timing
#[derive(Debug, Clone)]
pub struct CalibrationConfig {
    pub noise_duration: Duration,
    pub exercise_duration: Duration,

    /// Minimum source time between two recorded peaks
    pub poll_interval: Duration,

    /// `None` picks the defaults for the configured policy
    pub factors: Option<CalibrationFactors>,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            noise_duration: Duration::from_secs(5),
            exercise_duration: Duration::from_secs(15),
            poll_interval: Duration::from_millis(50),
            factors: None,
        }
    }
}

/// Measurements and recommended thresholds
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalibrationReport {
    pub noise: NoiseMeasurement,
    pub exercise: ExerciseMeasurement,
    pub current_clap_threshold: f32,
    pub recommended_clap_threshold: f32,
    pub recommended_silence_threshold: f32,

    /// Only for the adaptive policy, and only with a nonzero noise floor
    pub recommended_multiplier: Option<f32>,

    pub min_clap_gap_ms: u64,
    pub max_clap_gap_ms: u64,
    adaptive: bool,
}

impl CalibrationReport {
    /// The recommendation as a validated threshold configuration
    pub fn recommended_config(&self) -> Result<ThresholdConfig, ConfigError> {
        let policy = match (self.adaptive, self.recommended_multiplier) {
            (true, Some(clap_multiplier)) => ThresholdPolicy::Adaptive {
                clap_multiplier,
                ambient_noise_level: self.noise.avg,
            },
            _ => ThresholdPolicy::Absolute,
        };

        let config = ThresholdConfig {
            clap_threshold: self.recommended_clap_threshold,
            silence_threshold: self.recommended_silence_threshold,
            min_clap_gap_ms: self.min_clap_gap_ms,
            max_clap_gap_ms: self.max_clap_gap_ms,
            policy,
        };
        config.validate()?;
        Ok(config)
    }
}

impl fmt::Display for CalibrationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Calibration results")?;
        writeln!(
            f,
            "  Ambient noise:        min={:.4} avg={:.4} max={:.4} ({} polls)",
            self.noise.min, self.noise.avg, self.noise.max, self.noise.polls
        )?;
        writeln!(f, "  Max clap seen:        {:.4}", self.exercise.max_clap_seen)?;
        writeln!(
            f,
            "  Claps above {:.3}:    {}",
            self.current_clap_threshold, self.exercise.claps_above_threshold
        )?;
        writeln!(f, "  clap_threshold:       {:.4}", self.recommended_clap_threshold)?;
        write!(f, "  silence_threshold:    {:.4}", self.recommended_silence_threshold)?;
        if let Some(multiplier) = self.recommended_multiplier {
            write!(f, "\n  clap_multiplier:      {:.2}", multiplier)?;
        }
        Ok(())
    }
}

/// Final result of a calibration run
#[derive(Debug, Clone, PartialEq)]
pub enum CalibrationOutcome {
    Recommended(CalibrationReport),

    /// Nothing in the exercise phase stood out from the noise floor
    NoClapsDetected {
        noise: NoiseMeasurement,
        exercise: ExerciseMeasurement,
    },
}

/// Derive recommended thresholds from the two phases
pub fn recommend(
    noise: &NoiseMeasurement,
    exercise: &ExerciseMeasurement,
    current: &ThresholdConfig,
    factors: &CalibrationFactors,
) -> CalibrationOutcome {
    let max_clap = exercise.max_clap_seen;
    if max_clap <= 0.0 || max_clap <= noise.max {
        return CalibrationOutcome::NoClapsDetected {
            noise: *noise,
            exercise: *exercise,
        };
    }

    let adaptive = current.policy.is_adaptive();
    let recommended_multiplier = if adaptive && noise.avg > 0.0 {
        Some(max_clap / noise.avg * factors.multiplier_fraction)
    } else {
        None
    };

    CalibrationOutcome::Recommended(CalibrationReport {
        noise: *noise,
        exercise: *exercise,
        current_clap_threshold: current.clap_threshold,
        recommended_clap_threshold: max_clap * factors.clap_fraction,
        recommended_silence_threshold: noise.avg + (noise.max - noise.avg) * factors.silence_spread,
        recommended_multiplier,
        min_clap_gap_ms: current.min_clap_gap_ms,
        max_clap_gap_ms: current.max_clap_gap_ms,
        adaptive,
    })
}

/// Runs the noise and exercise phases over a frame source
pub struct CalibrationEngine {
    config: CalibrationConfig,
    thresholds: ThresholdConfig,
    factors: CalibrationFactors,
}

impl CalibrationEngine {
    pub fn new(config: CalibrationConfig, thresholds: ThresholdConfig) -> Self {
        let factors = config
            .factors
            .unwrap_or_else(|| CalibrationFactors::for_policy(&thresholds.policy));

        Self {
            config,
            thresholds,
            factors,
        }
    }

    pub fn factors(&self) -> &CalibrationFactors {
        &self.factors
    }

    /// Run both phases and derive the recommendation
    pub fn run<S>(
        &self,
        source: &mut S,
        shutdown: &CancellationToken,
    ) -> Result<CalibrationOutcome, CalibrationError>
    where
        S: FrameSource + ?Sized,
    {
        info!(
            "Measuring ambient noise for {:?}, stay quiet",
            self.config.noise_duration
        );
        let mut noise_stats = PeakStats::new();
        let carry = self.observe(
            source,
            shutdown,
            None,
            self.config.noise_duration,
            |peak| noise_stats.record(peak),
        )?;

        if noise_stats.is_empty() {
            return Err(CalibrationError::NoNoiseData);
        }
        let noise = NoiseMeasurement::from(&noise_stats);
        info!(
            "Ambient noise: min={:.4} avg={:.4} max={:.4}",
            noise.min, noise.avg, noise.max
        );

        info!(
            "Clap several times over the next {:?}",
            self.config.exercise_duration
        );
        let mut tally = ExerciseTally::new(self.thresholds.clap_threshold);
        self.observe(
            source,
            shutdown,
            carry,
            self.config.exercise_duration,
            |peak| tally.record(peak),
        )?;
        let exercise = tally.measurement();

        let outcome = recommend(&noise, &exercise, &self.thresholds, &self.factors);
        match &outcome {
            CalibrationOutcome::Recommended(report) => {
                for line in report.to_string().lines() {
                    info!("{}", line);
                }
            }
            CalibrationOutcome::NoClapsDetected { .. } => {
                warn!(
                    "No claps detected: loudest exercise peak {:.4} vs noise max {:.4}",
                    exercise.max_clap_seen, noise.max
                );
            }
        }

        Ok(outcome)
    }

    /// Poll peaks for `duration` of source time.
    ///
    /// Returns the first frame past the phase boundary so the next phase
    /// starts on it instead of losing it.
    fn observe<S, F>(
        &self,
        source: &mut S,
        shutdown: &CancellationToken,
        carry: Option<Frame>,
        duration: Duration,
        mut on_peak: F,
    ) -> Result<Option<Frame>, CalibrationError>
    where
        S: FrameSource + ?Sized,
        F: FnMut(f32),
    {
        let mut pending = carry;
        let mut started: Option<Duration> = None;
        let mut last_poll: Option<Duration> = None;

        loop {
            if shutdown.is_cancelled() {
                return Err(CalibrationError::Cancelled);
            }

            let frame = match pending.take() {
                Some(frame) => frame,
                None => match source.read_frame()? {
                    FrameRead::Frame(frame) => frame,
                    FrameRead::Overflow => {
                        warn!("Input overflow during calibration, skipping frame");
                        continue;
                    }
                    FrameRead::Exhausted => {
                        warn!(
                            "Audio source exhausted {:?} into a {:?} phase",
                            started
                                .zip(last_poll)
                                .map(|(s, l)| l.saturating_sub(s))
                                .unwrap_or_default(),
                            duration
                        );
                        return Ok(None);
                    }
                },
            };

            let start = *started.get_or_insert(frame.timestamp);
            if frame.timestamp.saturating_sub(start) >= duration {
                return Ok(Some(frame));
            }

            let due = last_poll
                .map(|t| frame.timestamp.saturating_sub(t) >= self.config.poll_interval)
                .unwrap_or(true);
            if due {
                let peak = peak_amplitude(&frame.samples);
                trace!("calibration poll at {:?}: peak={:.4}", frame.timestamp, peak);
                on_peak(peak);
                last_poll = Some(frame.timestamp);
            }
        }
    }
}
