/// Double-clap detector
///
/// Sequences per-frame clap decisions into a single "double clap" event.
/// Each cycle runs AwaitingFirstClap -> AwaitingSilenceSettle ->
/// AwaitingSecondClap and ends in either a success or a timeout, after
/// which the detector is back at AwaitingFirstClap with no residual state.
///
/// The settle phase keeps the echo tail of the first clap from being taken
/// for the second one.

use crate::classifier::{ClapClassifier, ClapDecision};
use crate::config::{ConfigError, DetectorConfig};
use crate::frame_source::{FrameRead, FrameSource, FrameSourceError};
use crate::level::peak_amplitude;
use crate::sink::{DoubleClapEvent, EventSink};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Audio input failed: {0}")]
    FrameRead(#[from] FrameSourceError),
}

/// Current phase of a detection cycle
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DetectionPhase {
    AwaitingFirstClap,

    /// First clap seen; waiting for its tail to drop below the silence ceiling
    AwaitingSilenceSettle {
        first_clap_at: Duration,
        first_peak: f32,
    },

    AwaitingSecondClap {
        first_clap_at: Duration,
        first_peak: f32,
    },
}

/// How a detection cycle ended
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Success(DoubleClapEvent),

    /// No second clap within `max_clap_gap`
    Timeout { elapsed: Duration },
}

/// Detector statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetectorStats {
    pub frames_processed: u64,
    pub overflows: u64,

    /// Frames skipped inside the post-detection cooldown
    pub suppressed_frames: u64,

    pub double_claps: u64,
    pub timeouts: u64,

    /// Samples the source lost before they reached the detector
    pub dropped_samples: u64,
}

/// Double-clap state machine plus the frame loop that drives it
pub struct DoubleClapDetector {
    classifier: ClapClassifier,
    min_gap: Duration,
    max_gap: Duration,
    idle_poll: Duration,
    cooldown: Duration,
    phase: DetectionPhase,
}

impl DoubleClapDetector {
    /// Create a detector from a validated configuration
    pub fn new(config: &DetectorConfig) -> Result<Self, DetectorError> {
        config.validate()?;

        let thresholds = &config.thresholds;
        info!(
            "Double-clap detector: clap>{} silence<{} gap={}..{}ms policy={:?}",
            thresholds.clap_threshold,
            thresholds.silence_threshold,
            thresholds.min_clap_gap_ms,
            thresholds.max_clap_gap_ms,
            thresholds.policy
        );

        Ok(Self {
            classifier: ClapClassifier::new(thresholds.clone()),
            min_gap: thresholds.min_clap_gap(),
            max_gap: thresholds.max_clap_gap(),
            idle_poll: config.idle_poll(),
            cooldown: config.cooldown(),
            phase: DetectionPhase::AwaitingFirstClap,
        })
    }

    pub fn phase(&self) -> DetectionPhase {
        self.phase
    }

    /// Abandon the current cycle
    pub fn reset(&mut self) {
        if self.phase != DetectionPhase::AwaitingFirstClap {
            debug!("Detector reset from {:?}", self.phase);
        }
        self.phase = DetectionPhase::AwaitingFirstClap;
    }

    /// Advance the state machine by one frame.
    ///
    /// `timestamp` is the frame's source time. Returns the outcome when this
    /// frame completes a cycle.
    pub fn process(&mut self, peak: f32, timestamp: Duration) -> Option<CycleOutcome> {
        match self.phase {
            DetectionPhase::AwaitingFirstClap => {
                if self.classifier.is_clap(peak) {
                    debug!("First clap: peak={:.3} at {:?}", peak, timestamp);
                    self.phase = DetectionPhase::AwaitingSilenceSettle {
                        first_clap_at: timestamp,
                        first_peak: peak,
                    };
                }
                None
            }

            DetectionPhase::AwaitingSilenceSettle {
                first_clap_at,
                first_peak,
            } => {
                let elapsed = timestamp.saturating_sub(first_clap_at);
                let settled = self.classifier.is_settled(peak);

                if settled || elapsed > self.min_gap {
                    debug!(
                        "Settled after {}ms (peak={:.3}, below silence: {})",
                        elapsed.as_millis(),
                        peak,
                        settled
                    );
                    self.phase = DetectionPhase::AwaitingSecondClap {
                        first_clap_at,
                        first_peak,
                    };

                    // a frame loud enough to miss the silence ceiling may be the second clap
                    if !settled {
                        return self.process(peak, timestamp);
                    }
                }
                None
            }

            DetectionPhase::AwaitingSecondClap {
                first_clap_at,
                first_peak,
            } => {
                let elapsed = timestamp.saturating_sub(first_clap_at);

                // deadline is checked before the clap: a late clap is a timeout
                if elapsed > self.max_gap {
                    debug!("No second clap within {}ms", elapsed.as_millis());
                    self.phase = DetectionPhase::AwaitingFirstClap;
                    return Some(CycleOutcome::Timeout { elapsed });
                }

                match self.classifier.classify(peak) {
                    ClapDecision::Clap if elapsed <= self.min_gap => {
                        debug!(
                            "Ignoring clap {}ms after the first (min gap {}ms)",
                            elapsed.as_millis(),
                            self.min_gap.as_millis()
                        );
                        None
                    }
                    ClapDecision::Clap => {
                        debug!("Second clap: peak={:.3}, gap={}ms", peak, elapsed.as_millis());
                        self.phase = DetectionPhase::AwaitingFirstClap;
                        Some(CycleOutcome::Success(DoubleClapEvent {
                            timestamp,
                            gap: elapsed,
                            first_peak,
                            second_peak: peak,
                        }))
                    }
                    ClapDecision::BelowRelative => {
                        trace!("Peak {:.3} below ambient-relative threshold", peak);
                        None
                    }
                    ClapDecision::BelowAbsolute => None,
                }
            }
        }
    }

    /// Pull frames from `source` until it is exhausted, fails, or `shutdown`
    /// is cancelled.
    ///
    /// Shutdown is only observed between frames. Overflowed reads skip the
    /// tick without touching the state machine; any other read failure
    /// aborts the current cycle and is returned.
    pub fn run<S, E>(
        &mut self,
        source: &mut S,
        sink: &mut E,
        shutdown: &CancellationToken,
    ) -> Result<DetectorStats, DetectorError>
    where
        S: FrameSource + ?Sized,
        E: EventSink + ?Sized,
    {
        let mut stats = DetectorStats::default();
        let mut cooldown_until: Option<Duration> = None;

        info!("Listening for double claps");

        loop {
            if shutdown.is_cancelled() {
                info!("Shutdown requested, stopping detector");
                break;
            }

            let frame = match source.read_frame() {
                Ok(FrameRead::Frame(frame)) => frame,
                Ok(FrameRead::Overflow) => {
                    stats.overflows += 1;
                    warn!("Input overflow, skipping frame ({} total)", stats.overflows);
                    continue;
                }
                Ok(FrameRead::Exhausted) => {
                    info!("Audio source exhausted");
                    break;
                }
                Err(e) => {
                    error!("Frame read failed in {:?}: {}", self.phase, e);
                    self.reset();
                    return Err(e.into());
                }
            };

            if let Some(until) = cooldown_until {
                if frame.timestamp < until {
                    stats.suppressed_frames += 1;
                    continue;
                }
                cooldown_until = None;
            }

            stats.frames_processed += 1;
            let peak = peak_amplitude(&frame.samples);
            trace!("frame at {:?}: peak={:.4}", frame.timestamp, peak);

            match self.process(peak, frame.timestamp) {
                Some(CycleOutcome::Success(event)) => {
                    stats.double_claps += 1;
                    info!(
                        "Double clap detected (gap {}ms, peaks {:.3}/{:.3})",
                        event.gap.as_millis(),
                        event.first_peak,
                        event.second_peak
                    );
                    sink.on_double_clap_detected(&event);
                    cooldown_until = Some(frame.timestamp + self.cooldown);
                }
                Some(CycleOutcome::Timeout { elapsed }) => {
                    stats.timeouts += 1;
                    debug!("Cycle timed out after {}ms", elapsed.as_millis());
                }
                None => {
                    if self.phase == DetectionPhase::AwaitingFirstClap && !self.idle_poll.is_zero() {
                        thread::sleep(self.idle_poll);
                    }
                }
            }

            if stats.frames_processed % 1000 == 0 {
                debug!(
                    "Processed {} frames, {} double claps, {} timeouts",
                    stats.frames_processed, stats.double_claps, stats.timeouts
                );
            }
        }

        stats.dropped_samples = source.dropped_samples();
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ThresholdConfig, ThresholdPolicy};
    use crate::frame_source::{Frame, ReplaySource};
    use crate::sink::MockEventSink;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    fn test_config() -> DetectorConfig {
        DetectorConfig {
            thresholds: ThresholdConfig {
                clap_threshold: 0.3,
                silence_threshold: 0.05,
                min_clap_gap_ms: 100,
                max_clap_gap_ms: 800,
                policy: ThresholdPolicy::Absolute,
            },
            idle_poll_ms: 0,
            cooldown_ms: 0,
            ..Default::default()
        }
    }

    fn detector() -> DoubleClapDetector {
        DoubleClapDetector::new(&test_config()).unwrap()
    }

    /// Feed `(peak, ms)` pairs and collect every outcome
    fn feed(detector: &mut DoubleClapDetector, frames: &[(f32, u64)]) -> Vec<CycleOutcome> {
        frames
            .iter()
            .filter_map(|&(peak, at)| detector.process(peak, ms(at)))
            .collect()
    }

    fn source_from(frames: &[(f32, u64)]) -> ReplaySource {
        let mut source = ReplaySource::new();
        for &(peak, at) in frames {
            source.push_frame(Frame::new(vec![0.0, peak, -peak / 2.0], ms(at)));
        }
        source
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = test_config();
        config.thresholds.silence_threshold = 0.5;
        assert!(matches!(
            DoubleClapDetector::new(&config),
            Err(DetectorError::Config(ConfigError::MisconfiguredThresholds { .. }))
        ));
    }

    #[test]
    fn test_phase_transitions() {
        let mut det = detector();
        assert_eq!(det.phase(), DetectionPhase::AwaitingFirstClap);

        det.process(0.9, ms(0));
        assert!(matches!(det.phase(), DetectionPhase::AwaitingSilenceSettle { .. }));

        // echo tail above the silence ceiling keeps us settling
        det.process(0.2, ms(40));
        assert!(matches!(det.phase(), DetectionPhase::AwaitingSilenceSettle { .. }));

        det.process(0.01, ms(80));
        assert!(matches!(det.phase(), DetectionPhase::AwaitingSecondClap { .. }));

        let outcome = det.process(0.8, ms(300));
        assert!(matches!(outcome, Some(CycleOutcome::Success(_))));
        assert_eq!(det.phase(), DetectionPhase::AwaitingFirstClap);
    }

    #[test]
    fn test_reference_sequence_yields_one_success() {
        let mut det = detector();
        let outcomes = feed(
            &mut det,
            &[(0.01, 0), (0.9, 100), (0.02, 200), (0.01, 300), (0.85, 400)],
        );

        assert_eq!(outcomes.len(), 1);
        match &outcomes[0] {
            CycleOutcome::Success(event) => {
                assert_eq!(event.gap, ms(300));
                assert_eq!(event.first_peak, 0.9);
                assert_eq!(event.second_peak, 0.85);
                assert_eq!(event.timestamp, ms(400));
            }
            other => panic!("Expected success, got {:?}", other),
        }
    }

    #[test]
    fn test_settle_falls_back_to_elapsed_time() {
        let mut det = detector();
        det.process(0.9, ms(0));

        // continuous noise never drops below the silence ceiling
        det.process(0.2, ms(50));
        det.process(0.2, ms(100));
        assert!(matches!(det.phase(), DetectionPhase::AwaitingSilenceSettle { .. }));

        det.process(0.2, ms(101));
        assert!(matches!(det.phase(), DetectionPhase::AwaitingSecondClap { .. }));
    }

    #[test]
    fn test_clap_on_elapsed_settle_frame_is_classified() {
        let mut det = detector();
        let outcomes = feed(
            &mut det,
            &[
                (0.9, 480),
                (0.1, 512),
                (0.1, 544),
                (0.1, 576),
                (0.9, 608),
                (0.1, 640),
                (0.1, 1300),
            ],
        );

        match outcomes.as_slice() {
            [CycleOutcome::Success(event)] => {
                assert_eq!(event.gap, ms(128));
                assert_eq!(event.timestamp, ms(608));
            }
            other => panic!("Expected one success, got {:?}", other),
        }
        assert_eq!(det.phase(), DetectionPhase::AwaitingFirstClap);
    }

    #[test]
    fn test_elapsed_settle_after_stall_times_out() {
        let mut det = detector();
        det.process(0.9, ms(0));

        let outcome = det.process(0.9, ms(900));
        assert_eq!(outcome, Some(CycleOutcome::Timeout { elapsed: ms(900) }));
        assert_eq!(det.phase(), DetectionPhase::AwaitingFirstClap);
    }

    #[test]
    fn test_clap_within_min_gap_is_ignored() {
        let mut det = detector();
        let outcomes = feed(&mut det, &[(0.9, 0), (0.01, 20), (0.9, 60), (0.01, 120)]);

        assert!(outcomes.is_empty());
        assert!(matches!(det.phase(), DetectionPhase::AwaitingSecondClap { .. }));
    }

    #[test]
    fn test_second_clap_exactly_at_max_gap_succeeds() {
        let mut det = detector();
        let outcomes = feed(&mut det, &[(0.9, 0), (0.01, 50), (0.9, 800)]);
        assert!(matches!(outcomes.as_slice(), [CycleOutcome::Success(_)]));
    }

    #[test]
    fn test_deadline_wins_over_late_clap() {
        let mut det = detector();
        let outcomes = feed(&mut det, &[(0.9, 0), (0.01, 50), (0.9, 801)]);

        assert_eq!(outcomes, vec![CycleOutcome::Timeout { elapsed: ms(801) }]);
        assert_eq!(det.phase(), DetectionPhase::AwaitingFirstClap);
    }

    #[test]
    fn test_timeout_frame_does_not_start_new_cycle() {
        let mut det = detector();
        feed(&mut det, &[(0.9, 0), (0.01, 50), (0.9, 900)]);

        // the late clap was consumed by the timeout, not taken as a first clap
        assert_eq!(det.phase(), DetectionPhase::AwaitingFirstClap);
    }

    #[test]
    fn test_cycles_are_independent() {
        let first = [(0.9, 0), (0.01, 100), (0.8, 400)];
        let second = [(0.9, 1000), (0.01, 1100), (0.8, 1400)];

        let mut det = detector();
        let a = feed(&mut det, &first);
        let b = feed(&mut det, &second);

        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
        match (&a[0], &b[0]) {
            (CycleOutcome::Success(x), CycleOutcome::Success(y)) => assert_eq!(x.gap, y.gap),
            other => panic!("Expected two successes, got {:?}", other),
        }

        let timeout_first = [(0.9, 2000), (0.01, 2100), (0.01, 2900)];
        let timeout_second = [(0.9, 4000), (0.01, 4100), (0.01, 4900)];
        assert_eq!(feed(&mut det, &timeout_first), feed(&mut det, &timeout_second));
    }

    #[test]
    fn test_adaptive_policy_rejects_claps_in_noisy_room() {
        let mut config = test_config();
        config.thresholds.policy = ThresholdPolicy::Adaptive {
            clap_multiplier: 3.0,
            ambient_noise_level: 0.2,
        };
        let mut det = DoubleClapDetector::new(&config).unwrap();

        det.process(0.5, ms(0));
        assert_eq!(det.phase(), DetectionPhase::AwaitingFirstClap);

        det.process(0.7, ms(10));
        assert!(matches!(det.phase(), DetectionPhase::AwaitingSilenceSettle { .. }));
    }

    #[test]
    fn test_run_notifies_sink_once() {
        let mut det = detector();
        let mut source =
            source_from(&[(0.01, 0), (0.9, 100), (0.02, 200), (0.01, 300), (0.85, 400)]);

        let mut sink = MockEventSink::new();
        sink.expect_on_double_clap_detected()
            .withf(|event| event.gap == Duration::from_millis(300))
            .times(1)
            .return_const(());

        let stats = det
            .run(&mut source, &mut sink, &CancellationToken::new())
            .unwrap();

        assert_eq!(stats.frames_processed, 5);
        assert_eq!(stats.double_claps, 1);
        assert_eq!(stats.timeouts, 0);
    }

    #[test]
    fn test_overflow_skips_tick_without_state_change() {
        let mut det = detector();
        let mut source = ReplaySource::new();
        source
            .push_frame(Frame::new(vec![0.9], ms(0)))
            .push_overflow()
            .push_overflow()
            .push_frame(Frame::new(vec![0.01], ms(150)))
            .push_frame(Frame::new(vec![0.8], ms(400)));

        let mut sink = MockEventSink::new();
        sink.expect_on_double_clap_detected().times(1).return_const(());

        let stats = det
            .run(&mut source, &mut sink, &CancellationToken::new())
            .unwrap();

        assert_eq!(stats.overflows, 2);
        assert_eq!(stats.frames_processed, 3);
        assert_eq!(stats.double_claps, 1);
    }

    #[test]
    fn test_read_error_aborts_cycle() {
        let mut det = detector();
        let mut source = ReplaySource::new();
        source
            .push_frame(Frame::new(vec![0.9], ms(0)))
            .push_error("device removed")
            .push_frame(Frame::new(vec![0.9], ms(300)));

        let mut sink = MockEventSink::new();
        sink.expect_on_double_clap_detected().times(0);

        let result = det.run(&mut source, &mut sink, &CancellationToken::new());

        assert!(matches!(
            result,
            Err(DetectorError::FrameRead(FrameSourceError::Read(_)))
        ));
        assert_eq!(det.phase(), DetectionPhase::AwaitingFirstClap);
        assert_eq!(source.remaining(), 1);
    }

    /// Replay source that reports a fixed number of lost samples
    struct LossySource {
        inner: ReplaySource,
        dropped: u64,
    }

    impl FrameSource for LossySource {
        fn read_frame(&mut self) -> Result<FrameRead, FrameSourceError> {
            self.inner.read_frame()
        }

        fn dropped_samples(&self) -> u64 {
            self.dropped
        }
    }

    #[test]
    fn test_run_reports_dropped_samples() {
        let mut det = detector();
        let mut source = LossySource {
            inner: source_from(&[(0.01, 0), (0.01, 32)]),
            dropped: 1024,
        };
        let mut sink = MockEventSink::new();
        sink.expect_on_double_clap_detected().never();

        let stats = det
            .run(&mut source, &mut sink, &CancellationToken::new())
            .unwrap();

        assert_eq!(stats.frames_processed, 2);
        assert_eq!(stats.dropped_samples, 1024);
    }

    #[test]
    fn test_replay_source_is_lossless() {
        let mut det = detector();
        let mut source: Box<dyn FrameSource> = Box::new(source_from(&[(0.01, 0)]));
        let mut sink = MockEventSink::new();

        let stats = det
            .run(&mut source, &mut sink, &CancellationToken::new())
            .unwrap();
        assert_eq!(stats.dropped_samples, 0);
    }

    #[test]
    fn test_cancelled_token_stops_before_reading() {
        let mut det = detector();
        let mut source = source_from(&[(0.9, 0)]);
        let mut sink = MockEventSink::new();

        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let stats = det.run(&mut source, &mut sink, &shutdown).unwrap();
        assert_eq!(stats.frames_processed, 0);
        assert_eq!(source.remaining(), 1);
    }

    #[test]
    fn test_cooldown_suppresses_retrigger() {
        let mut config = test_config();
        config.cooldown_ms = 500;
        let mut det = DoubleClapDetector::new(&config).unwrap();

        // a third clap right after the detection would otherwise open a new cycle
        let mut source = source_from(&[
            (0.9, 0),
            (0.01, 100),
            (0.9, 300),
            (0.9, 400),
            (0.01, 600),
            (0.01, 800),
        ]);

        let mut sink = MockEventSink::new();
        sink.expect_on_double_clap_detected().times(1).return_const(());

        let stats = det
            .run(&mut source, &mut sink, &CancellationToken::new())
            .unwrap();

        assert_eq!(stats.suppressed_frames, 2);
        assert_eq!(det.phase(), DetectionPhase::AwaitingFirstClap);
    }
}
