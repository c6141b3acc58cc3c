/// Double-clap detector library
///
/// This library turns a live stream of audio frames into "double clap"
/// trigger events using a time-domain peak detector, and provides a
/// calibration procedure for deriving thresholds from the room.

pub mod audio_buffer;
pub mod calibration;
pub mod capture;
pub mod classifier;
pub mod config;
pub mod detector;
pub mod frame_source;
pub mod level;
pub mod sink;

// Re-export main types
pub use audio_buffer::{AudioBuffer, AudioBufferError, BufferReader, BufferWriter};
pub use calibration::{
    recommend, CalibrationConfig, CalibrationEngine, CalibrationError, CalibrationFactors,
    CalibrationOutcome, CalibrationReport, ExerciseMeasurement, NoiseMeasurement, PeakStats,
};
pub use capture::MicrophoneSource;
pub use classifier::{classify, is_clap, ClapClassifier, ClapDecision};
pub use config::{AudioConfig, ConfigError, DetectorConfig, ThresholdConfig, ThresholdPolicy};
pub use detector::{CycleOutcome, DetectionPhase, DetectorError, DetectorStats, DoubleClapDetector};
pub use frame_source::{Frame, FrameRead, FrameSource, FrameSourceError, ReplaySource, WavSource};
pub use level::{frame_duration, peak_amplitude, sample_position};
pub use sink::{ChannelSink, DoubleClapEvent, EventSink};
