/// Frame level estimation
///
/// Reduces a block of normalized samples to the single scalar the rest of
/// the detector works with: the peak absolute amplitude.

use std::time::Duration;

/// Maximum absolute sample amplitude in a frame.
///
/// Empty frames yield 0.0. NaN samples are skipped so a corrupt sample can
/// never poison the threshold comparisons downstream.
pub fn peak_amplitude(samples: &[f32]) -> f32 {
    samples
        .iter()
        .map(|s| s.abs())
        .filter(|s| !s.is_nan())
        .fold(0.0_f32, f32::max)
}

/// Wall-clock duration covered by one block of `block_size` samples
pub fn frame_duration(block_size: usize, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(block_size as f64 / sample_rate as f64)
}

/// Source time of the sample at `position` in a stream running at `sample_rate`
pub fn sample_position(position: u64, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(position as f64 / sample_rate as f64)
}
