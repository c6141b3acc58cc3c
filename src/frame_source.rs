/// Frame source boundary
///
/// The detector pulls fixed-size blocks of mono f32 samples, one per tick,
/// through the [`FrameSource`] trait. Live capture lives in
/// [`crate::capture`]; this module holds the shared types plus replay
/// sources for recorded audio.

use crate::level::frame_duration;
use hound::{SampleFormat, WavReader};
use std::collections::VecDeque;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum FrameSourceError {
    #[error("Audio input unavailable: {0}")]
    InputUnavailable(String),

    #[error("Frame read failed: {0}")]
    Read(String),

    #[error("No audio frame within {0:?}")]
    Timeout(Duration),
}

/// One block of mono samples normalized to roughly [-1.0, 1.0]
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub samples: Vec<f32>,

    /// Source time of the block's first sample, counted from the start of
    /// the stream (media time for replay, sample clock for live capture)
    pub timestamp: Duration,
}

impl Frame {
    pub fn new(samples: Vec<f32>, timestamp: Duration) -> Self {
        Self { samples, timestamp }
    }
}

/// Result of a single frame read
#[derive(Debug, Clone, PartialEq)]
pub enum FrameRead {
    Frame(Frame),

    /// A block was dropped or arrived late; carries no data
    Overflow,

    /// A finite source has no more audio
    Exhausted,
}

/// Blocking, pull-based supplier of frames
pub trait FrameSource {
    fn read_frame(&mut self) -> Result<FrameRead, FrameSourceError>;

    /// Samples lost before they could be read; zero for lossless sources
    fn dropped_samples(&self) -> u64 {
        0
    }
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn read_frame(&mut self) -> Result<FrameRead, FrameSourceError> {
        (**self).read_frame()
    }

    fn dropped_samples(&self) -> u64 {
        (**self).dropped_samples()
    }
}

/// Replays a prepared sequence of reads, then reports `Exhausted`
#[derive(Debug, Default)]
pub struct ReplaySource {
    reads: VecDeque<Result<FrameRead, String>>,
}

impl ReplaySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a source from whole sample blocks spaced `block_size / sample_rate` apart
    pub fn from_blocks(blocks: Vec<Vec<f32>>, sample_rate: u32) -> Self {
        let mut source = Self::new();
        let mut timestamp = Duration::ZERO;
        for samples in blocks {
            let step = frame_duration(samples.len(), sample_rate);
            source.push_frame(Frame::new(samples, timestamp));
            timestamp += step;
        }
        source
    }

    pub fn push_frame(&mut self, frame: Frame) -> &mut Self {
        self.reads.push_back(Ok(FrameRead::Frame(frame)));
        self
    }

    pub fn push_overflow(&mut self) -> &mut Self {
        self.reads.push_back(Ok(FrameRead::Overflow));
        self
    }

    /// Queue a read failure
    pub fn push_error(&mut self, message: impl Into<String>) -> &mut Self {
        self.reads.push_back(Err(message.into()));
        self
    }

    pub fn remaining(&self) -> usize {
        self.reads.len()
    }
}

impl FrameSource for ReplaySource {
    fn read_frame(&mut self) -> Result<FrameRead, FrameSourceError> {
        match self.reads.pop_front() {
            Some(Ok(read)) => Ok(read),
            Some(Err(message)) => Err(FrameSourceError::Read(message)),
            None => Ok(FrameRead::Exhausted),
        }
    }
}

/// WAV file replay
pub struct WavSource;

impl WavSource {
    /// Decode a WAV file into frames of `block_size` mono samples.
    ///
    /// Channels are averaged into one; integer formats are scaled to
    /// [-1.0, 1.0]. A trailing partial block is zero-padded.
    pub fn open(path: impl AsRef<Path>, block_size: usize) -> Result<ReplaySource, FrameSourceError> {
        let path = path.as_ref();
        if block_size == 0 {
            return Err(FrameSourceError::InputUnavailable(
                "block_size must be greater than 0".to_string(),
            ));
        }

        let reader = WavReader::open(path).map_err(|e| {
            FrameSourceError::InputUnavailable(format!("{}: {}", path.display(), e))
        })?;
        let spec = reader.spec();
        let channels = spec.channels.max(1) as usize;

        info!(
            "Replaying {} ({} Hz, {} channel(s), {:?} {}-bit)",
            path.display(),
            spec.sample_rate,
            spec.channels,
            spec.sample_format,
            spec.bits_per_sample
        );

        let interleaved: Vec<f32> = match spec.sample_format {
            SampleFormat::Float => reader
                .into_samples::<f32>()
                .collect::<Result<_, _>>()
                .map_err(|e| FrameSourceError::Read(e.to_string()))?,
            SampleFormat::Int => {
                let scale = (1_i64 << (spec.bits_per_sample.clamp(1, 32) - 1)) as f32;
                reader
                    .into_samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / scale))
                    .collect::<Result<_, _>>()
                    .map_err(|e| FrameSourceError::Read(e.to_string()))?
            }
        };

        let mono: Vec<f32> = interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect();

        let blocks: Vec<Vec<f32>> = mono
            .chunks(block_size)
            .map(|chunk| {
                let mut block = chunk.to_vec();
                block.resize(block_size, 0.0);
                block
            })
            .collect();

        debug!("Decoded {} samples into {} frames", mono.len(), blocks.len());
        Ok(ReplaySource::from_blocks(blocks, spec.sample_rate))
    }
}
