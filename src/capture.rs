/// Live microphone capture
///
/// Runs a cpal input stream whose callback downmixes to mono and pushes
/// into the hand-off ring. The detection loop reads fixed-size frames back
/// out with a bounded blocking wait.

use crate::audio_buffer::{AudioBuffer, BufferReader, BufferWriter};
use crate::config::AudioConfig;
use crate::frame_source::{Frame, FrameRead, FrameSource, FrameSourceError};
use crate::level::{frame_duration, sample_position};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, Sample, SampleFormat, SizedSample, StreamConfig};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Frames of slack in the ring before the callback starts dropping samples
const RING_FRAMES: usize = 8;

/// Slot the stream error callback reports into
type ErrorSlot = Arc<Mutex<Option<String>>>;

/// Frame source backed by a live input device
pub struct MicrophoneSource {
    _stream: cpal::Stream,
    reader: BufferReader,
    block_size: usize,
    poll_interval: Duration,
    read_timeout: Duration,
    stream_error: ErrorSlot,
    sample_rate: u32,

    /// Samples taken out of the ring, including blocks discarded on overflow
    samples_read: u64,
}

impl MicrophoneSource {
    /// Open and start the configured input device
    pub fn open(config: &AudioConfig) -> Result<Self, FrameSourceError> {
        let host = cpal::default_host();
        let device = select_device(&host, config.device.as_deref())?;
        let device_name = device.name().unwrap_or_else(|_| "<unnamed>".to_string());

        let (stream_config, sample_format) = negotiate_config(&device, config.sample_rate)?;
        let sample_rate = stream_config.sample_rate.0;
        if sample_rate != config.sample_rate {
            warn!(
                "Device {} does not support {} Hz, capturing at {} Hz",
                device_name, config.sample_rate, sample_rate
            );
        }

        let buffer = AudioBuffer::with_capacity(config.block_size * RING_FRAMES)
            .map_err(|e| FrameSourceError::InputUnavailable(e.to_string()))?;
        let (writer, reader) = buffer.split();
        let stream_error: ErrorSlot = Arc::new(Mutex::new(None));

        let stream = match sample_format {
            SampleFormat::F32 => build_stream::<f32>(&device, &stream_config, writer, &stream_error),
            SampleFormat::I16 => build_stream::<i16>(&device, &stream_config, writer, &stream_error),
            SampleFormat::I32 => build_stream::<i32>(&device, &stream_config, writer, &stream_error),
            SampleFormat::U16 => build_stream::<u16>(&device, &stream_config, writer, &stream_error),
            other => Err(FrameSourceError::InputUnavailable(format!(
                "Unsupported sample format: {:?}",
                other
            ))),
        }?;

        stream
            .play()
            .map_err(|e| FrameSourceError::InputUnavailable(format!("Failed to start stream: {}", e)))?;

        let frame_time = frame_duration(config.block_size, sample_rate);
        info!(
            "Capturing from {} at {} Hz, {} channel(s), {} samples/frame ({:?})",
            device_name, sample_rate, stream_config.channels, config.block_size, frame_time
        );

        Ok(Self {
            _stream: stream,
            reader,
            block_size: config.block_size,
            poll_interval: (frame_time / 4).max(Duration::from_millis(1)),
            read_timeout: config.read_timeout(),
            stream_error,
            sample_rate,
            samples_read: 0,
        })
    }

    /// Pop one block, advancing the sample clock
    fn take_block(&mut self) -> Option<(Vec<f32>, Duration)> {
        let position = self.samples_read + self.reader.dropped_samples();
        let samples = self.reader.read_block(self.block_size)?;
        self.samples_read += samples.len() as u64;
        Some((samples, sample_position(position, self.sample_rate)))
    }

    fn take_stream_error(&self) -> Option<String> {
        match self.stream_error.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => Some("stream error slot poisoned".to_string()),
        }
    }
}

impl FrameSource for MicrophoneSource {
    fn read_frame(&mut self) -> Result<FrameRead, FrameSourceError> {
        let deadline = Instant::now() + self.read_timeout;

        loop {
            if let Some(message) = self.take_stream_error() {
                return Err(FrameSourceError::Read(message));
            }

            if self.reader.take_overflow() {
                // the next block straddles a gap; drop it with the overflow
                let _ = self.take_block();
                return Ok(FrameRead::Overflow);
            }

            if let Some((samples, timestamp)) = self.take_block() {
                return Ok(FrameRead::Frame(Frame::new(samples, timestamp)));
            }

            if Instant::now() >= deadline {
                return Err(FrameSourceError::Timeout(self.read_timeout));
            }
            thread::sleep(self.poll_interval);
        }
    }

    fn dropped_samples(&self) -> u64 {
        self.reader.dropped_samples()
    }
}

fn select_device(host: &cpal::Host, name: Option<&str>) -> Result<Device, FrameSourceError> {
    match name {
        None => host.default_input_device().ok_or_else(|| {
            FrameSourceError::InputUnavailable("No default input device found".to_string())
        }),
        Some(wanted) => {
            let mut devices = host.input_devices().map_err(|e| {
                FrameSourceError::InputUnavailable(format!("Failed to enumerate devices: {}", e))
            })?;
            devices
                .find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
                .ok_or_else(|| {
                    FrameSourceError::InputUnavailable(format!("Input device not found: {}", wanted))
                })
        }
    }
}

/// Sample formats the capture callback can convert
fn is_supported_format(format: SampleFormat) -> bool {
    matches!(
        format,
        SampleFormat::F32 | SampleFormat::I16 | SampleFormat::I32 | SampleFormat::U16
    )
}

/// Prefer a supported config at the requested rate, else the device default
fn negotiate_config(
    device: &Device,
    sample_rate: u32,
) -> Result<(StreamConfig, SampleFormat), FrameSourceError> {
    let requested = cpal::SampleRate(sample_rate);

    if let Ok(mut ranges) = device.supported_input_configs() {
        if let Some(range) = ranges.find(|r| {
            is_supported_format(r.sample_format())
                && r.min_sample_rate() <= requested
                && requested <= r.max_sample_rate()
        }) {
            let supported = range.with_sample_rate(requested);
            return Ok((supported.config(), supported.sample_format()));
        }
    }

    let fallback = device.default_input_config().map_err(|e| {
        FrameSourceError::InputUnavailable(format!("Failed to get default input config: {}", e))
    })?;
    Ok((fallback.config(), fallback.sample_format()))
}

fn build_stream<T>(
    device: &Device,
    config: &StreamConfig,
    mut writer: BufferWriter,
    stream_error: &ErrorSlot,
) -> Result<cpal::Stream, FrameSourceError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = config.channels.max(1) as usize;
    let mut mono: Vec<f32> = Vec::new();
    let error_slot = Arc::clone(stream_error);

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                mono.clear();
                mono.extend(data.chunks(channels).map(|frame| {
                    frame.iter().map(|&s| f32::from_sample(s)).sum::<f32>() / frame.len() as f32
                }));
                writer.write(&mono);
            },
            move |err| {
                error!("Input stream error: {}", err);
                if let Ok(mut slot) = error_slot.lock() {
                    slot.get_or_insert_with(|| err.to_string());
                }
            },
            None,
        )
        .map_err(|e| FrameSourceError::InputUnavailable(format!("Failed to build stream: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supported_formats() {
        assert!(is_supported_format(SampleFormat::F32));
        assert!(is_supported_format(SampleFormat::I16));
        assert!(is_supported_format(SampleFormat::I32));
        assert!(is_supported_format(SampleFormat::U16));
    }

    #[test]
    fn test_unconvertible_formats_are_skipped() {
        assert!(!is_supported_format(SampleFormat::I8));
        assert!(!is_supported_format(SampleFormat::F64));
        assert!(!is_supported_format(SampleFormat::U64));
    }
}
