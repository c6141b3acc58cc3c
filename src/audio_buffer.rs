/// Capture hand-off buffer
///
/// Lock-free single-producer/single-consumer ring between the platform
/// audio thread (writer) and the detection loop (reader). The writer never
/// blocks: when the reader falls behind, new samples are dropped and an
/// overflow flag is raised for the reader to pick up as a skipped tick.

use cache_padded::CachePadded;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum AudioBufferError {
    #[error("Invalid buffer size: {0}")]
    InvalidSize(usize),
}

/// Flags shared by both halves, padded to keep the audio thread's writes
/// off the reader's cache line
struct SharedState {
    overflowed: CachePadded<AtomicBool>,
    dropped_samples: CachePadded<AtomicU64>,
}

impl SharedState {
    fn new() -> Self {
        Self {
            overflowed: CachePadded::new(AtomicBool::new(false)),
            dropped_samples: CachePadded::new(AtomicU64::new(0)),
        }
    }
}

/// Ring buffer for captured samples, consumed by [`AudioBuffer::split`]
pub struct AudioBuffer {
    ring: HeapRb<f32>,
}

impl AudioBuffer {
    /// Create a buffer holding `capacity` samples
    pub fn with_capacity(capacity: usize) -> Result<Self, AudioBufferError> {
        if capacity == 0 {
            return Err(AudioBufferError::InvalidSize(capacity));
        }

        debug!("Creating audio buffer with capacity: {} samples", capacity);
        Ok(Self {
            ring: HeapRb::<f32>::new(capacity),
        })
    }

    /// Split into the audio-thread writer and the detection-loop reader
    pub fn split(self) -> (BufferWriter, BufferReader) {
        let shared = Arc::new(SharedState::new());
        let (producer, consumer) = self.ring.split();

        (
            BufferWriter {
                producer,
                shared: Arc::clone(&shared),
            },
            BufferReader { consumer, shared },
        )
    }
}

/// Producer half, owned by the audio callback
pub struct BufferWriter {
    producer: HeapProd<f32>,
    shared: Arc<SharedState>,
}

impl BufferWriter {
    /// Push samples; returns how many were stored.
    ///
    /// Samples that do not fit are dropped and the overflow flag is set.
    pub fn write(&mut self, samples: &[f32]) -> usize {
        let written = self.producer.push_slice(samples);

        if written < samples.len() {
            self.shared.overflowed.store(true, Ordering::Release);
            self.shared
                .dropped_samples
                .fetch_add((samples.len() - written) as u64, Ordering::Relaxed);
        }

        written
    }

    pub fn free_space(&self) -> usize {
        self.producer.vacant_len()
    }
}

/// Consumer half, owned by the detection loop
pub struct BufferReader {
    consumer: HeapCons<f32>,
    shared: Arc<SharedState>,
}

impl BufferReader {
    /// Pop exactly `count` samples, or `None` if not enough are buffered yet
    pub fn read_block(&mut self, count: usize) -> Option<Vec<f32>> {
        if self.consumer.occupied_len() < count {
            return None;
        }

        let mut block = vec![0.0; count];
        let read = self.consumer.pop_slice(&mut block);
        debug_assert_eq!(read, count);
        Some(block)
    }

    /// Report and clear the overflow flag
    pub fn take_overflow(&self) -> bool {
        self.shared.overflowed.swap(false, Ordering::AcqRel)
    }

    /// Total samples dropped since the buffer was created
    pub fn dropped_samples(&self) -> u64 {
        self.shared.dropped_samples.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.consumer.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.consumer.capacity().get()
    }

    /// Discard everything currently buffered
    pub fn clear(&mut self) {
        let occupied = self.consumer.occupied_len();
        self.consumer.skip(occupied);
        debug!("Cleared audio buffer ({} samples)", occupied);
    }
}
