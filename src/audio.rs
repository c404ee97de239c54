//! Audio frame accumulation.
//!
//! The gateway receives arbitrary-length pushes of raw 16 kHz mono float
//! samples from the socket and must hand the VAD exact-size analysis frames.
//! `FrameBuffer` does that accumulation: push any number of samples, pop
//! complete frames, flush the trailing remainder at finalize.

use std::collections::VecDeque;

/// Sample rate every component of the pipeline operates at.
pub const SAMPLE_RATE: usize = 16_000;

/// A block of mono float samples at [`SAMPLE_RATE`], immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    samples: Vec<f32>,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>) -> Self {
        Self { samples }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Frame duration in seconds.
    pub fn duration_s(&self) -> f32 {
        self.samples.len() as f32 / SAMPLE_RATE as f32
    }
}

/// Accumulates pushed samples into fixed-size frames.
///
/// The buffer is capacity-bounded: if the pipeline falls behind the socket,
/// the oldest samples that have not yet formed a frame are dropped first.
/// Overflow is logged, never reported to the client (reporting it would add
/// traffic to an already congested connection).
#[derive(Debug)]
pub struct FrameBuffer {
    pending: VecDeque<f32>,
    frame_size: usize,
    max_pending: usize,
    dropped_samples: u64,
}

impl FrameBuffer {
    /// Default backlog cap: 30 seconds of unframed audio.
    pub const DEFAULT_MAX_PENDING_SECS: usize = 30;

    pub fn new(frame_size: usize) -> Self {
        Self::with_capacity(frame_size, Self::DEFAULT_MAX_PENDING_SECS * SAMPLE_RATE)
    }

    pub fn with_capacity(frame_size: usize, max_pending: usize) -> Self {
        assert!(frame_size > 0, "frame size must be non-zero");
        Self {
            pending: VecDeque::with_capacity(frame_size * 4),
            frame_size,
            max_pending: max_pending.max(frame_size),
            dropped_samples: 0,
        }
    }

    /// The fixed frame size this buffer yields.
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Number of buffered samples not yet emitted as frames.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Total samples discarded due to backlog overflow.
    pub fn dropped_samples(&self) -> u64 {
        self.dropped_samples
    }

    /// Appends samples. Never blocks. Drops the oldest unframed samples when
    /// the backlog cap is exceeded.
    pub fn push(&mut self, samples: &[f32]) {
        self.pending.extend(samples.iter().copied());

        if self.pending.len() > self.max_pending {
            let excess = self.pending.len() - self.max_pending;
            self.pending.drain(..excess);
            self.dropped_samples += excess as u64;
            tracing::warn!(
                dropped = excess,
                total_dropped = self.dropped_samples,
                "frame buffer overflow, dropping oldest unframed samples"
            );
        }
    }

    /// Pops one complete frame, or `None` if fewer than `frame_size` samples
    /// are buffered.
    pub fn next_frame(&mut self) -> Option<AudioFrame> {
        if self.pending.len() < self.frame_size {
            return None;
        }
        let samples: Vec<f32> = self.pending.drain(..self.frame_size).collect();
        Some(AudioFrame::new(samples))
    }

    /// Returns the trailing partial remainder (at least one sample) and
    /// clears the buffer. Used only at finalize; mid-stream the remainder
    /// stays buffered until enough samples arrive.
    pub fn flush(&mut self) -> Option<Vec<f32>> {
        if self.pending.is_empty() {
            return None;
        }
        Some(self.pending.drain(..).collect())
    }
}
