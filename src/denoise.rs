//! Optional noise suppression ahead of the VAD.
//!
//! Filters run on the same analysis cadence as the VAD: one frame in, one
//! frame of exactly the same size out, so nothing downstream has to resize.
//! RNNoise works on 480-sample frames at 48 kHz, which does not divide the
//! VAD frame sizes; the filter absorbs the mismatch with internal resampling
//! and a short zero-filled warmup delay.

use crate::audio::AudioFrame;
use crate::error::Result;
use std::collections::VecDeque;

/// A frame-shape-preserving denoiser, stateful per session.
pub trait NoiseFilter: Send {
    /// Denoises one frame; the output has the same length as the input.
    fn filter(&mut self, frame: &AudioFrame) -> Result<AudioFrame>;

    /// Clears internal buffers between audio streams.
    fn reset(&mut self);

    fn name(&self) -> &'static str;
}

/// No-op filter used when noise suppression is disabled.
pub struct Passthrough;

impl NoiseFilter for Passthrough {
    fn filter(&mut self, frame: &AudioFrame) -> Result<AudioFrame> {
        Ok(frame.clone())
    }

    fn reset(&mut self) {}

    fn name(&self) -> &'static str {
        "passthrough"
    }
}

/// RNNoise-backed filter with 16 kHz ↔ 48 kHz resampling.
///
/// Input frames are upsampled 3x, pushed through RNNoise in 480-sample
/// frames, downsampled back, and queued; each call returns the oldest
/// `frame.len()` denoised samples. Until the queue has filled once the
/// output is zero-padded at the front, introducing at most one RNNoise
/// frame (10 ms) of delay.
pub struct RnnoiseFilter {
    denoiser: Box<nnnoiseless::DenoiseState<'static>>,
    buffer_48k: Vec<f32>,
    ready_16k: VecDeque<f32>,
}

/// RNNoise consumes and produces samples at i16 scale.
const PCM_SCALE: f32 = 32768.0;

impl RnnoiseFilter {
    pub fn new() -> Self {
        Self {
            denoiser: nnnoiseless::DenoiseState::new(),
            buffer_48k: Vec::with_capacity(nnnoiseless::FRAME_SIZE * 4),
            ready_16k: VecDeque::new(),
        }
    }

    /// Linear-interpolation upsample 16 kHz → 48 kHz.
    fn upsample_3x(samples: &[f32], out: &mut Vec<f32>) {
        for (i, &current) in samples.iter().enumerate() {
            let next = samples.get(i + 1).copied().unwrap_or(current);
            out.push(current);
            out.push(current + (next - current) / 3.0);
            out.push(current + 2.0 * (next - current) / 3.0);
        }
    }

    /// Averaging downsample 48 kHz → 16 kHz.
    fn downsample_3x(&mut self, samples: &[f32]) {
        for triple in samples.chunks_exact(3) {
            self.ready_16k
                .push_back((triple[0] + triple[1] + triple[2]) / 3.0);
        }
    }
}

impl Default for RnnoiseFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl NoiseFilter for RnnoiseFilter {
    fn filter(&mut self, frame: &AudioFrame) -> Result<AudioFrame> {
        let scaled: Vec<f32> = frame.samples().iter().map(|&s| s * PCM_SCALE).collect();
        Self::upsample_3x(&scaled, &mut self.buffer_48k);

        let rnnoise_frame = nnnoiseless::FRAME_SIZE;
        let mut denoised_48k = Vec::new();
        let mut offset = 0;
        while self.buffer_48k.len() - offset >= rnnoise_frame {
            let input = &self.buffer_48k[offset..offset + rnnoise_frame];
            let mut output = vec![0.0f32; rnnoise_frame];
            self.denoiser.process_frame(&mut output, input);
            denoised_48k.extend_from_slice(&output);
            offset += rnnoise_frame;
        }
        self.buffer_48k.drain(..offset);

        self.downsample_3x(&denoised_48k);

        // Emit exactly one frame's worth, zero-padding during warmup.
        let want = frame.len();
        let mut samples = Vec::with_capacity(want);
        let available = self.ready_16k.len().min(want);
        samples.resize(want - available, 0.0);
        samples.extend(self.ready_16k.drain(..available).map(|s| s / PCM_SCALE));

        Ok(AudioFrame::new(samples))
    }

    fn reset(&mut self) {
        self.buffer_48k.clear();
        self.ready_16k.clear();
    }

    fn name(&self) -> &'static str {
        "rnnoise"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passthrough_preserves_frame() {
        let mut filter = Passthrough;
        let frame = AudioFrame::new(vec![0.25; 512]);
        let out = filter.filter(&frame).unwrap();
        assert_eq!(out, frame);
    }

    #[test]
    fn test_rnnoise_preserves_frame_size() {
        let mut filter = RnnoiseFilter::new();
        for _ in 0..8 {
            let frame = AudioFrame::new(vec![0.1; 512]);
            let out = filter.filter(&frame).unwrap();
            assert_eq!(out.len(), 512);
        }
    }

    #[test]
    fn test_rnnoise_handles_all_allowed_sizes() {
        for &size in &crate::vad::ALLOWED_FRAME_SIZES {
            let mut filter = RnnoiseFilter::new();
            let out = filter.filter(&AudioFrame::new(vec![0.0; size])).unwrap();
            assert_eq!(out.len(), size);
        }
    }

    #[test]
    fn test_rnnoise_reset_clears_backlog() {
        let mut filter = RnnoiseFilter::new();
        let _ = filter.filter(&AudioFrame::new(vec![0.1; 1536])).unwrap();
        filter.reset();
        assert!(filter.ready_16k.is_empty());
        assert!(filter.buffer_48k.is_empty());
    }
}
