//! Voice activity detection.
//!
//! The gate owns the frame-size contract: the Silero family of VAD models
//! strictly requires one of a few analysis sizes at 16 kHz, and feeding it
//! anything else is a caller bug, not a condition to paper over. The model
//! itself sits behind [`VadModel`] so tests can substitute a stub and the
//! server can share one process-wide instance.

use crate::audio::AudioFrame;
use crate::error::{Error, Result};
use ndarray::{Array1, Array2, Array3};
use ort::session::builder::SessionBuilder;
use ort::session::Session;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;

/// Analysis frame sizes the VAD accepts at 16 kHz (32 / 64 / 96 ms).
pub const ALLOWED_FRAME_SIZES: [usize; 3] = [512, 1024, 1536];

/// Recommended analysis frame size.
pub const DEFAULT_FRAME_SIZE: usize = 512;

/// A voice activity model: one speech probability per analysis frame.
///
/// Implementations may keep streaming state across calls (Silero carries an
/// LSTM state); `reset` clears it between audio streams.
pub trait VadModel: Send {
    /// Speech probability in `[0, 1]` for a frame of an allowed size.
    /// The caller guarantees the size; implementations may assume it.
    fn prob(&mut self, frame: &[f32]) -> Result<f32>;

    /// Clear any streaming state.
    fn reset(&mut self);
}

/// Handle to the process-wide VAD model, shared across sessions.
///
/// Inference is milliseconds per frame; a short critical section is cheaper
/// than one model instance per session.
pub type SharedVadModel = Arc<Mutex<dyn VadModel>>;

/// Per-frame classification produced by the gate.
#[derive(Debug, Clone, Copy)]
pub struct VadDecision {
    pub prob: f32,
    pub is_speech: bool,
}

/// Wraps the shared VAD model with the frame-size contract and the speech
/// threshold.
pub struct VadGate {
    model: SharedVadModel,
    threshold: f32,
    frame_size: usize,
}

impl VadGate {
    pub fn new(model: SharedVadModel, threshold: f32, frame_size: usize) -> Result<Self> {
        if !ALLOWED_FRAME_SIZES.contains(&frame_size) {
            return Err(Error::InvalidFrameSize(frame_size));
        }
        Ok(Self {
            model,
            threshold,
            frame_size,
        })
    }

    /// The analysis frame size fixed at construction.
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Classifies one frame.
    ///
    /// A wrong-size frame is a programming error and fails hard. A model
    /// inference failure is transient: the frame is classified as silence so
    /// a flaky VAD cannot abort an utterance mid-stream.
    pub fn classify(&self, frame: &AudioFrame) -> Result<VadDecision> {
        if frame.len() != self.frame_size {
            return Err(Error::InvalidFrameSize(frame.len()));
        }

        match self.model.lock().prob(frame.samples()) {
            Ok(prob) => Ok(VadDecision {
                prob,
                is_speech: prob >= self.threshold,
            }),
            Err(e) => {
                tracing::warn!(error = %e, "vad inference failed, treating frame as silence");
                Ok(VadDecision {
                    prob: 0.0,
                    is_speech: false,
                })
            }
        }
    }

    /// Resets the underlying model's streaming state.
    pub fn reset(&self) {
        self.model.lock().reset();
    }
}

/// Silero VAD v5 wrapper over ONNX Runtime.
///
/// The model takes the current frame with the previous frame's last 64
/// samples prepended, plus an LSTM state tensor it returns updated. State is
/// carried across calls for streaming detection.
pub struct SileroVad {
    session: Session,
    /// LSTM state [2, 1, 128].
    state: Array3<f32>,
    /// Last [`Self::CONTEXT_SIZE`] samples of the previous frame.
    context: Vec<f32>,
}

impl SileroVad {
    const CONTEXT_SIZE: usize = 64;
    const SAMPLE_RATE: i64 = 16_000;

    pub fn load<P: AsRef<Path>>(model_path: P) -> Result<Self> {
        let session = SessionBuilder::new()?.commit_from_file(model_path)?;
        Ok(Self {
            session,
            state: Array3::zeros((2, 1, 128)),
            context: vec![0.0; Self::CONTEXT_SIZE],
        })
    }

    /// Wraps the model for sharing across sessions.
    pub fn into_shared(self) -> SharedVadModel {
        Arc::new(Mutex::new(self))
    }
}

impl VadModel for SileroVad {
    fn prob(&mut self, frame: &[f32]) -> Result<f32> {
        let input_len = Self::CONTEXT_SIZE + frame.len();
        let mut input = Vec::with_capacity(input_len);
        input.extend_from_slice(&self.context);
        input.extend_from_slice(frame);

        self.context
            .copy_from_slice(&frame[frame.len() - Self::CONTEXT_SIZE..]);

        let input = Array2::from_shape_vec((1, input_len), input)
            .map_err(|e| Error::Vad(format!("input shape: {e}")))?;
        let sr = Array1::from_vec(vec![Self::SAMPLE_RATE]);

        let outputs = self.session.run(ort::inputs!(
            "input" => ort::value::Value::from_array(input)?,
            "state" => ort::value::Value::from_array(self.state.clone())?,
            "sr" => ort::value::Value::from_array(sr)?,
        ))?;

        let (_, prob) = outputs["output"]
            .try_extract_tensor::<f32>()
            .map_err(|e| Error::Vad(format!("output tensor: {e}")))?;
        let (_, next_state) = outputs["stateN"]
            .try_extract_tensor::<f32>()
            .map_err(|e| Error::Vad(format!("state tensor: {e}")))?;

        self.state = Array3::from_shape_vec((2, 1, 128), next_state.to_vec())
            .map_err(|e| Error::Vad(format!("state shape: {e}")))?;

        Ok(prob[0])
    }

    fn reset(&mut self) {
        self.state.fill(0.0);
        self.context.iter_mut().for_each(|s| *s = 0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Deterministic stand-in: nonzero samples are speech.
    struct StubVad;

    impl VadModel for StubVad {
        fn prob(&mut self, frame: &[f32]) -> Result<f32> {
            Ok(if frame.iter().any(|&s| s != 0.0) {
                1.0
            } else {
                0.0
            })
        }

        fn reset(&mut self) {}
    }

    struct FailingVad;

    impl VadModel for FailingVad {
        fn prob(&mut self, _frame: &[f32]) -> Result<f32> {
            Err(Error::Vad("model exploded".into()))
        }

        fn reset(&mut self) {}
    }

    fn shared(model: impl VadModel + 'static) -> SharedVadModel {
        Arc::new(Mutex::new(model))
    }

    #[test]
    fn test_gate_rejects_disallowed_frame_size() {
        let gate = VadGate::new(shared(StubVad), 0.5, 512).unwrap();
        let err = gate.classify(&AudioFrame::new(vec![0.0; 900])).unwrap_err();
        assert!(matches!(err, Error::InvalidFrameSize(900)));
    }

    #[test]
    fn test_gate_rejects_disallowed_configured_size() {
        assert!(matches!(
            VadGate::new(shared(StubVad), 0.5, 1000),
            Err(Error::InvalidFrameSize(1000))
        ));
    }

    #[test]
    fn test_gate_classifies_against_threshold() {
        let gate = VadGate::new(shared(StubVad), 0.5, 512).unwrap();

        let speech = gate.classify(&AudioFrame::new(vec![1.0; 512])).unwrap();
        assert!(speech.is_speech);

        let silence = gate.classify(&AudioFrame::new(vec![0.0; 512])).unwrap();
        assert!(!silence.is_speech);
        assert_eq!(silence.prob, 0.0);
    }

    #[test]
    fn test_gate_fails_open_as_silence_on_model_error() {
        let gate = VadGate::new(shared(FailingVad), 0.5, 512).unwrap();
        let decision = gate.classify(&AudioFrame::new(vec![1.0; 512])).unwrap();
        assert!(!decision.is_speech);
    }
}
