//! Utterance boundary detection.
//!
//! Two-state machine driven by per-frame VAD decisions. A Silent→Speaking
//! transition is debounced: speech frames accumulate provisionally until
//! `min_speech_duration_s` of cumulative speech has been seen, so fleeting
//! VAD false positives never reach the decoder, but the provisional frames
//! are preserved and handed over on transition so the opening syllables are
//! not lost. A Speaking→Silent transition fires after
//! `silence_threshold_s` of consecutive silence; the silent tail frames
//! stay in the utterance because they may still carry trailing phonemes.
//!
//! Durations are converted to sample counts up front; all per-frame
//! arithmetic is integral.

use crate::audio::{AudioFrame, SAMPLE_RATE};

/// Thresholds governing the state machine, taken from the session config.
#[derive(Debug, Clone, Copy)]
pub struct EndpointerConfig {
    /// Consecutive silent seconds within Speaking that end the utterance.
    pub silence_threshold_s: f32,
    /// Cumulative speech seconds required to commit to Speaking.
    pub min_speech_duration_s: f32,
}

impl EndpointerConfig {
    fn silence_threshold_samples(&self) -> usize {
        (self.silence_threshold_s * SAMPLE_RATE as f32).round() as usize
    }

    fn min_speech_samples(&self) -> usize {
        (self.min_speech_duration_s * SAMPLE_RATE as f32).round() as usize
    }
}

/// Events produced as frames move through the machine.
#[derive(Debug, Clone)]
pub enum EndpointEvent {
    /// Speaking committed. Carries every frame collected during the
    /// provisional window, oldest first, for the decoder.
    SpeechStart { frames: Vec<AudioFrame> },
    /// One more frame belonging to the current utterance (speech or
    /// in-threshold trailing silence).
    SpeechContinue { frame: AudioFrame },
    /// The utterance ended; all counters have been reset.
    SpeechEnd,
}

#[derive(Debug)]
enum State {
    Silent {
        /// Speech frames seen since the last silent frame.
        provisional: Vec<AudioFrame>,
        /// Cumulative speech samples in the provisional window.
        speech_samples: usize,
    },
    Speaking {
        /// Consecutive silence samples.
        silence_samples: usize,
    },
}

impl State {
    fn silent() -> Self {
        State::Silent {
            provisional: Vec::new(),
            speech_samples: 0,
        }
    }
}

/// The endpointing state machine. Synchronous and allocation-light; all
/// waiting happens upstream.
pub struct Endpointer {
    min_speech_samples: usize,
    silence_threshold_samples: usize,
    state: State,
}

impl Endpointer {
    pub fn new(config: EndpointerConfig) -> Self {
        Self {
            min_speech_samples: config.min_speech_samples(),
            silence_threshold_samples: config.silence_threshold_samples(),
            state: State::silent(),
        }
    }

    pub fn is_speaking(&self) -> bool {
        matches!(self.state, State::Speaking { .. })
    }

    /// Advances the machine by one classified frame.
    pub fn push_frame(&mut self, frame: AudioFrame, is_speech: bool) -> Vec<EndpointEvent> {
        match &mut self.state {
            State::Silent {
                provisional,
                speech_samples,
            } => {
                if is_speech {
                    *speech_samples += frame.len();
                    provisional.push(frame);

                    if *speech_samples >= self.min_speech_samples {
                        let frames = std::mem::take(provisional);
                        self.state = State::Speaking { silence_samples: 0 };
                        vec![EndpointEvent::SpeechStart { frames }]
                    } else {
                        Vec::new()
                    }
                } else {
                    // A silent frame voids the provisional window entirely.
                    provisional.clear();
                    *speech_samples = 0;
                    Vec::new()
                }
            }

            State::Speaking { silence_samples } => {
                if is_speech {
                    *silence_samples = 0;
                    vec![EndpointEvent::SpeechContinue { frame }]
                } else {
                    *silence_samples += frame.len();
                    if *silence_samples >= self.silence_threshold_samples {
                        self.state = State::silent();
                        vec![
                            EndpointEvent::SpeechContinue { frame },
                            EndpointEvent::SpeechEnd,
                        ]
                    } else {
                        vec![EndpointEvent::SpeechContinue { frame }]
                    }
                }
            }
        }
    }

    /// Forces a Speaking→Silent transition (explicit finalize).
    ///
    /// Returns `SpeechEnd` if the machine was Speaking, `None` otherwise.
    /// Any provisional window is discarded either way.
    pub fn force_end(&mut self) -> Option<EndpointEvent> {
        let was_speaking = self.is_speaking();
        self.state = State::silent();
        was_speaking.then_some(EndpointEvent::SpeechEnd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAME: usize = 512; // 32ms

    fn endpointer(silence_s: f32, min_speech_s: f32) -> Endpointer {
        Endpointer::new(EndpointerConfig {
            silence_threshold_s: silence_s,
            min_speech_duration_s: min_speech_s,
        })
    }

    fn speech_frame() -> AudioFrame {
        AudioFrame::new(vec![1.0; FRAME])
    }

    fn silent_frame() -> AudioFrame {
        AudioFrame::new(vec![0.0; FRAME])
    }

    #[test]
    fn test_debounce_holds_until_min_speech() {
        // 0.2s debounce = 3200 samples; 6 frames (3072) are not enough.
        let mut ep = endpointer(0.8, 0.2);

        for _ in 0..6 {
            assert!(ep.push_frame(speech_frame(), true).is_empty());
            assert!(!ep.is_speaking());
        }

        let events = ep.push_frame(speech_frame(), true);
        assert_eq!(events.len(), 1);
        match &events[0] {
            EndpointEvent::SpeechStart { frames } => assert_eq!(frames.len(), 7),
            other => panic!("expected SpeechStart, got {other:?}"),
        }
        assert!(ep.is_speaking());
    }

    #[test]
    fn test_short_blip_is_discarded() {
        let mut ep = endpointer(0.8, 0.2);

        for _ in 0..3 {
            assert!(ep.push_frame(speech_frame(), true).is_empty());
        }
        // Silence before the debounce window fills: everything is dropped.
        assert!(ep.push_frame(silent_frame(), false).is_empty());
        assert!(!ep.is_speaking());

        // A new run starts counting from zero.
        for _ in 0..6 {
            assert!(ep.push_frame(speech_frame(), true).is_empty());
        }
        assert!(!ep.is_speaking());
    }

    #[test]
    fn test_zero_debounce_starts_immediately() {
        let mut ep = endpointer(0.8, 0.0);
        let events = ep.push_frame(speech_frame(), true);
        assert!(matches!(&events[0], EndpointEvent::SpeechStart { frames } if frames.len() == 1));
    }

    #[test]
    fn test_trailing_silence_stays_in_utterance() {
        let mut ep = endpointer(0.8, 0.0);
        ep.push_frame(speech_frame(), true);

        // 0.8s = 12800 samples = 25 frames to trip endpointing.
        for i in 0..24 {
            let events = ep.push_frame(silent_frame(), false);
            assert_eq!(events.len(), 1, "frame {i} should continue the utterance");
            assert!(matches!(events[0], EndpointEvent::SpeechContinue { .. }));
        }

        let events = ep.push_frame(silent_frame(), false);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], EndpointEvent::SpeechContinue { .. }));
        assert!(matches!(events[1], EndpointEvent::SpeechEnd));
        assert!(!ep.is_speaking());
    }

    #[test]
    fn test_speech_resets_silence_counter() {
        let mut ep = endpointer(0.8, 0.0);
        ep.push_frame(speech_frame(), true);

        for _ in 0..20 {
            ep.push_frame(silent_frame(), false);
        }
        // Speech resumes before the threshold: the silence run restarts.
        ep.push_frame(speech_frame(), true);
        for _ in 0..24 {
            let events = ep.push_frame(silent_frame(), false);
            assert_eq!(events.len(), 1);
        }
        assert!(ep.is_speaking());
    }

    #[test]
    fn test_force_end_only_when_speaking() {
        let mut ep = endpointer(0.8, 0.0);
        assert!(ep.force_end().is_none());

        ep.push_frame(speech_frame(), true);
        assert!(matches!(ep.force_end(), Some(EndpointEvent::SpeechEnd)));
        assert!(!ep.is_speaking());
        assert!(ep.force_end().is_none());
    }

    #[test]
    fn test_second_utterance_after_end() {
        let mut ep = endpointer(0.1, 0.0);
        ep.push_frame(speech_frame(), true);

        // 0.1s = 1600 samples = 4 frames of silence (3 * 512 = 1536 < 1600).
        for _ in 0..3 {
            ep.push_frame(silent_frame(), false);
        }
        let events = ep.push_frame(silent_frame(), false);
        assert!(matches!(events.last(), Some(EndpointEvent::SpeechEnd)));

        let events = ep.push_frame(speech_frame(), true);
        assert!(matches!(events[0], EndpointEvent::SpeechStart { .. }));
    }
}
