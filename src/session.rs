//! Per-connection recognition session.
//!
//! A session binds one client connection to one endpointer and one decoder
//! driver. It ingests raw audio, runs the frame/VAD/endpointing pipeline
//! synchronously, awaits the decoder where needed, and queues outbound
//! events in emission order. All waiting on the network happens outside;
//! the session never blocks on it.

use crate::audio::{AudioFrame, FrameBuffer, SAMPLE_RATE};
use crate::decoder::StreamingDecoder;
use crate::denoise::NoiseFilter;
use crate::driver::{DecoderDriver, DriverConfig};
use crate::endpoint::{EndpointEvent, Endpointer, EndpointerConfig};
use crate::error::{Error, Result};
use crate::protocol::ServerEvent;
use crate::vad::{SharedVadModel, VadGate};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Recognition options for one session. Installed once by the client's
/// `config` message; server defaults fill any omitted field.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Minimum speech probability to classify a frame as speech.
    pub vad_threshold: f32,
    /// Consecutive silent seconds that trigger endpointing.
    pub silence_threshold_s: f32,
    /// Cumulative speech required before an utterance is committed.
    pub min_speech_duration_s: f32,
    /// Target audio duration per streaming-decode call.
    pub chunk_size_s: f32,
    /// Number of most-recent decode chunks treated as provisional.
    pub unfixed_chunk_num: usize,
    /// Tokens rolled back from the previous decode output.
    pub unfixed_token_num: usize,
    /// Forced decode language; `None` auto-detects.
    pub language: Option<String>,
    /// Domain hint supplied to the decoder.
    pub prompt: String,
    /// Per-call context supplied to the decoder.
    pub context: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            vad_threshold: 0.5,
            silence_threshold_s: 0.8,
            min_speech_duration_s: 0.2,
            chunk_size_s: 1.0,
            unfixed_chunk_num: 4,
            unfixed_token_num: 5,
            language: None,
            prompt: String::new(),
            context: String::new(),
        }
    }
}

impl SessionConfig {
    /// Range-checks every field. Values come straight off the wire.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.vad_threshold) {
            return Err(Error::BadMessage(format!(
                "vad_threshold must be in [0, 1], got {}",
                self.vad_threshold
            )));
        }
        if !self.silence_threshold_s.is_finite() || self.silence_threshold_s < 0.0 {
            return Err(Error::BadMessage(format!(
                "silence_threshold must be >= 0, got {}",
                self.silence_threshold_s
            )));
        }
        if !self.min_speech_duration_s.is_finite() || self.min_speech_duration_s < 0.0 {
            return Err(Error::BadMessage(format!(
                "min_speech_duration must be >= 0, got {}",
                self.min_speech_duration_s
            )));
        }
        if !self.chunk_size_s.is_finite() || self.chunk_size_s <= 0.0 {
            return Err(Error::BadMessage(format!(
                "chunk_size_sec must be > 0, got {}",
                self.chunk_size_s
            )));
        }
        Ok(())
    }

    fn chunk_size_samples(&self) -> usize {
        ((self.chunk_size_s * SAMPLE_RATE as f32).round() as usize).max(1)
    }
}

/// The configured pipeline: everything between raw samples and events.
struct Pipeline {
    frames: FrameBuffer,
    filter: Option<Box<dyn NoiseFilter>>,
    gate: VadGate,
    endpointer: Endpointer,
    driver: DecoderDriver,
}

/// One client connection's recognition state.
pub struct Session {
    id: String,
    decoder: Arc<dyn StreamingDecoder>,
    vad: SharedVadModel,
    filter: Option<Box<dyn NoiseFilter>>,
    frame_size: usize,
    decode_timeout: Duration,
    pipeline: Option<Pipeline>,
    pending_events: Vec<ServerEvent>,
    audio_processed: bool,
    closed: bool,
}

impl Session {
    pub fn new(
        id: String,
        decoder: Arc<dyn StreamingDecoder>,
        vad: SharedVadModel,
        filter: Option<Box<dyn NoiseFilter>>,
        frame_size: usize,
        decode_timeout: Duration,
    ) -> Self {
        Self {
            id,
            decoder,
            vad,
            filter,
            frame_size,
            decode_timeout,
            pipeline: None,
            pending_events: Vec::new(),
            audio_processed: false,
            closed: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_configured(&self) -> bool {
        self.pipeline.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Whether the endpointer is currently inside an utterance.
    pub fn is_speaking(&self) -> bool {
        self.pipeline
            .as_ref()
            .is_some_and(|p| p.endpointer.is_speaking())
    }

    /// Installs the session configuration and builds the pipeline.
    ///
    /// May be called again before any audio has been processed (the new
    /// config overwrites the old); afterwards it fails with
    /// `ConfigAfterAudio` and the current config is kept.
    pub fn apply_config(&mut self, config: SessionConfig) -> Result<()> {
        if self.closed {
            return Err(Error::SessionClosed);
        }
        if self.audio_processed {
            return Err(Error::ConfigAfterAudio);
        }
        config.validate()?;

        let gate = VadGate::new(self.vad.clone(), config.vad_threshold, self.frame_size)?;
        let endpointer = Endpointer::new(EndpointerConfig {
            silence_threshold_s: config.silence_threshold_s,
            min_speech_duration_s: config.min_speech_duration_s,
        });
        let driver = DecoderDriver::new(
            self.decoder.clone(),
            DriverConfig {
                chunk_size_samples: config.chunk_size_samples(),
                unfixed_chunk_num: config.unfixed_chunk_num,
                unfixed_token_num: config.unfixed_token_num,
                decode_timeout: self.decode_timeout,
            },
            config.prompt.clone(),
            config.context.clone(),
            config.language.clone(),
        );

        // On a pre-audio re-config the filter moves from the old pipeline
        // to the new one.
        let filter = match self.pipeline.take() {
            Some(old) => old.filter,
            None => self.filter.take(),
        };

        self.pipeline = Some(Pipeline {
            frames: FrameBuffer::new(self.frame_size),
            filter,
            gate,
            endpointer,
            driver,
        });
        Ok(())
    }

    /// Pushes raw samples through the pipeline, advancing it until no more
    /// complete frames remain. Produced events queue up for
    /// [`Self::take_events`].
    ///
    /// Transient decode failures are reported as `error` events inline and
    /// processing continues; fatal errors propagate and the caller must
    /// close the session.
    pub async fn ingest(&mut self, samples: &[f32]) -> Result<()> {
        if self.closed {
            return Err(Error::SessionClosed);
        }
        let pipeline = self.pipeline.as_mut().ok_or(Error::ConfigRequired)?;
        if samples.is_empty() {
            return Ok(());
        }
        self.audio_processed = true;

        pipeline.frames.push(samples);
        while let Some(frame) = pipeline.frames.next_frame() {
            let frame = match &mut pipeline.filter {
                Some(filter) => filter.filter(&frame)?,
                None => frame,
            };
            let decision = pipeline.gate.classify(&frame)?;

            for event in pipeline.endpointer.push_frame(frame, decision.is_speech) {
                Self::drive(pipeline, &mut self.pending_events, event).await?;
            }
        }
        Ok(())
    }

    /// Forces the current utterance to end, if one is in progress.
    ///
    /// Flushes the unframed sample remainder and any pending decode audio,
    /// then emits the `final` event. A no-op (no events) when the session
    /// is not currently Speaking.
    pub async fn finalize(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::SessionClosed);
        }
        let pipeline = match self.pipeline.as_mut() {
            Some(p) => p,
            None => return Ok(()),
        };

        if !pipeline.endpointer.is_speaking() {
            return Ok(());
        }

        // The partial-frame remainder belongs to this utterance.
        if let Some(remainder) = pipeline.frames.flush() {
            pipeline.driver.push_tail(&remainder);
        }
        if let Some(event) = pipeline.endpointer.force_end() {
            Self::drive(pipeline, &mut self.pending_events, event).await?;
        }
        Ok(())
    }

    /// Drains events queued so far, in emission order.
    pub fn take_events(&mut self) -> Vec<ServerEvent> {
        std::mem::take(&mut self.pending_events)
    }

    /// Releases the pipeline; every later call fails with `SessionClosed`.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(pipeline) = self.pipeline.take() {
            pipeline.gate.reset();
        }
        self.pending_events.clear();
        tracing::debug!(session = %self.id, "session closed");
    }

    async fn drive(
        pipeline: &mut Pipeline,
        events: &mut Vec<ServerEvent>,
        event: EndpointEvent,
    ) -> Result<()> {
        match event {
            EndpointEvent::SpeechStart { frames } => {
                tracing::debug!(frames = frames.len(), "speech started");
                for frame in frames {
                    Self::feed(pipeline, events, &frame).await?;
                }
            }
            EndpointEvent::SpeechContinue { frame } => {
                Self::feed(pipeline, events, &frame).await?;
            }
            EndpointEvent::SpeechEnd => {
                tracing::debug!("speech ended, flushing");
                let finished = pipeline.driver.finish_utterance().await?;
                if let Some(detail) = finished.flush_error {
                    events.push(ServerEvent::Error { message: detail });
                }
                events.push(ServerEvent::Final {
                    language: finished.language,
                    text: finished.text,
                    timestamp: now_ts(),
                    is_speech_final: true,
                });
            }
        }
        Ok(())
    }

    async fn feed(
        pipeline: &mut Pipeline,
        events: &mut Vec<ServerEvent>,
        frame: &AudioFrame,
    ) -> Result<()> {
        match pipeline.driver.on_speech(frame.samples()).await {
            Ok(Some(partial)) => {
                events.push(ServerEvent::Partial {
                    language: partial.language,
                    text: partial.text,
                    timestamp: now_ts(),
                });
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                // Transient: the chunk is gone, the session keeps going.
                events.push(ServerEvent::Error {
                    message: e.to_string(),
                });
                Ok(())
            }
        }
    }
}

/// Wall-clock timestamp in fractional Unix seconds, as the protocol emits.
pub fn now_ts() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{DecodeOptions, DecodeState};
    use crate::vad::VadModel;
    use async_trait::async_trait;
    use parking_lot::Mutex;

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

    struct CountingDecoder;

    #[async_trait]
    impl StreamingDecoder for CountingDecoder {
        async fn transcribe(
            &self,
            samples: &[f32],
            state: &mut DecodeState,
            _opts: &DecodeOptions,
        ) -> Result<()> {
            state.audio.extend_from_slice(samples);
            state.text = format!("<{}>", state.audio.len());
            Ok(())
        }
    }

    fn session() -> Session {
        Session::new(
            "test".into(),
            Arc::new(CountingDecoder),
            Arc::new(Mutex::new(StubVad)),
            None,
            512,
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_ingest_before_config_is_rejected() {
        let mut s = session();
        let err = s.ingest(&[0.0; 512]).await.unwrap_err();
        assert!(matches!(err, Error::ConfigRequired));
    }

    #[tokio::test]
    async fn test_config_overwrite_before_audio_is_allowed() {
        let mut s = session();
        s.apply_config(SessionConfig::default()).unwrap();
        s.apply_config(SessionConfig {
            chunk_size_s: 0.5,
            ..SessionConfig::default()
        })
        .unwrap();
    }

    #[tokio::test]
    async fn test_config_after_audio_is_rejected() {
        let mut s = session();
        s.apply_config(SessionConfig::default()).unwrap();
        s.ingest(&[1.0; 512]).await.unwrap();

        let err = s.apply_config(SessionConfig::default()).unwrap_err();
        assert!(matches!(err, Error::ConfigAfterAudio));
    }

    #[tokio::test]
    async fn test_config_validation_rejects_bad_threshold() {
        let mut s = session();
        let err = s
            .apply_config(SessionConfig {
                vad_threshold: 1.5,
                ..SessionConfig::default()
            })
            .unwrap_err();
        assert!(matches!(err, Error::BadMessage(_)));
        assert!(!s.is_configured());
    }

    #[tokio::test]
    async fn test_closed_session_rejects_everything() {
        let mut s = session();
        s.apply_config(SessionConfig::default()).unwrap();
        s.close();

        assert!(matches!(
            s.ingest(&[1.0; 512]).await.unwrap_err(),
            Error::SessionClosed
        ));
        assert!(matches!(
            s.finalize().await.unwrap_err(),
            Error::SessionClosed
        ));
        assert!(matches!(
            s.apply_config(SessionConfig::default()).unwrap_err(),
            Error::SessionClosed
        ));
    }

    #[tokio::test]
    async fn test_finalize_when_silent_is_noop() {
        let mut s = session();
        s.apply_config(SessionConfig::default()).unwrap();

        s.finalize().await.unwrap();
        assert!(s.take_events().is_empty());
    }

    #[tokio::test]
    async fn test_finalize_mid_speech_emits_final_and_resets() {
        let mut s = session();
        s.apply_config(SessionConfig {
            min_speech_duration_s: 0.0,
            ..SessionConfig::default()
        })
        .unwrap();

        // 0.5s of speech, then an explicit finalize.
        s.ingest(&vec![1.0; 8000]).await.unwrap();
        s.finalize().await.unwrap();

        let events = s.take_events();
        let finals: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, ServerEvent::Final { .. }))
            .collect();
        assert_eq!(finals.len(), 1);
        assert!(!s.is_speaking());

        // A second finalize emits nothing.
        s.finalize().await.unwrap();
        assert!(s.take_events().is_empty());
    }
}
