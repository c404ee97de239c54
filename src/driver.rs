//! Decode orchestration for one session.
//!
//! The driver buffers gated speech audio and calls the decoder at a
//! configured cadence rather than per frame (per-frame would be wasteful,
//! end-of-utterance-only would give no partials). It owns the per-utterance
//! [`DecodeState`], deduplicates partial text, flushes residual audio on
//! utterance end, and escalates repeated decode failures.

use crate::decoder::{DecodeOptions, DecodeState, StreamingDecoder};
use crate::error::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

/// Consecutive transient failures after which decoder state is considered
/// corrupted and the session must end.
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Driver knobs taken from the session config.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Target audio duration per streaming-decode call, in samples.
    pub chunk_size_samples: usize,
    pub unfixed_chunk_num: usize,
    pub unfixed_token_num: usize,
    /// Upper bound on a single decoder call; beyond it the chunk is
    /// dropped as a transient failure.
    pub decode_timeout: Duration,
}

/// A new partial transcript, emitted only when the text changed.
#[derive(Debug, Clone)]
pub struct PartialUpdate {
    pub language: String,
    pub text: String,
}

/// The finished utterance produced on speech end.
#[derive(Debug, Clone)]
pub struct UtteranceFinal {
    pub language: String,
    pub text: String,
    /// A transient decode failure during the flush, if one occurred. The
    /// final transcript is still whatever the state held before the flush.
    pub flush_error: Option<String>,
}

/// Drives the shared decoder back-end for one session.
pub struct DecoderDriver {
    decoder: Arc<dyn StreamingDecoder>,
    config: DriverConfig,
    // Per-session decode configuration, reused across utterances.
    prompt: String,
    context: String,
    language: Option<String>,
    // Per-utterance state.
    state: DecodeState,
    pending_audio: Vec<f32>,
    chunk_id: u64,
    last_partial_text: String,
    consecutive_failures: u32,
}

impl DecoderDriver {
    pub fn new(
        decoder: Arc<dyn StreamingDecoder>,
        config: DriverConfig,
        prompt: String,
        context: String,
        language: Option<String>,
    ) -> Self {
        let state = decoder.init_state(&prompt, &context, language.as_deref());
        Self {
            decoder,
            config,
            prompt,
            context,
            language,
            state,
            pending_audio: Vec::new(),
            chunk_id: 0,
            last_partial_text: String::new(),
            consecutive_failures: 0,
        }
    }

    /// Buffers utterance audio and decodes once a full chunk has
    /// accumulated. Returns a partial update when the decoder produced new
    /// text.
    ///
    /// Transient errors drop the buffered chunk and surface as
    /// `DecodeTransient`; after [`MAX_CONSECUTIVE_FAILURES`] of them the
    /// error becomes `DecodeFatal`.
    pub async fn on_speech(&mut self, samples: &[f32]) -> Result<Option<PartialUpdate>> {
        self.pending_audio.extend_from_slice(samples);

        if self.pending_audio.len() < self.config.chunk_size_samples {
            return Ok(None);
        }

        self.decode_pending().await?;
        Ok(self.take_partial_update())
    }

    /// Flushes residual audio and closes out the utterance.
    ///
    /// The flush decode captures trailing syllables sitting in the pending
    /// buffer (including the preserved silence tail). A transient flush
    /// failure is reported inside the result rather than as an error so the
    /// final transcript is never lost; fatal escalation still propagates.
    pub async fn finish_utterance(&mut self) -> Result<UtteranceFinal> {
        let flush_error = if self.pending_audio.is_empty() {
            None
        } else {
            match self.decode_pending().await {
                Ok(()) => None,
                Err(e @ Error::DecodeFatal(_)) => return Err(e),
                Err(e) => Some(e.to_string()),
            }
        };

        let result = UtteranceFinal {
            language: self.state.language.clone().unwrap_or_default(),
            text: self.state.text.clone(),
            flush_error,
        };

        self.reset_utterance();
        Ok(result)
    }

    /// Discards the utterance in progress and starts a clean decode context
    /// with the same prompt/context/language.
    pub fn reset_utterance(&mut self) {
        self.state = self
            .decoder
            .init_state(&self.prompt, &self.context, self.language.as_deref());
        self.pending_audio.clear();
        self.chunk_id = 0;
        self.last_partial_text.clear();
        self.consecutive_failures = 0;
    }

    /// Samples buffered since the last decode call.
    pub fn pending_samples(&self) -> usize {
        self.pending_audio.len()
    }

    /// Appends utterance tail audio without triggering a decode. Used at
    /// finalize for the sub-frame remainder that never reached the VAD.
    pub fn push_tail(&mut self, samples: &[f32]) {
        self.pending_audio.extend_from_slice(samples);
    }

    async fn decode_pending(&mut self) -> Result<()> {
        let audio = std::mem::take(&mut self.pending_audio);
        let opts = DecodeOptions {
            chunk_id: self.chunk_id,
            unfixed_chunk_num: self.config.unfixed_chunk_num,
            unfixed_token_num: self.config.unfixed_token_num,
        };

        let outcome = timeout(
            self.config.decode_timeout,
            self.decoder.transcribe(&audio, &mut self.state, &opts),
        )
        .await;

        match outcome {
            Ok(Ok(())) => {
                self.chunk_id += 1;
                self.consecutive_failures = 0;
                Ok(())
            }
            Ok(Err(e)) => self.record_failure(e.to_string()),
            Err(_) => self.record_failure(format!(
                "decode exceeded {:?} for chunk {}",
                self.config.decode_timeout, self.chunk_id
            )),
        }
    }

    fn record_failure(&mut self, detail: String) -> Result<()> {
        self.consecutive_failures += 1;
        tracing::warn!(
            failures = self.consecutive_failures,
            chunk = self.chunk_id,
            "decode failure: {detail}"
        );
        if self.consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
            Err(Error::DecodeFatal(format!(
                "{MAX_CONSECUTIVE_FAILURES} consecutive decode failures, last: {detail}"
            )))
        } else {
            Err(Error::DecodeTransient(detail))
        }
    }

    fn take_partial_update(&mut self) -> Option<PartialUpdate> {
        if self.state.text.is_empty() || self.state.text == self.last_partial_text {
            return None;
        }
        self.last_partial_text = self.state.text.clone();
        Some(PartialUpdate {
            language: self.state.language.clone().unwrap_or_default(),
            text: self.state.text.clone(),
        })
    }
}
