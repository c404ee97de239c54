//! Streaming decoder contract.
//!
//! The acoustic/language model is an external collaborator. This module
//! pins down the interface the gateway drives it through: a per-utterance
//! [`DecodeState`] record initialized once per utterance, advanced by
//! [`StreamingDecoder::transcribe`] calls that may run remotely, and a set
//! of rollback knobs chosen by the driver but executed inside the decoder.
//!
//! The driver only ever reads `text` and `language` from the state; the
//! remaining fields belong to the decoder implementation.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Rollback knobs passed to every decode call.
///
/// After the first `unfixed_chunk_num` chunks the decoder is expected to
/// roll back the last `unfixed_token_num` tokens of its previous output and
/// re-decode them as a prefix, letting it revise word boundaries that sit
/// astride chunk seams.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DecodeOptions {
    /// Monotonic decode-call counter for the current utterance.
    pub chunk_id: u64,
    /// Number of most-recent chunks whose output is provisional.
    pub unfixed_chunk_num: usize,
    /// Tokens rolled back from the previous decode and re-submitted.
    pub unfixed_token_num: usize,
}

/// Streaming decode state, one per utterance.
///
/// `text` and `language` are the driver-visible surface. `audio` and
/// `tokens` are maintained by the decoder implementation: the audio it has
/// accepted so far and the token tail it may roll back between calls.
#[derive(Debug, Clone, Default)]
pub struct DecodeState {
    /// Full transcript of the utterance so far.
    pub text: String,
    /// Detected (or forced) decode language.
    pub language: Option<String>,
    /// Effective context handed to the model on every call.
    pub context: String,
    /// Audio samples accepted so far.
    pub audio: Vec<f32>,
    /// Token tail kept for prefix rollback.
    pub tokens: Vec<String>,
}

impl DecodeState {
    /// Builds a fresh state. The prompt (a domain hint) and per-call context
    /// are merged into one effective context string, prompt first.
    pub fn new(prompt: &str, context: &str, language: Option<&str>) -> Self {
        Self {
            text: String::new(),
            language: language.map(str::to_owned),
            context: merge_context(prompt, context),
            audio: Vec::new(),
            tokens: Vec::new(),
        }
    }

    /// Removes up to `n` tokens from the tail and truncates `text`
    /// accordingly, retreating to a code-point boundary if the byte cut
    /// would split a multibyte character. Returns the rolled-back tokens
    /// for re-submission as the next decode's prefix.
    pub fn rollback_tokens(&mut self, n: usize) -> Vec<String> {
        let n = n.min(self.tokens.len());
        let rolled = self.tokens.split_off(self.tokens.len() - n);

        let rolled_bytes: usize = rolled.iter().map(|t| t.len()).sum();
        let cut = floor_char_boundary(&self.text, self.text.len().saturating_sub(rolled_bytes));
        self.text.truncate(cut);

        rolled
    }
}

/// Merges the session prompt and per-call context into the effective
/// context the decoder sees.
pub fn merge_context(prompt: &str, context: &str) -> String {
    match (prompt.is_empty(), context.is_empty()) {
        (true, _) => context.to_owned(),
        (false, true) => prompt.to_owned(),
        (false, false) => format!("{prompt}\n\n{context}"),
    }
}

/// Largest byte index `<= index` that lies on a char boundary of `s`.
pub fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut index = index;
    while !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

/// A streaming-capable decoder back-end.
///
/// One instance serves the whole process; `transcribe` takes `&self` and
/// must tolerate concurrent calls from different sessions. Per-utterance
/// state travels in the [`DecodeState`] the caller owns.
#[async_trait]
pub trait StreamingDecoder: Send + Sync {
    /// Initializes decode state for a new utterance.
    fn init_state(&self, prompt: &str, context: &str, language: Option<&str>) -> DecodeState {
        DecodeState::new(prompt, context, language)
    }

    /// Decodes one audio chunk, advancing `state` in place. `state.text`
    /// must hold the full utterance transcript (valid UTF-8 by
    /// construction) after the call returns.
    async fn transcribe(
        &self,
        samples: &[f32],
        state: &mut DecodeState,
        opts: &DecodeOptions,
    ) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_context() {
        assert_eq!(merge_context("", ""), "");
        assert_eq!(merge_context("medical terms", ""), "medical terms");
        assert_eq!(merge_context("", "call notes"), "call notes");
        assert_eq!(
            merge_context("medical terms", "call notes"),
            "medical terms\n\ncall notes"
        );
    }

    #[test]
    fn test_floor_char_boundary_ascii() {
        assert_eq!(floor_char_boundary("hello", 3), 3);
        assert_eq!(floor_char_boundary("hello", 99), 5);
    }

    #[test]
    fn test_floor_char_boundary_multibyte() {
        let s = "héllo"; // 'é' spans bytes 1..3
        assert_eq!(floor_char_boundary(s, 2), 1);
        assert_eq!(floor_char_boundary(s, 3), 3);
    }

    #[test]
    fn test_rollback_trims_tokens_and_text() {
        let mut state = DecodeState::new("", "", None);
        state.tokens = vec!["foo".into(), " bar".into(), " baz".into()];
        state.text = "foo bar baz".into();

        let rolled = state.rollback_tokens(2);
        assert_eq!(rolled, vec![" bar".to_string(), " baz".to_string()]);
        assert_eq!(state.text, "foo");
        assert_eq!(state.tokens, vec!["foo".to_string()]);
    }

    #[test]
    fn test_rollback_never_splits_code_points() {
        let mut state = DecodeState::new("", "", None);
        // Token byte lengths deliberately misaligned with the text's
        // character boundaries.
        state.tokens = vec!["日本".into(), "語x".into()];
        state.text = "日本語".into(); // 9 bytes

        // Rolling back "語x" (4 bytes) would cut at byte 5, mid-'本'.
        state.rollback_tokens(1);
        assert!(state.text.is_char_boundary(state.text.len()));
        assert_eq!(state.text, "日");
    }

    #[test]
    fn test_rollback_more_than_available() {
        let mut state = DecodeState::new("", "", None);
        state.tokens = vec!["a".into()];
        state.text = "a".into();

        let rolled = state.rollback_tokens(10);
        assert_eq!(rolled.len(), 1);
        assert!(state.text.is_empty());
        assert!(state.tokens.is_empty());
    }

    #[test]
    fn test_init_state_carries_language() {
        let state = DecodeState::new("p", "c", Some("en"));
        assert_eq!(state.language.as_deref(), Some("en"));
        assert_eq!(state.context, "p\n\nc");
        assert!(state.text.is_empty());
    }
}
