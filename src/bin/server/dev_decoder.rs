//! Development decoder back-end.
//!
//! Stands in for a real acoustic model so the gateway can be run end to
//! end: it accumulates the utterance audio and reports how much it has
//! heard. Rollback is exercised the same way a real back-end would, so
//! driver behavior under the knobs stays observable.

use async_trait::async_trait;
use voxgate::{DecodeOptions, DecodeState, Result, StreamingDecoder, SAMPLE_RATE};

pub struct DevDecoder;

#[async_trait]
impl StreamingDecoder for DevDecoder {
    async fn transcribe(
        &self,
        samples: &[f32],
        state: &mut DecodeState,
        opts: &DecodeOptions,
    ) -> Result<()> {
        if opts.chunk_id >= opts.unfixed_chunk_num as u64 {
            state.rollback_tokens(opts.unfixed_token_num);
        }

        state.audio.extend_from_slice(samples);
        let secs = state.audio.len() as f32 / SAMPLE_RATE as f32;

        let token = format!("[heard {secs:.1}s]");
        state.text = token.clone();
        state.tokens = vec![token];
        if state.language.is_none() {
            state.language = Some("und".to_owned());
        }
        Ok(())
    }
}
