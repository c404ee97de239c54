//! # voxgate
//!
//! Real-time streaming speech recognition gateway.
//!
//! A client opens a WebSocket, streams raw 16 kHz float32 audio, and
//! receives incremental partial transcripts while speaking plus a final
//! transcript when it pauses. The server performs voice activity detection,
//! endpointing, and chunked streaming decodes against a pluggable decoder
//! back-end that keeps per-utterance state and supports token-prefix
//! rollback at chunk seams.
//!
//! ## Pipeline
//!
//! ```text
//! socket → Connection → Session.ingest
//!        → (NoiseFilter) → FrameBuffer → VadGate → Endpointer
//!        → DecoderDriver → events → socket
//! ```
//!
//! Sessions run one per connection, serialized internally and parallel
//! across connections. The decoder back-end and the VAD model are
//! process-wide resources shared by all sessions.
//!
//! ## Quick start
//!
//! ```ignore
//! let vad = SileroVad::load("silero_vad.onnx")?.into_shared();
//! let session = Session::new(id, decoder, vad, None, DEFAULT_FRAME_SIZE, timeout);
//! let mut conn = Connection::new(session, SessionConfig::default());
//!
//! let events = conn.handle_text(r#"{"type":"config"}"#).await;
//! let events = conn.handle_binary(&pcm_bytes).await;
//! ```

pub mod audio;
pub mod decoder;
pub mod denoise;
pub mod driver;
pub mod endpoint;
mod error;
pub mod manager;
pub mod protocol;
pub mod session;
pub mod vad;

pub use error::{Error, Result};

pub use audio::{AudioFrame, FrameBuffer, SAMPLE_RATE};
pub use decoder::{DecodeOptions, DecodeState, StreamingDecoder};
pub use denoise::{NoiseFilter, Passthrough, RnnoiseFilter};
pub use driver::{DecoderDriver, DriverConfig, PartialUpdate, UtteranceFinal};
pub use endpoint::{EndpointEvent, Endpointer, EndpointerConfig};
pub use manager::{SessionHandle, SessionManager};
pub use protocol::{ClientMessage, ConfigMessage, Connection, ServerEvent};
pub use session::{Session, SessionConfig};
pub use vad::{
    SharedVadModel, SileroVad, VadGate, VadModel, ALLOWED_FRAME_SIZES, DEFAULT_FRAME_SIZE,
};
