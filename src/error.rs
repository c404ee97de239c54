//! Error types for the gateway.
//!
//! Errors fall into two classes: recoverable per-message/per-chunk errors
//! that are reported to the client and leave the session running, and fatal
//! errors that end the session. `Error::is_fatal` makes the split explicit
//! so the pipeline task has a single place to decide.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed control message from the client.
    #[error("bad message: {0}")]
    BadMessage(String),

    /// Audio arrived before a valid `config` message.
    #[error("config required")]
    ConfigRequired,

    /// A `config` message arrived after audio was already processed.
    #[error("config cannot be changed after audio has been processed")]
    ConfigAfterAudio,

    /// A frame of a size the VAD model does not accept reached the gate.
    /// This is a programming error upstream of the gate, not a client error.
    #[error("invalid VAD frame size: {0} samples")]
    InvalidFrameSize(usize),

    /// A single decoder call failed; the chunk is dropped and the session
    /// continues.
    #[error("transient decode failure: {0}")]
    DecodeTransient(String),

    /// Decoder state is no longer trustworthy; the session must end.
    #[error("fatal decode failure: {0}")]
    DecodeFatal(String),

    /// The maximum concurrent session count was reached.
    #[error("server busy")]
    ServerBusy,

    /// Operation on a session that has already been closed.
    #[error("session closed")]
    SessionClosed,

    /// VAD model inference failed.
    #[error("vad: {0}")]
    Vad(String),
}

impl Error {
    /// Whether this error invalidates the session it occurred in.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::InvalidFrameSize(_) | Error::DecodeFatal(_) | Error::SessionClosed
        )
    }
}

impl From<ort::Error> for Error {
    fn from(e: ort::Error) -> Self {
        Error::Vad(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_split() {
        assert!(Error::InvalidFrameSize(900).is_fatal());
        assert!(Error::DecodeFatal("state corrupt".into()).is_fatal());
        assert!(!Error::DecodeTransient("timeout".into()).is_fatal());
        assert!(!Error::BadMessage("not json".into()).is_fatal());
    }
}
