//! Client message protocol and connection handling.
//!
//! Text messages are tagged JSON (`config`, `finalize`); binary messages
//! are raw little-endian float32 PCM, mono, 16 kHz, with no framing header.
//! [`Connection`] is the transport-agnostic half of the WebSocket endpoint:
//! it parses inbound messages, drives the session, and yields the events to
//! write back, leaving only socket plumbing to the binary.

use crate::error::{Error, Result};
use crate::session::{Session, SessionConfig};
use serde::{Deserialize, Serialize};

/// Server → client events, serialized as tagged JSON text messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    SessionCreated {
        session_id: String,
    },
    Partial {
        language: String,
        text: String,
        timestamp: f64,
    },
    Final {
        language: String,
        text: String,
        timestamp: f64,
        is_speech_final: bool,
    },
    Error {
        message: String,
    },
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error {
            message: message.into(),
        }
    }

    /// The client-facing rendering of an error. Protocol-level errors use
    /// the bare wire message; everything else uses the error's display
    /// form.
    pub fn from_error(err: &Error) -> Self {
        let message = match err {
            Error::ConfigRequired => "config required".to_owned(),
            Error::BadMessage(detail) => detail.clone(),
            other => other.to_string(),
        };
        ServerEvent::Error { message }
    }
}

/// Recognized fields of the client's `config` message. Every field is
/// optional; omitted ones fall back to the server defaults. Unknown fields
/// are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigMessage {
    pub context: Option<String>,
    pub language: Option<String>,
    pub prompt: Option<String>,
    pub unfixed_chunk_num: Option<usize>,
    pub unfixed_token_num: Option<usize>,
    pub chunk_size_sec: Option<f32>,
    pub vad_threshold: Option<f32>,
    pub silence_threshold: Option<f32>,
    pub min_speech_duration: Option<f32>,
}

impl ConfigMessage {
    /// Overlays this message on the server's default configuration.
    pub fn apply_to(&self, base: &SessionConfig) -> SessionConfig {
        let mut config = base.clone();
        if let Some(context) = &self.context {
            config.context = context.clone();
        }
        if let Some(language) = &self.language {
            config.language = Some(language.clone());
        }
        if let Some(prompt) = &self.prompt {
            config.prompt = prompt.clone();
        }
        if let Some(n) = self.unfixed_chunk_num {
            config.unfixed_chunk_num = n;
        }
        if let Some(n) = self.unfixed_token_num {
            config.unfixed_token_num = n;
        }
        if let Some(s) = self.chunk_size_sec {
            config.chunk_size_s = s;
        }
        if let Some(t) = self.vad_threshold {
            config.vad_threshold = t;
        }
        if let Some(s) = self.silence_threshold {
            config.silence_threshold_s = s;
        }
        if let Some(s) = self.min_speech_duration {
            config.min_speech_duration_s = s;
        }
        config
    }
}

/// A parsed client control message.
#[derive(Debug)]
pub enum ClientMessage {
    Config(ConfigMessage),
    Finalize,
}

/// Parses a text message, distinguishing malformed JSON from an
/// unrecognized `type` so the client sees the right error.
pub fn parse_client_message(text: &str) -> Result<ClientMessage> {
    let value: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| Error::BadMessage(format!("invalid JSON: {e}")))?;

    match value.get("type").and_then(|t| t.as_str()) {
        Some("config") => {
            let msg: ConfigMessage = serde_json::from_value(value)
                .map_err(|e| Error::BadMessage(format!("invalid config: {e}")))?;
            Ok(ClientMessage::Config(msg))
        }
        Some("finalize") => Ok(ClientMessage::Finalize),
        Some(_) => Err(Error::BadMessage("unknown message type".to_owned())),
        None => Err(Error::BadMessage("missing message type".to_owned())),
    }
}

/// Decodes a binary audio payload into samples.
pub fn decode_pcm_f32le(data: &[u8]) -> Result<Vec<f32>> {
    if data.len() % 4 != 0 {
        return Err(Error::BadMessage(format!(
            "audio payload of {} bytes is not float32-aligned",
            data.len()
        )));
    }
    Ok(data
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

/// Drives one session from parsed inbound messages.
///
/// The first message must be a valid `config`; until then audio is
/// rejected with `config required`. `session_created` is sent exactly once,
/// after the first config is accepted and before any audio is decoded.
pub struct Connection {
    session: Session,
    defaults: SessionConfig,
    announced: bool,
    done: bool,
}

impl Connection {
    pub fn new(session: Session, defaults: SessionConfig) -> Self {
        Self {
            session,
            defaults,
            announced: false,
            done: false,
        }
    }

    pub fn session_id(&self) -> &str {
        self.session.id()
    }

    /// True once a fatal error has closed the session; the caller should
    /// flush the returned events and drop the connection.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Handles one text message and returns the events to send.
    pub async fn handle_text(&mut self, text: &str) -> Vec<ServerEvent> {
        if self.done {
            return Vec::new();
        }
        match parse_client_message(text) {
            Ok(ClientMessage::Config(msg)) => {
                let config = msg.apply_to(&self.defaults);
                match self.session.apply_config(config) {
                    Ok(()) => {
                        let mut events = Vec::new();
                        if !self.announced {
                            self.announced = true;
                            events.push(ServerEvent::SessionCreated {
                                session_id: self.session.id().to_owned(),
                            });
                        }
                        events
                    }
                    Err(e) => self.events_for_error(e),
                }
            }
            Ok(ClientMessage::Finalize) => {
                let result = self.session.finalize().await;
                self.collect(result)
            }
            Err(e) => self.events_for_error(e),
        }
    }

    /// Handles one binary (audio) message and returns the events to send.
    pub async fn handle_binary(&mut self, data: &[u8]) -> Vec<ServerEvent> {
        if self.done {
            return Vec::new();
        }
        let samples = match decode_pcm_f32le(data) {
            Ok(samples) => samples,
            Err(e) => return self.events_for_error(e),
        };
        let result = self.session.ingest(&samples).await;
        self.collect(result)
    }

    /// Tears the session down (client disconnect or server shutdown). No
    /// further events are produced.
    pub fn close(&mut self) {
        self.session.close();
        self.done = true;
    }

    fn collect(&mut self, result: Result<()>) -> Vec<ServerEvent> {
        let mut events = self.session.take_events();
        if let Err(e) = result {
            events.extend(self.events_for_error(e));
        }
        events
    }

    fn events_for_error(&mut self, err: Error) -> Vec<ServerEvent> {
        // Use-after-close is ignored silently; everything else is reported.
        if matches!(err, Error::SessionClosed) {
            return Vec::new();
        }
        let event = ServerEvent::from_error(&err);
        if err.is_fatal() {
            tracing::error!(session = %self.session.id(), error = %err, "fatal session error");
            self.session.close();
            self.done = true;
        }
        vec![event]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config_message() {
        let msg = parse_client_message(
            r#"{"type":"config","language":"en","chunk_size_sec":0.5,"future_field":1}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::Config(cfg) => {
                assert_eq!(cfg.language.as_deref(), Some("en"));
                assert_eq!(cfg.chunk_size_sec, Some(0.5));
                assert!(cfg.prompt.is_none());
            }
            other => panic!("expected config, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_finalize() {
        assert!(matches!(
            parse_client_message(r#"{"type":"finalize"}"#).unwrap(),
            ClientMessage::Finalize
        ));
    }

    #[test]
    fn test_parse_null_language_means_auto() {
        let msg = parse_client_message(r#"{"type":"config","language":null}"#).unwrap();
        match msg {
            ClientMessage::Config(cfg) => assert!(cfg.language.is_none()),
            other => panic!("expected config, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_unknown_type() {
        let err = parse_client_message(r#"{"type":"reboot"}"#).unwrap_err();
        assert!(matches!(err, Error::BadMessage(m) if m == "unknown message type"));
    }

    #[test]
    fn test_parse_garbage() {
        assert!(matches!(
            parse_client_message("not json at all"),
            Err(Error::BadMessage(_))
        ));
    }

    #[test]
    fn test_config_overlay_keeps_defaults() {
        let msg = ConfigMessage {
            vad_threshold: Some(0.7),
            ..ConfigMessage::default()
        };
        let config = msg.apply_to(&SessionConfig::default());
        assert_eq!(config.vad_threshold, 0.7);
        assert_eq!(config.silence_threshold_s, 0.8);
        assert_eq!(config.unfixed_chunk_num, 4);
    }

    #[test]
    fn test_decode_pcm() {
        let mut data = Vec::new();
        data.extend_from_slice(&0.5f32.to_le_bytes());
        data.extend_from_slice(&(-1.0f32).to_le_bytes());
        assert_eq!(decode_pcm_f32le(&data).unwrap(), vec![0.5, -1.0]);
    }

    #[test]
    fn test_decode_pcm_misaligned() {
        assert!(matches!(
            decode_pcm_f32le(&[0, 1, 2]),
            Err(Error::BadMessage(_))
        ));
    }

    #[test]
    fn test_event_json_shapes() {
        let json = serde_json::to_string(&ServerEvent::SessionCreated {
            session_id: "abc".into(),
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"session_created","session_id":"abc"}"#);

        let json = serde_json::to_string(&ServerEvent::Final {
            language: "en".into(),
            text: "hi".into(),
            timestamp: 1.5,
            is_speech_final: true,
        })
        .unwrap();
        assert!(json.contains(r#""type":"final""#));
        assert!(json.contains(r#""is_speech_final":true"#));
    }

    #[test]
    fn test_error_event_wording() {
        let event = ServerEvent::from_error(&Error::ConfigRequired);
        assert_eq!(event, ServerEvent::error("config required"));

        let event = ServerEvent::from_error(&Error::BadMessage("unknown message type".into()));
        assert_eq!(event, ServerEvent::error("unknown message type"));
    }
}
