//! WebSocket streaming ASR gateway server.
//!
//! Serves the recognition endpoint at `/ws/asr`, a browser test client at
//! `/`, and a health probe at `/healthz`. All operational knobs are flags
//! with environment-variable fallbacks; none of them change the protocol.
//!
//! TLS is expected to be terminated by a reverse proxy in front of this
//! process, which is also where authentication belongs.

mod dev_decoder;
mod ws;

use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use voxgate::{
    SessionConfig, SessionManager, SharedVadModel, SileroVad, StreamingDecoder,
    ALLOWED_FRAME_SIZES, DEFAULT_FRAME_SIZE,
};

use axum::extract::State;
use axum::response::Html;
use axum::routing::get;
use axum::{Json, Router};

#[derive(Parser, Debug)]
#[command(name = "voxgate-server")]
#[command(about = "Real-time streaming speech recognition gateway")]
struct Args {
    /// Listen host
    #[arg(long, env = "VOXGATE_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Listen port
    #[arg(long, env = "VOXGATE_PORT", default_value_t = 8000)]
    port: u16,

    /// Path to the Silero VAD ONNX model
    #[arg(long, env = "VOXGATE_VAD_MODEL", default_value = "silero_vad.onnx")]
    vad_model: String,

    /// VAD analysis frame size in samples (512, 1024 or 1536)
    #[arg(long, env = "VOXGATE_FRAME_SIZE", default_value_t = DEFAULT_FRAME_SIZE)]
    frame_size: usize,

    /// Enable RNNoise suppression ahead of the VAD
    #[arg(long, env = "VOXGATE_DENOISE")]
    denoise: bool,

    /// Maximum concurrent sessions; excess connections are rejected
    #[arg(long, env = "VOXGATE_MAX_SESSIONS", default_value_t = 100)]
    max_sessions: usize,

    /// Idle session TTL in seconds
    #[arg(long, env = "VOXGATE_IDLE_TTL", default_value_t = 600)]
    idle_ttl_secs: u64,

    /// Upper bound on a single decoder call in seconds
    #[arg(long, env = "VOXGATE_DECODE_TIMEOUT", default_value_t = 30)]
    decode_timeout_secs: u64,

    /// Default VAD speech probability threshold
    #[arg(long, default_value_t = 0.5)]
    vad_threshold: f32,

    /// Default seconds of silence that trigger endpointing
    #[arg(long, default_value_t = 0.8)]
    silence_threshold: f32,

    /// Default minimum speech duration in seconds
    #[arg(long, default_value_t = 0.2)]
    min_speech_duration: f32,

    /// Default decode chunk size in seconds
    #[arg(long, default_value_t = 1.0)]
    chunk_size_sec: f32,

    /// Default number of provisional decode chunks
    #[arg(long, default_value_t = 4)]
    unfixed_chunk_num: usize,

    /// Default number of tokens rolled back between decodes
    #[arg(long, default_value_t = 5)]
    unfixed_token_num: usize,

    /// Default decode language (auto-detect when unset)
    #[arg(long, env = "VOXGATE_LANGUAGE")]
    default_language: Option<String>,

    /// Default decoder prompt
    #[arg(long, env = "VOXGATE_PROMPT")]
    default_prompt: Option<String>,

    /// Default decoder context
    #[arg(long, env = "VOXGATE_CONTEXT")]
    default_context: Option<String>,
}

/// Shared state handed to every request handler.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SessionManager>,
    pub decoder: Arc<dyn StreamingDecoder>,
    pub vad: SharedVadModel,
    pub defaults: SessionConfig,
    pub frame_size: usize,
    pub decode_timeout: Duration,
    pub denoise: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    if !ALLOWED_FRAME_SIZES.contains(&args.frame_size) {
        return Err(format!(
            "frame size {} not allowed; pick one of {:?}",
            args.frame_size, ALLOWED_FRAME_SIZES
        )
        .into());
    }

    tracing::info!("loading VAD model from {}", args.vad_model);
    let vad = SileroVad::load(&args.vad_model)?.into_shared();

    let defaults = SessionConfig {
        vad_threshold: args.vad_threshold,
        silence_threshold_s: args.silence_threshold,
        min_speech_duration_s: args.min_speech_duration,
        chunk_size_s: args.chunk_size_sec,
        unfixed_chunk_num: args.unfixed_chunk_num,
        unfixed_token_num: args.unfixed_token_num,
        language: args.default_language.clone(),
        prompt: args.default_prompt.clone().unwrap_or_default(),
        context: args.default_context.clone().unwrap_or_default(),
    };
    defaults.validate()?;

    let manager = Arc::new(SessionManager::new(
        args.max_sessions,
        Duration::from_secs(args.idle_ttl_secs),
    ));
    let _sweeper = manager.start_sweeper(Duration::from_secs(60));

    let state = AppState {
        manager: manager.clone(),
        decoder: Arc::new(dev_decoder::DevDecoder),
        vad,
        defaults,
        frame_size: args.frame_size,
        decode_timeout: Duration::from_secs(args.decode_timeout_secs),
        denoise: args.denoise,
    };

    let app = Router::new()
        .route("/", get(index))
        .route("/healthz", get(healthz))
        .route("/ws/asr", get(ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    tracing::info!("listening on http://{addr} (ws endpoint: /ws/asr)");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    manager.shutdown_all();
    tracing::info!("server shutdown complete");
    Ok(())
}

async fn index() -> Html<&'static str> {
    Html(include_str!("index.html"))
}

async fn healthz(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "sessions": state.manager.count(),
    }))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl+C, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}
