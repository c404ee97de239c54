//! WebSocket endpoint plumbing.
//!
//! Each accepted connection gets three tasks: a reader that forwards socket
//! messages into a bounded inbound queue, the pipeline task that owns the
//! session and drives recognition, and a writer that serializes outbound
//! events. The bounded queue is what gives the pipeline backpressure
//! against a client that streams faster than the decoder keeps up.

use crate::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use voxgate::{Connection, NoiseFilter, RnnoiseFilter, ServerEvent, Session, SessionHandle};

/// Inbound queue depth. Small enough that a congested pipeline pushes back
/// on the socket read loop quickly.
const INBOUND_QUEUE: usize = 64;
const OUTBOUND_QUEUE: usize = 256;

enum Inbound {
    Text(String),
    Binary(Vec<u8>),
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let handle = match state.manager.register() {
        Ok(handle) => handle,
        Err(e) => {
            reject(socket, &e.to_string()).await;
            return;
        }
    };
    let session_id = handle.id().to_owned();

    let filter = state
        .denoise
        .then(|| Box::new(RnnoiseFilter::new()) as Box<dyn NoiseFilter>);
    let session = Session::new(
        session_id.clone(),
        state.decoder.clone(),
        state.vad.clone(),
        filter,
        state.frame_size,
        state.decode_timeout,
    );
    let mut conn = Connection::new(session, state.defaults.clone());

    let (sink, stream) = socket.split();
    let (event_tx, event_rx) = mpsc::channel::<ServerEvent>(OUTBOUND_QUEUE);
    let (inbound_tx, mut inbound_rx) = mpsc::channel::<Inbound>(INBOUND_QUEUE);

    let writer = tokio::spawn(write_events(sink, event_rx));
    let reader = tokio::spawn(read_socket(stream, inbound_tx, handle.clone()));

    loop {
        tokio::select! {
            inbound = inbound_rx.recv() => {
                let events = match inbound {
                    Some(Inbound::Text(text)) => conn.handle_text(&text).await,
                    Some(Inbound::Binary(data)) => conn.handle_binary(&data).await,
                    // Reader finished: client disconnected.
                    None => break,
                };
                if !forward(&event_tx, events).await || conn.is_done() {
                    break;
                }
            }
            _ = handle.closed() => {
                tracing::info!(session = %session_id, "closed by server (idle or shutdown)");
                break;
            }
        }
    }

    conn.close();
    state.manager.retire(&session_id);
    reader.abort();
    drop(event_tx);
    let _ = writer.await;
    tracing::debug!(session = %session_id, "connection finished");
}

/// Sends events to the writer; false when the writer is gone.
async fn forward(event_tx: &mpsc::Sender<ServerEvent>, events: Vec<ServerEvent>) -> bool {
    for event in events {
        if event_tx.send(event).await.is_err() {
            return false;
        }
    }
    true
}

async fn read_socket(
    mut stream: futures_util::stream::SplitStream<WebSocket>,
    inbound_tx: mpsc::Sender<Inbound>,
    handle: SessionHandle,
) {
    while let Some(Ok(message)) = stream.next().await {
        handle.touch();
        let inbound = match message {
            Message::Text(text) => Inbound::Text(text.to_string()),
            Message::Binary(data) => Inbound::Binary(data.to_vec()),
            Message::Close(_) => break,
            // Ping/pong are handled by the protocol layer.
            _ => continue,
        };
        if inbound_tx.send(inbound).await.is_err() {
            break;
        }
    }
}

async fn write_events(
    mut sink: futures_util::stream::SplitSink<WebSocket, Message>,
    mut event_rx: mpsc::Receiver<ServerEvent>,
) {
    while let Some(event) = event_rx.recv().await {
        let text = match serde_json::to_string(&event) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize event");
                continue;
            }
        };
        if sink.send(Message::Text(text.into())).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}

/// Turns away a connection that exceeded the session cap, before any
/// session state exists.
async fn reject(mut socket: WebSocket, message: &str) {
    let event = ServerEvent::error(message);
    if let Ok(text) = serde_json::to_string(&event) {
        let _ = socket.send(Message::Text(text.into())).await;
    }
    let _ = socket.close().await;
}
