//! Producer WebSocket transport
//!
//! One connection is one stream session. On connect the producer is handed
//! its stream key; afterwards every binary frame is media for the ingest
//! pipeline. A failed ingest is reported with a single `streamError`
//! message before the server closes the socket.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::health::StreamStatus;
use super::ingest::pipeline::{IngestPipeline, IngestSignal, PROCESSING_ERROR};
use super::registry::SessionId;
use crate::server::AppState;

/// Server to producer messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ProducerEvent {
    #[serde(rename_all = "camelCase")]
    StreamKey {
        stream_key: String,
        /// Unix time in milliseconds
        expires_at: i64,
    },
    StreamError { reason: String },
}

impl ProducerEvent {
    fn to_message(&self) -> Option<Message> {
        match serde_json::to_string(self) {
            Ok(json) => Some(Message::Text(json)),
            Err(e) => {
                log::error!("Failed to encode producer event: {}", e);
                None
            }
        }
    }
}

/// `GET /ingest`
pub async fn ingest_socket(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_producer(socket, state))
}

async fn send_event(socket: &mut WebSocket, event: &ProducerEvent) -> bool {
    let Some(message) = event.to_message() else {
        return false;
    };
    socket.send(message).await.is_ok()
}

/// Report a terminal ingest failure and close the socket
async fn send_failure(socket: &mut WebSocket, reason: &str) {
    let event = ProducerEvent::StreamError {
        reason: reason.to_string(),
    };
    if !send_event(socket, &event).await {
        log::debug!("Producer gone before stream error could be sent");
    }
    let _ = socket.send(Message::Close(None)).await;
}

async fn handle_producer(mut socket: WebSocket, state: AppState) {
    let session = match state.registry.issue().await {
        Ok(session) => session,
        Err(e) => {
            log::error!("Session issuance failed: {}", e);
            send_failure(&mut socket, PROCESSING_ERROR).await;
            return;
        }
    };
    let session_id: SessionId = session.id.clone();
    // Tracked until the sweeper forgets the expired session
    state.health.open(&session_id).await;

    let greeting = ProducerEvent::StreamKey {
        stream_key: session_id.to_string(),
        expires_at: session.expires_at_unix_ms(),
    };
    if !send_event(&mut socket, &greeting).await {
        log::warn!("[{}] Producer left before receiving its stream key", session_id);
        return;
    }
    log::info!("[{}] Producer connected", session_id);

    let mut pipeline = IngestPipeline::new(
        session_id.clone(),
        state.ingest.clone(),
        state.transcoder.clone(),
    );
    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Binary(data))) => {
                        state.health.record_bytes(&session_id, data.len()).await;
                        if let Err(e) = pipeline.on_data(Bytes::from(data)).await {
                            log::error!("[{}] Ingest failed: {}", session_id, e);
                            state.health.mark(&session_id, StreamStatus::Failed).await;
                            send_failure(&mut socket, e.producer_reason()).await;
                            break;
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        log::warn!("[{}] Ignoring text frame ({} bytes)", session_id, text.len());
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::warn!("[{}] Producer socket error: {}", session_id, e);
                        break;
                    }
                }
            }
            signal = pipeline.next_signal() => {
                match signal {
                    IngestSignal::Failed(reason) => {
                        state.health.mark(&session_id, StreamStatus::Failed).await;
                        send_failure(&mut socket, &reason).await;
                    }
                    IngestSignal::Ended => {
                        let _ = socket.send(Message::Close(None)).await;
                    }
                }
                break;
            }
        }
    }

    pipeline.on_disconnect().await;
    // A failed stream keeps its failed status
    state.health.mark(&session_id, StreamStatus::Ended).await;
    log::info!("[{}] Producer disconnected", session_id);
}
