//! Stream health tracking
//!
//! Records the coarse lifecycle of each producer stream so operators and
//! viewers can tell a live stream from a dead one.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::registry::SessionId;
use crate::server::AppState;

/// Lifecycle status of a producer stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    /// Session issued, no media received yet
    Waiting,
    /// Media is flowing
    Active,
    /// Producer disconnected
    Ended,
    /// Ingest failed and the producer was notified
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamHealth {
    pub status: StreamStatus,
    pub last_update: DateTime<Utc>,
    pub bytes_received: u64,
}

/// Shared per-session health records
#[derive(Clone, Default)]
pub struct StreamHealthBoard {
    entries: Arc<RwLock<HashMap<SessionId, StreamHealth>>>,
}

impl StreamHealthBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a freshly issued session as `Waiting`
    pub async fn open(&self, id: &SessionId) {
        self.entries.write().await.insert(
            id.clone(),
            StreamHealth {
                status: StreamStatus::Waiting,
                last_update: Utc::now(),
                bytes_received: 0,
            },
        );
    }

    /// Set the status of a tracked stream.
    ///
    /// A failed stream stays failed; later `Ended` marks are ignored.
    /// Untracked ids, including ones already swept, are left alone.
    pub async fn mark(&self, id: &SessionId, status: StreamStatus) {
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get_mut(id) else {
            return;
        };
        if entry.status == StreamStatus::Failed && status == StreamStatus::Ended {
            return;
        }
        entry.status = status;
        entry.last_update = Utc::now();
    }

    /// Count received media bytes and mark the stream active
    pub async fn record_bytes(&self, id: &SessionId, len: usize) {
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get_mut(id) else {
            return;
        };
        if entry.status == StreamStatus::Waiting {
            entry.status = StreamStatus::Active;
        }
        entry.bytes_received = entry.bytes_received.saturating_add(len as u64);
        entry.last_update = Utc::now();
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn get(&self, id: &SessionId) -> Option<StreamHealth> {
        self.entries.read().await.get(id).cloned()
    }

    pub async fn forget(&self, id: &SessionId) {
        self.entries.write().await.remove(id);
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        (StatusCode::NOT_FOUND, Json(self)).into_response()
    }
}

/// `GET /health/:session_id`
pub async fn stream_health(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<StreamHealth>, ErrorResponse> {
    let not_found = || ErrorResponse {
        error: "session_not_found".to_string(),
        message: "Stream not found or expired".to_string(),
    };

    let id = SessionId::parse(&session_id).ok_or_else(not_found)?;
    state.registry.lookup(&id).await.ok_or_else(not_found)?;
    state.health.get(&id).await.map(Json).ok_or_else(not_found)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_status_progression() {
        let board = StreamHealthBoard::new();
        let id = SessionId::generate();

        board.open(&id).await;
        assert_eq!(board.get(&id).await.unwrap().status, StreamStatus::Waiting);

        board.record_bytes(&id, 100).await;
        board.record_bytes(&id, 28).await;
        let health = board.get(&id).await.unwrap();
        assert_eq!(health.status, StreamStatus::Active);
        assert_eq!(health.bytes_received, 128);

        board.mark(&id, StreamStatus::Ended).await;
        assert_eq!(board.get(&id).await.unwrap().status, StreamStatus::Ended);
    }

    #[tokio::test]
    async fn test_failed_is_sticky() {
        let board = StreamHealthBoard::new();
        let id = SessionId::generate();
        board.open(&id).await;

        board.mark(&id, StreamStatus::Failed).await;
        board.mark(&id, StreamStatus::Ended).await;
        assert_eq!(board.get(&id).await.unwrap().status, StreamStatus::Failed);
    }

    #[tokio::test]
    async fn test_forget() {
        let board = StreamHealthBoard::new();
        let id = SessionId::generate();
        board.open(&id).await;
        board.forget(&id).await;
        assert!(board.get(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_updates_never_recreate_forgotten_entries() {
        let board = StreamHealthBoard::new();
        let id = SessionId::generate();
        board.open(&id).await;
        board.forget(&id).await;

        board.record_bytes(&id, 10).await;
        board.mark(&id, StreamStatus::Ended).await;
        board.mark(&id, StreamStatus::Failed).await;
        assert!(board.get(&id).await.is_none());
        assert!(board.is_empty().await);
    }

    #[test]
    fn test_health_json_shape() {
        let health = StreamHealth {
            status: StreamStatus::Active,
            last_update: DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            bytes_received: 42,
        };
        let json = serde_json::to_value(&health).unwrap();
        assert_eq!(json["status"], "active");
        assert_eq!(json["bytesReceived"], 42);
        assert_eq!(json["lastUpdate"], "2024-01-01T00:00:00Z");
    }
}
