//! HTTP/WebSocket server
//!
//! Wires the session registry, ingest and segment delivery into one axum
//! router and runs it until shutdown.

use axum::{routing::get, Router};
use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{ProcessesToUpdate, System};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::config::ServerSettings;
use crate::modules::gateway::{self, SegmentGateway};
use crate::modules::health::{self, StreamHealthBoard};
use crate::modules::ingest::{IngestSettings, Transcoder};
use crate::modules::producer;
use crate::modules::public_key;
use crate::modules::registry::SessionRegistry;

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub registry: SessionRegistry,
    pub gateway: Arc<SegmentGateway>,
    pub health: StreamHealthBoard,
    pub ingest: Arc<IngestSettings>,
    pub transcoder: Arc<dyn Transcoder>,
}

impl AppState {
    pub fn new(settings: &ServerSettings, transcoder: Arc<dyn Transcoder>) -> Self {
        let registry = SessionRegistry::new(settings.session_ttl);
        AppState {
            gateway: Arc::new(SegmentGateway::new(
                registry.clone(),
                settings.media_root.clone(),
            )),
            registry,
            health: StreamHealthBoard::new(),
            ingest: Arc::new(settings.ingest_settings()),
            transcoder,
        }
    }

    pub fn media_root(&self) -> &Path {
        &self.ingest.media_root
    }
}

/// Server error
#[derive(Debug)]
pub enum ServerError {
    MediaRoot(std::io::Error),
    BindError(std::io::Error),
    ServeError(std::io::Error),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::MediaRoot(e) => write!(f, "Failed to create media root: {}", e),
            ServerError::BindError(e) => write!(f, "Failed to bind listener: {}", e),
            ServerError::ServeError(e) => write!(f, "Server error: {}", e),
        }
    }
}

impl std::error::Error for ServerError {}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ingest", get(producer::ingest_socket))
        .route("/publickey/:session_id", get(public_key::public_key))
        .route("/health/:session_id", get(health::stream_health))
        .route("/:session_id/:file", get(gateway::segment))
        .with_state(state)
}

/// Periodically drop expired sessions and their health records
pub fn spawn_session_sweeper(state: AppState, interval: Duration) -> Option<JoinHandle<()>> {
    if interval.is_zero() {
        log::info!("Session sweeper disabled");
        return None;
    }
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            for id in state.registry.sweep_expired().await {
                state.health.forget(&id).await;
            }
        }
    }))
}

/// Periodically log CPU and memory usage of this process
pub fn spawn_usage_logger(state: AppState, interval: Duration) -> Option<JoinHandle<()>> {
    if interval.is_zero() {
        return None;
    }
    let pid = match sysinfo::get_current_pid() {
        Ok(pid) => pid,
        Err(e) => {
            log::warn!("Usage logging unavailable: {}", e);
            return None;
        }
    };
    Some(tokio::spawn(async move {
        let mut system = System::new();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // CPU usage is measured between two refreshes
        ticker.tick().await;
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        loop {
            ticker.tick().await;
            system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
            let Some(process) = system.process(pid) else {
                log::debug!("Process {} not visible to usage logger", pid);
                continue;
            };
            let cpu = process.cpu_usage();
            let memory_mb = process.memory() as f64 / 1024.0 / 1024.0;
            log::info!(
                "CPU usage: {:.1}%, memory usage: {:.1}MB, sessions: {}",
                cpu,
                memory_mb,
                state.registry.len().await
            );
        }
    }))
}

/// Serve on an already bound listener until `shutdown` resolves
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), ServerError> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(ServerError::ServeError)
}

/// Bind the configured address and run the server with the sweeper
pub async fn run(
    settings: &ServerSettings,
    transcoder: Arc<dyn Transcoder>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), ServerError> {
    let state = AppState::new(settings, transcoder);
    tokio::fs::create_dir_all(state.media_root())
        .await
        .map_err(ServerError::MediaRoot)?;

    let addr = SocketAddr::new(settings.bind_address, settings.port);
    let listener = TcpListener::bind(addr)
        .await
        .map_err(ServerError::BindError)?;
    log::info!("Listening on {}", addr);
    log::info!(
        "Media root {}, session TTL {:?}",
        state.media_root().display(),
        settings.session_ttl
    );

    let sweeper = spawn_session_sweeper(state.clone(), settings.sweep_interval);
    let usage = spawn_usage_logger(state.clone(), settings.usage_log_interval);
    let result = serve(listener, state, shutdown).await;
    for task in [sweeper, usage].into_iter().flatten() {
        task.abort();
    }
    log::info!("Server stopped");
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::ingest::{TranscodeConfig, TranscodeHandle, TranscoderError};
    use crate::modules::signer;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tempfile::TempDir;
    use tower::ServiceExt;

    struct NoopTranscoder;

    #[async_trait]
    impl Transcoder for NoopTranscoder {
        async fn start(&self, _config: TranscodeConfig) -> Result<TranscodeHandle, TranscoderError> {
            Err(TranscoderError::MissingStdin)
        }
    }

    fn test_state(root: &TempDir) -> AppState {
        let settings = ServerSettings {
            media_root: root.path().to_path_buf(),
            ..ServerSettings::default()
        };
        AppState::new(&settings, Arc::new(NoopTranscoder))
    }

    async fn get(state: &AppState, uri: &str) -> axum::response::Response {
        router(state.clone())
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    #[tokio::test]
    async fn test_public_key_route() {
        let root = TempDir::new().unwrap();
        let state = test_state(&root);
        let session = state.registry.issue().await.unwrap();

        let response = get(&state, &format!("/publickey/{}", session.id)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = String::from_utf8(body_bytes(response).await).unwrap();
        assert_eq!(
            signer::base64_decode(&body).unwrap(),
            session.keys.public_key_der()
        );

        let response = get(&state, &format!("/publickey/{}?format=pem", session.id)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = String::from_utf8(body_bytes(response).await).unwrap();
        assert!(body.starts_with("-----BEGIN PUBLIC KEY-----"));
    }

    #[tokio::test]
    async fn test_public_key_unknown_session() {
        let root = TempDir::new().unwrap();
        let state = test_state(&root);
        let response = get(&state, "/publickey/0123456789abcdef0123456789abcdef").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let response = get(&state, "/publickey/not-a-session").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_segment_route_statuses() {
        let root = TempDir::new().unwrap();
        let state = test_state(&root);
        let session = state.registry.issue().await.unwrap();
        let dir = root.path().join(session.id.as_str());
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("segment0.m4s"), b"segment zero").unwrap();

        let response = get(&state, &format!("/{}/segment0.m4s", session.id)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let hash = response.headers()["x-segment-hash"].to_str().unwrap().to_string();
        let signature = response.headers()["x-segment-signature"]
            .to_str()
            .unwrap()
            .to_string();
        assert_eq!(
            response.headers()["access-control-expose-headers"],
            "X-Segment-Hash, X-Segment-Signature"
        );
        let body = body_bytes(response).await;
        assert_eq!(body, b"segment zero");

        let digest = signer::SegmentDigest::from_hex(&hash).unwrap();
        assert_eq!(digest, signer::digest(&body));
        let signature = signer::SegmentSignature::from_base64(&signature).unwrap();
        assert!(signer::verify(&digest, &signature, session.keys.public_key_der()));

        let response = get(&state, &format!("/{}/segment9.m4s", session.id)).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = get(&state, "/0123456789abcdef0123456789abcdef/seg.m4s").await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = get(&state, &format!("/{}/..%2F..%2Fetc%2Fpasswd", session.id)).await;
        assert_ne!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_manifest_route_is_not_cached() {
        let root = TempDir::new().unwrap();
        let state = test_state(&root);
        let session = state.registry.issue().await.unwrap();
        let dir = root.path().join(session.id.as_str());
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("playlist.m3u8"), b"#EXTM3U\n").unwrap();

        let response = get(&state, &format!("/{}/playlist.m3u8", session.id)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["cache-control"], "no-cache");
        assert!(response.headers().get("x-segment-signature").is_none());
    }

    #[tokio::test]
    async fn test_health_route() {
        let root = TempDir::new().unwrap();
        let state = test_state(&root);
        let session = state.registry.issue().await.unwrap();

        let response = get(&state, &format!("/health/{}", session.id)).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        state.health.open(&session.id).await;
        let response = get(&state, &format!("/health/{}", session.id)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(json["status"], "waiting");
        assert_eq!(json["bytesReceived"], 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_forgets_expired_sessions() {
        let root = TempDir::new().unwrap();
        let state = test_state(&root);
        let session = state.registry.issue().await.unwrap();
        state.health.open(&session.id).await;

        let sweeper = spawn_session_sweeper(state.clone(), Duration::from_secs(60)).unwrap();
        tokio::time::sleep(Duration::from_secs(301)).await;
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(state.registry.len().await, 0);
        assert!(state.health.get(&session.id).await.is_none());
        sweeper.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_stream_updates_do_not_outlive_sweep() {
        let root = TempDir::new().unwrap();
        let state = test_state(&root);
        let session = state.registry.issue().await.unwrap();
        state.health.open(&session.id).await;

        let sweeper = spawn_session_sweeper(state.clone(), Duration::from_secs(60)).unwrap();
        tokio::time::sleep(Duration::from_secs(361)).await;
        assert_eq!(state.registry.len().await, 0);

        // Producer still connected past expiry
        state.health.record_bytes(&session.id, 10).await;
        state
            .health
            .mark(&session.id, health::StreamStatus::Ended)
            .await;

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert!(state.health.get(&session.id).await.is_none());
        assert!(state.health.is_empty().await);
        sweeper.abort();
    }

    #[test]
    fn test_zero_interval_disables_sweeper() {
        let root = TempDir::new().unwrap();
        assert!(spawn_session_sweeper(test_state(&root), Duration::ZERO).is_none());
        assert!(spawn_usage_logger(test_state(&root), Duration::ZERO).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_usage_logger_keeps_running() {
        let root = TempDir::new().unwrap();
        let logger = spawn_usage_logger(test_state(&root), Duration::from_secs(60)).unwrap();
        tokio::time::sleep(Duration::from_secs(181)).await;
        assert!(!logger.is_finished());
        logger.abort();
    }
}
