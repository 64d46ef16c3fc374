//! Segment Gateway
//!
//! Serves transcoder output to viewers. Media segments are hashed and signed
//! with the owning session's key at request time; the hash and signature
//! travel in response headers, never in the body.
//!
//! Every request is gated on a valid session, and the requested file must
//! resolve inside that session's own directory.

use axum::{
    extract::{Path, State},
    http::{
        header::{
            ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_EXPOSE_HEADERS, CACHE_CONTROL,
            CONTENT_TYPE,
        },
        HeaderName, HeaderValue, StatusCode,
    },
    response::{IntoResponse, Response},
};
use std::io::ErrorKind;
use std::path::{Component, PathBuf};

use super::registry::{SessionId, SessionRegistry};
use super::signer::{self, SegmentDigest, SegmentSignature, SignerError};
use crate::server::AppState;

pub const SEGMENT_HASH_HEADER: HeaderName = HeaderName::from_static("x-segment-hash");
pub const SEGMENT_SIGNATURE_HEADER: HeaderName = HeaderName::from_static("x-segment-signature");
const EXPOSED_HEADERS: &str = "X-Segment-Hash, X-Segment-Signature";

/// Kinds of files the gateway will serve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetKind {
    /// fMP4 media segment (`.m4s`), signed
    Segment,
    /// HLS playlist (`.m3u8`)
    Manifest,
    /// fMP4 initialization segment (`.mp4`)
    InitSegment,
}

impl AssetKind {
    pub fn from_file_name(name: &str) -> Option<Self> {
        let (_, extension) = name.rsplit_once('.')?;
        match extension {
            "m4s" => Some(AssetKind::Segment),
            "m3u8" => Some(AssetKind::Manifest),
            "mp4" => Some(AssetKind::InitSegment),
            _ => None,
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            AssetKind::Segment => "video/iso.segment",
            AssetKind::Manifest => "application/vnd.apple.mpegurl",
            AssetKind::InitSegment => "video/mp4",
        }
    }

    pub fn is_signed(&self) -> bool {
        matches!(self, AssetKind::Segment)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Stream key is invalid or expired")]
    Forbidden,

    #[error("File not found")]
    NotFound,

    #[error("Failed to read segment: {0}")]
    Read(#[source] std::io::Error),

    #[error("Failed to sign segment: {0}")]
    Signing(#[from] SignerError),
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = match &self {
            GatewayError::Forbidden => StatusCode::FORBIDDEN,
            GatewayError::NotFound => StatusCode::NOT_FOUND,
            GatewayError::Read(_) | GatewayError::Signing(_) => {
                log::error!("Segment request failed: {}", self);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let message = if status.is_server_error() {
            "Internal Server Error".to_string()
        } else {
            self.to_string()
        };
        (
            status,
            [(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"))],
            message,
        )
            .into_response()
    }
}

/// Hash and signature of a served segment
#[derive(Debug, Clone)]
pub struct SegmentIntegrity {
    pub digest: SegmentDigest,
    pub signature: SegmentSignature,
}

/// A file ready to be returned to a viewer
#[derive(Debug)]
pub struct ServedAsset {
    pub body: Vec<u8>,
    pub kind: AssetKind,
    /// Present for signed kinds
    pub integrity: Option<SegmentIntegrity>,
}

impl IntoResponse for ServedAsset {
    fn into_response(self) -> Response {
        let mut headers = vec![
            (CONTENT_TYPE, HeaderValue::from_static(self.kind.content_type())),
            (ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*")),
        ];
        if self.kind == AssetKind::Manifest {
            headers.push((CACHE_CONTROL, HeaderValue::from_static("no-cache")));
        }
        if let Some(integrity) = &self.integrity {
            let hash = HeaderValue::from_str(&integrity.digest.to_hex());
            let signature = HeaderValue::from_str(&integrity.signature.to_base64());
            let (Ok(hash), Ok(signature)) = (hash, signature) else {
                log::error!("Integrity values are not valid header values");
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            };
            headers.push((SEGMENT_HASH_HEADER, hash));
            headers.push((SEGMENT_SIGNATURE_HEADER, signature));
            headers.push((
                ACCESS_CONTROL_EXPOSE_HEADERS,
                HeaderValue::from_static(EXPOSED_HEADERS),
            ));
        }

        let mut response = self.body.into_response();
        for (name, value) in headers {
            response.headers_mut().insert(name, value);
        }
        response
    }
}

/// Accept only a single plain file name
fn is_plain_file_name(name: &str) -> bool {
    if name.is_empty() || name.starts_with('.') || name.contains(['/', '\\', '\0']) {
        return false;
    }
    let mut components = std::path::Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

fn not_found_or_read(e: std::io::Error) -> GatewayError {
    match e.kind() {
        ErrorKind::NotFound => GatewayError::NotFound,
        _ => GatewayError::Read(e),
    }
}

#[derive(Clone)]
pub struct SegmentGateway {
    registry: SessionRegistry,
    media_root: PathBuf,
}

impl SegmentGateway {
    pub fn new(registry: SessionRegistry, media_root: impl Into<PathBuf>) -> Self {
        SegmentGateway {
            registry,
            media_root: media_root.into(),
        }
    }

    /// Serve `file_name` from the directory of `session_id`.
    ///
    /// The whole file is read (and signed) before anything is returned.
    pub async fn serve(&self, session_id: &str, file_name: &str) -> Result<ServedAsset, GatewayError> {
        let id = SessionId::parse(session_id).ok_or(GatewayError::Forbidden)?;
        let session = self
            .registry
            .lookup(&id)
            .await
            .ok_or(GatewayError::Forbidden)?;

        let kind = AssetKind::from_file_name(file_name)
            .filter(|_| is_plain_file_name(file_name))
            .ok_or_else(|| {
                log::warn!("[{}] Rejected file name {:?}", id, file_name);
                GatewayError::NotFound
            })?;

        let path = self.resolve(&id, file_name).await?;
        let body = tokio::fs::read(&path).await.map_err(not_found_or_read)?;

        let integrity = if kind.is_signed() {
            let digest = signer::digest(&body);
            let signature = signer::sign(&digest, session.keys.signing_key())?;
            Some(SegmentIntegrity { digest, signature })
        } else {
            None
        };

        log::debug!("[{}] Serving {} ({} bytes)", id, file_name, body.len());
        Ok(ServedAsset {
            body,
            kind,
            integrity,
        })
    }

    /// Resolve a file inside the session directory, following symlinks
    async fn resolve(&self, id: &SessionId, file_name: &str) -> Result<PathBuf, GatewayError> {
        let session_dir = tokio::fs::canonicalize(self.media_root.join(id.as_str()))
            .await
            .map_err(not_found_or_read)?;
        let candidate = tokio::fs::canonicalize(session_dir.join(file_name))
            .await
            .map_err(not_found_or_read)?;

        if candidate.parent() != Some(session_dir.as_path()) {
            log::warn!(
                "[{}] {} resolves outside the session directory",
                id,
                file_name
            );
            return Err(GatewayError::NotFound);
        }
        Ok(candidate)
    }
}

/// `GET /:session_id/:file`
pub async fn segment(
    State(state): State<AppState>,
    Path((session_id, file)): Path<(String, String)>,
) -> Result<ServedAsset, GatewayError> {
    state.gateway.serve(&session_id, &file).await
}
