//! Public key endpoint
//!
//! Viewers fetch a session's public key here before checking any segment
//! signature. The default body is the base64 of the SPKI DER encoding.

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Deserialize;

use super::registry::SessionId;
use super::signer;
use crate::server::AppState;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyFormat {
    /// Base64 of the DER bytes
    #[default]
    Der,
    /// `PUBLIC KEY` PEM document
    Pem,
}

#[derive(Debug, Default, Deserialize)]
pub struct PublicKeyQuery {
    #[serde(default)]
    pub format: KeyFormat,
}

/// `GET /publickey/:session_id`
pub async fn public_key(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<PublicKeyQuery>,
) -> Response {
    let Some(id) = SessionId::parse(&session_id) else {
        return not_found();
    };
    let Some(der) = state.registry.public_key_of(&id).await else {
        return not_found();
    };

    let (body, content_type) = match query.format {
        KeyFormat::Der => (signer::base64_encode(&der), "text/plain; charset=utf-8"),
        KeyFormat::Pem => (signer::public_key_pem(&der), "application/x-pem-file"),
    };
    (
        [
            (header::CONTENT_TYPE, HeaderValue::from_static(content_type)),
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*")),
        ],
        body,
    )
        .into_response()
}

fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        [(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"))],
        "Stream not found or expired",
    )
        .into_response()
}
