//! HTTP surface of the remote server.
//!
//! - `POST /handshake/init`       — first handshake leg
//! - `POST /handshake/finish`     — third handshake leg
//! - `POST /session/:id/request`  — sealed tool call
//! - `POST /webhooks/:path`       — public webhook intake
//! - `GET  /healthz`              — liveness

pub mod handshake;
pub mod session;
pub mod webhooks;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use dl_domain::{ErrorKind, ProxyError};

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/handshake/init", post(handshake::init))
        .route("/handshake/finish", post(handshake::finish))
        .route("/session/:id/request", post(session::request))
        .route("/webhooks/:path", post(webhooks::receive))
        .route("/healthz", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "ok": true,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Tagged error as an HTTP response: `{ "error": { "kind", "message" } }`.
pub(crate) fn error_response(err: ProxyError) -> Response {
    let status = match err.kind {
        ErrorKind::SessionNotFound => StatusCode::NOT_FOUND,
        ErrorKind::UnknownPeer
        | ErrorKind::InvalidSignature
        | ErrorKind::ReplayDetected
        | ErrorKind::TimestampSkew
        | ErrorKind::NotAuthorized => StatusCode::UNAUTHORIZED,
        _ => StatusCode::BAD_REQUEST,
    };
    (status, Json(serde_json::json!({ "error": err }))).into_response()
}
