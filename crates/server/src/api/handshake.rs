//! Handshake endpoints: Init and Finish legs.

use axum::extract::State;
use axum::response::{IntoResponse, Json, Response};

use dl_crypto::handshake;
use dl_protocol::{HandshakeFinish, HandshakeInit};
use dl_domain::{ErrorKind, ProxyError};

use crate::api::error_response;
use crate::state::AppState;

/// `POST /handshake/init` — verify the caller and answer with the Reply leg.
///
/// The pending session is parked until Finish arrives (or expires).
pub async fn init(State(state): State<AppState>, Json(msg): Json<HandshakeInit>) -> Response {
    let bundles = state.peer_bundles();
    match handshake::respond(&state.keys, &msg, &bundles) {
        Ok((pending, reply)) => {
            // respond() only succeeds for registered fingerprints.
            let alias = state
                .peers
                .get(&pending.client_fingerprint)
                .map(|peer| peer.alias.clone())
                .unwrap_or_default();
            tracing::info!(
                caller = %alias,
                session_id = %pending.session_keys.session_id,
                "handshake initiated"
            );
            state.pending.insert(pending, alias);
            Json(reply).into_response()
        }
        Err(e) => {
            tracing::warn!(error = %e, "handshake init rejected");
            error_response(e.into())
        }
    }
}

/// `POST /handshake/finish` — verify the client's Finish signature and
/// promote the pending handshake to a live session.
pub async fn finish(State(state): State<AppState>, Json(msg): Json<HandshakeFinish>) -> Response {
    let Some((pending, caller_alias)) = state.pending.take(&msg.session_id) else {
        return error_response(ProxyError::new(
            ErrorKind::SessionNotFound,
            "no pending handshake for that session",
        ));
    };

    if let Err(e) = handshake::finish(&pending, &msg) {
        tracing::warn!(caller = %caller_alias, error = %e, "handshake finish rejected");
        return error_response(e.into());
    }

    let channel = dl_crypto::EncryptedChannel::new(&pending.session_keys);
    let session = state.sessions.insert(
        caller_alias.clone(),
        pending.client_fingerprint.clone(),
        channel,
    );
    tracing::info!(
        caller = %caller_alias,
        session_id = %session.id,
        "session established"
    );
    Json(serde_json::json!({ "ok": true })).into_response()
}
