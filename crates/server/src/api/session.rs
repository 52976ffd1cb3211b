//! The sealed request endpoint.

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Json, Response};

use dl_domain::{ErrorKind, ProxyError};
use dl_protocol::{EncryptedEnvelope, ProxyRequest, ProxyResponse};

use crate::api::error_response;
use crate::state::AppState;
use crate::tools;

/// `POST /session/:id/request` — open the envelope, dispatch the tool call,
/// seal the response.
///
/// A channel failure (bad MAC, replayed counter) evicts the session
/// immediately; the caller must re-handshake.  Tool-level failures, by
/// contrast, travel *inside* the sealed `ProxyResponse`.
pub async fn request(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(envelope): Json<EncryptedEnvelope>,
) -> Response {
    let Some(session) = state.sessions.get(&session_id) else {
        return error_response(ProxyError::new(ErrorKind::SessionNotFound, "unknown session"));
    };
    session.touch();

    let plaintext = {
        let mut channel = session.channel.lock();
        channel.open(&envelope.nonce, &envelope.ciphertext)
    };
    let plaintext = match plaintext {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(
                session_id = %session_id,
                caller = %session.caller_alias,
                error = %e,
                "channel authentication failed, closing session"
            );
            state.sessions.remove(&session_id);
            return error_response(e.into());
        }
    };

    let response = match serde_json::from_slice::<ProxyRequest>(&plaintext) {
        Ok(request) => {
            tracing::debug!(
                session_id = %session_id,
                caller = %session.caller_alias,
                tool = %request.tool,
                request_id = %request.request_id,
                "dispatching tool call"
            );
            tools::dispatch(&state, &session.caller_alias, request).await
        }
        Err(e) => ProxyResponse::failure(
            "",
            ProxyError::new(ErrorKind::MalformedMessage, format!("bad request frame: {e}")),
        ),
    };

    let bytes = match serde_json::to_vec(&response) {
        Ok(b) => b,
        Err(e) => {
            return error_response(ProxyError::new(
                ErrorKind::UpstreamError,
                format!("response serialization: {e}"),
            ))
        }
    };
    let sealed = {
        let mut channel = session.channel.lock();
        channel.seal(&bytes)
    };
    match sealed {
        Ok((nonce, ciphertext)) => Json(EncryptedEnvelope { nonce, ciphertext }).into_response(),
        Err(e) => {
            state.sessions.remove(&session_id);
            error_response(e.into())
        }
    }
}
