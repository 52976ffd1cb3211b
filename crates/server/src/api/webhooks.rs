//! Public webhook intake — `POST /webhooks/:path`.
//!
//! The raw body is handed to every running webhook ingestor mounted at the
//! path; each verifies its own signature scheme.  One acceptance is enough
//! for a 202.

use std::collections::HashMap;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};

use crate::state::AppState;

pub async fn receive(
    State(state): State<AppState>,
    Path(path): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let ingestors = state.ingestors.webhook_ingestors(&path);
    if ingestors.is_empty() {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "accepted": false,
                "reason": "no webhook ingestor mounted at this path",
            })),
        )
            .into_response();
    }

    let headers = lowercase_headers(&headers);
    let mut rejection: Option<String> = None;
    let mut accepted = 0usize;
    for ingestor in &ingestors {
        let outcome = ingestor.handle_webhook(&headers, &body).await;
        if outcome.accepted {
            accepted += 1;
        } else if rejection.is_none() {
            rejection = outcome.reason;
        }
    }

    if accepted > 0 {
        tracing::info!(path = %path, accepted, "webhook delivered");
        (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "accepted": true })),
        )
            .into_response()
    } else {
        (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({
                "accepted": false,
                "reason": rejection.unwrap_or_else(|| "rejected".into()),
            })),
        )
            .into_response()
    }
}

fn lowercase_headers(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect()
}
