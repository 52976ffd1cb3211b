//! Tool dispatch: the surface callers reach through the encrypted channel.
//!
//! Validation and authorization failures are *returned* as
//! `ProxyResponse { ok: false, error }`, never raised — only channel-level
//! failures escape to the HTTP layer.

pub mod admin;
pub mod events;
pub mod http_request;

use serde_json::Value;

use dl_domain::resolve::{self, RouteSummary};
use dl_domain::{ErrorKind, ProxyError};
use dl_protocol::{ProxyRequest, ProxyResponse};

use crate::state::AppState;

pub async fn dispatch(state: &AppState, caller_alias: &str, request: ProxyRequest) -> ProxyResponse {
    match route_tool(state, caller_alias, &request.tool, request.input).await {
        Ok(result) => ProxyResponse::success(request.request_id, result),
        Err(error) => {
            tracing::debug!(
                caller = %caller_alias,
                tool = %request.tool,
                kind = ?error.kind,
                "tool call failed"
            );
            ProxyResponse::failure(request.request_id, error)
        }
    }
}

async fn route_tool(
    state: &AppState,
    caller_alias: &str,
    tool: &str,
    input: Value,
) -> Result<Value, ProxyError> {
    match tool {
        "http_request" => http_request::run(state, caller_alias, input).await,
        "list_routes" => list_routes(state, caller_alias),
        "poll_events" => events::poll_events(state, caller_alias, input),
        "ingestor_status" => events::ingestor_status(state, caller_alias, input),
        "ingestor_start" => events::ingestor_start(state, caller_alias, input).await,
        "ingestor_stop" => events::ingestor_stop(state, caller_alias, input).await,
        "ingestor_restart" => events::ingestor_restart(state, caller_alias, input).await,
        t if t.starts_with("admin_") => admin::run(state, caller_alias, t, input).await,
        other => Err(ProxyError::new(
            ErrorKind::MalformedMessage,
            format!("unknown tool: {other}"),
        )),
    }
}

/// `list_routes` — the caller's resolved route summaries, secrets redacted.
///
/// Routes whose placeholders cannot resolve fall back to the raw template
/// summary rather than failing the whole listing.
fn list_routes(state: &AppState, caller_alias: &str) -> Result<Value, ProxyError> {
    let caller = state.config.caller(caller_alias)?;
    let raw = resolve::caller_routes(&state.config, caller_alias)?;
    let summaries: Vec<RouteSummary> = raw
        .iter()
        .map(|route| {
            resolve::resolve_routes(std::slice::from_ref(route), caller)
                .map(|resolved| RouteSummary::of_resolved(&resolved[0]))
                .unwrap_or_else(|_| RouteSummary::of_route(route))
        })
        .collect();
    Ok(serde_json::json!({ "routes": summaries }))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━


#[cfg(test)]
mod tests {
    use super::*;
    use dl_domain::ErrorKind;

    #[tokio::test]
    async fn unknown_tool_is_a_malformed_request() {
        let (state, _dir) = test_support::fixture(60);
        let request = ProxyRequest {
            request_id: "r-1".into(),
            tool: "does_not_exist".into(),
            input: serde_json::json!({}),
        };
        let response = dispatch(&state, "agent", request).await;
        assert!(!response.ok);
        assert_eq!(response.error.unwrap().kind, ErrorKind::MalformedMessage);
        assert_eq!(response.request_id, "r-1");
    }

    #[tokio::test]
    async fn list_routes_redacts_and_names_connections() {
        let (state, _dir) = test_support::fixture(60);
        let request = ProxyRequest {
            request_id: "r-2".into(),
            tool: "list_routes".into(),
            input: serde_json::Value::Null,
        };
        let response = dispatch(&state, "agent", request).await;
        assert!(response.ok);
        let routes = response.result.unwrap();
        let aliases: Vec<&str> = routes["routes"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["alias"].as_str().unwrap())
            .collect();
        assert_eq!(aliases, vec!["api", "hooks"]);
    }

    #[tokio::test]
    async fn unknown_caller_is_rejected() {
        let (state, _dir) = test_support::fixture(60);
        let request = ProxyRequest {
            request_id: "r-3".into(),
            tool: "list_routes".into(),
            input: serde_json::Value::Null,
        };
        let response = dispatch(&state, "stranger", request).await;
        assert_eq!(response.error.unwrap().kind, ErrorKind::UnknownCaller);
    }
}
