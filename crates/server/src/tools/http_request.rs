//! The `http_request` tool: the proxied outbound pipeline.
//!
//! Order of checks: route lookup, URL construction, endpoint allowlist,
//! header merge, rate-limit admission, dispatch.  The limiter runs *after*
//! the allowlist so a denied endpoint never drains the caller's budget.
//! Upstream non-2xx statuses and bodies are returned verbatim — the caller
//! decides what they mean.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;
use url::Url;

use dl_domain::resolve::{self, ResolvedRoute};
use dl_domain::{ErrorKind, ProxyError};

use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HttpRequestInput {
    connection: String,
    method: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    query: HashMap<String, String>,
    #[serde(default)]
    body: Option<Value>,
}

pub async fn run(state: &AppState, caller_alias: &str, input: Value) -> Result<Value, ProxyError> {
    let input: HttpRequestInput = serde_json::from_value(input)
        .map_err(|e| ProxyError::new(ErrorKind::MalformedMessage, format!("bad input: {e}")))?;

    // 1. Route lookup under the caller's enablement.
    let caller = state.config.caller(caller_alias)?;
    let raw = resolve::caller_routes(&state.config, caller_alias)?;
    let routes = resolve::resolve_routes(&raw, caller)?;
    let route = resolve::match_route(&input.connection, &routes)?;

    // 2. Effective URL.
    let url = build_url(route, &input)?;

    // 3. Endpoint allowlist.
    if !resolve::is_endpoint_allowed(url.as_str(), &route.allowed_endpoints) {
        return Err(ProxyError::new(
            ErrorKind::EndpointDenied,
            format!("endpoint not allowed for {}: {url}", route.alias),
        ));
    }

    // 4. Header merge (template wins for secret-derived headers).
    let headers = merge_headers(route, &input.headers);

    // 5. Rate-limit admission.
    if !state.limiter.try_admit(caller_alias) {
        return Err(ProxyError::new(
            ErrorKind::RateLimited,
            format!(
                "rate limit of {}/min reached",
                state.config.rate_limit_per_minute
            ),
        ));
    }

    // 6. Dispatch.  Transport failure is UpstreamError; any HTTP status is a
    //    successful proxy result.
    let method = reqwest::Method::from_bytes(input.method.to_ascii_uppercase().as_bytes())
        .map_err(|_| {
            ProxyError::new(
                ErrorKind::MalformedMessage,
                format!("invalid method: {}", input.method),
            )
        })?;
    let mut request = state.http.request(method, url);
    for (name, value) in &headers {
        request = request.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &input.body {
        request = request.json(body);
    }

    let response = request
        .send()
        .await
        .map_err(|e| ProxyError::new(ErrorKind::UpstreamError, format!("dispatch failed: {e}")))?;

    let status = response.status().as_u16();
    let response_headers: HashMap<String, String> = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
    let body = response.text().await.map_err(|e| {
        ProxyError::new(ErrorKind::UpstreamError, format!("reading body failed: {e}"))
    })?;

    Ok(serde_json::json!({
        "status": status,
        "headers": response_headers,
        "body": body,
    }))
}

/// Join the base URL with `path`, or take `url` verbatim, then append the
/// caller's query pairs.
fn build_url(route: &ResolvedRoute, input: &HttpRequestInput) -> Result<Url, ProxyError> {
    let raw = match (&input.url, &input.path) {
        (Some(url), _) => url.clone(),
        (None, Some(path)) => {
            let base = route.base_url.as_deref().ok_or_else(|| {
                ProxyError::new(
                    ErrorKind::MalformedMessage,
                    format!("connection {} has no baseUrl; pass a full url", route.alias),
                )
            })?;
            format!(
                "{}/{}",
                base.trim_end_matches('/'),
                path.trim_start_matches('/')
            )
        }
        (None, None) => {
            return Err(ProxyError::new(
                ErrorKind::MalformedMessage,
                "either url or path is required",
            ))
        }
    };

    let mut url = Url::parse(&raw)
        .map_err(|e| ProxyError::new(ErrorKind::MalformedMessage, format!("bad url: {e}")))?;
    if !input.query.is_empty() {
        let mut sorted: Vec<(&String, &String)> = input.query.iter().collect();
        sorted.sort();
        let mut pairs = url.query_pairs_mut();
        for (name, value) in sorted {
            pairs.append_pair(name, value);
        }
    }
    Ok(url)
}

/// Template headers first; caller headers override everything except
/// placeholder-derived template headers (e.g. Authorization).
fn merge_headers(route: &ResolvedRoute, caller_headers: &HashMap<String, String>) -> Vec<(String, String)> {
    let mut merged: Vec<(String, String)> = route
        .headers
        .iter()
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    merged.sort();

    for (name, value) in caller_headers {
        if route.protected_headers.contains(&name.to_ascii_lowercase()) {
            continue;
        }
        match merged
            .iter_mut()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
        {
            Some(slot) => slot.1 = value.clone(),
            None => merged.push((name.clone(), value.clone())),
        }
    }
    merged
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::test_support::fixture;
    use std::collections::HashSet;

    fn resolved_route() -> ResolvedRoute {
        ResolvedRoute {
            alias: "api".into(),
            allowed_endpoints: vec!["https://api.github.com/**".into()],
            base_url: Some("https://api.github.com".into()),
            headers: HashMap::from([
                ("Authorization".to_string(), "Bearer tok".to_string()),
                ("Accept".to_string(), "application/json".to_string()),
            ]),
            protected_headers: HashSet::from(["authorization".to_string()]),
            secrets: HashMap::new(),
            ingestor: None,
        }
    }

    fn input(json: Value) -> HttpRequestInput {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn path_joins_base_url() {
        let url = build_url(
            &resolved_route(),
            &input(serde_json::json!({
                "connection": "api", "method": "GET", "path": "/repos/x"
            })),
        )
        .unwrap();
        assert_eq!(url.as_str(), "https://api.github.com/repos/x");
    }

    #[test]
    fn explicit_url_wins_over_path() {
        let url = build_url(
            &resolved_route(),
            &input(serde_json::json!({
                "connection": "api", "method": "GET",
                "url": "https://api.github.com/user", "path": "/ignored"
            })),
        )
        .unwrap();
        assert_eq!(url.as_str(), "https://api.github.com/user");
    }

    #[test]
    fn query_pairs_are_appended() {
        let url = build_url(
            &resolved_route(),
            &input(serde_json::json!({
                "connection": "api", "method": "GET", "path": "/search",
                "query": {"q": "drawlatch", "per_page": "5"}
            })),
        )
        .unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.github.com/search?per_page=5&q=drawlatch"
        );
    }

    #[test]
    fn missing_url_and_path_is_malformed() {
        let err = build_url(
            &resolved_route(),
            &input(serde_json::json!({"connection": "api", "method": "GET"})),
        )
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::MalformedMessage);
    }

    #[test]
    fn caller_cannot_override_protected_headers() {
        let route = resolved_route();
        let merged = merge_headers(
            &route,
            &HashMap::from([
                ("authorization".to_string(), "Bearer forged".to_string()),
                ("Accept".to_string(), "text/plain".to_string()),
                ("X-Extra".to_string(), "1".to_string()),
            ]),
        );
        let get = |name: &str| {
            merged
                .iter()
                .find(|(n, _)| n.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
        };
        assert_eq!(get("authorization"), Some("Bearer tok"));
        assert_eq!(get("accept"), Some("text/plain"));
        assert_eq!(get("x-extra"), Some("1"));
    }

    #[tokio::test]
    async fn denied_endpoint_does_not_charge_the_limiter() {
        let (state, _dir) = fixture(2);
        let err = run(
            &state,
            "agent",
            serde_json::json!({
                "connection": "api",
                "method": "GET",
                "url": "https://evil.example/x",
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::EndpointDenied);
        assert_eq!(state.limiter.in_flight("agent"), 0);
    }

    #[tokio::test]
    async fn unknown_connection_is_rejected() {
        let (state, _dir) = fixture(2);
        let err = run(
            &state,
            "agent",
            serde_json::json!({
                "connection": "nope",
                "method": "GET",
                "url": "https://api.github.com/x",
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnknownConnection);
    }
}
