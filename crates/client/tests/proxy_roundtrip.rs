//! End-to-end tests: a real remote server (with an in-process upstream
//! service), a real handshake, and tool calls over the sealed channel.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use axum::routing::get;
use axum::Json;
use tempfile::TempDir;

use dl_client::ProxyClient;
use dl_crypto::KeyBundle;
use dl_domain::config::{CallerConfig, CallerRole, RemoteConfig, Route};
use dl_domain::ErrorKind;
use dl_server::api;
use dl_server::state::AppState;

struct Harness {
    base_url: String,
    state: AppState,
    client_keys: KeyBundle,
    client_peers_dir: PathBuf,
    _dir: TempDir,
}

/// Spin up an upstream echo service and a drawlatch remote configured with
/// one caller (`agent`) enabled for the `svc` connection.
async fn harness(role: CallerRole, rate_limit: u32) -> Harness {
    let dir = TempDir::new().unwrap();

    // ── Upstream the proxy is allowed to reach ───────────────────────
    let upstream = axum::Router::new().route(
        "/ok",
        get(|| async { Json(serde_json::json!({ "upstream": "ok" })) }),
    );
    let upstream_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream_listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(upstream_listener, upstream).await.unwrap();
    });

    // ── Identities ───────────────────────────────────────────────────
    let server_keys = KeyBundle::generate();
    server_keys.save(&dir.path().join("keys/server")).unwrap();

    let client_keys = KeyBundle::generate();
    client_keys
        .public()
        .save(&dir.path().join("keys/peers/agent/agent.pub"))
        .unwrap();

    let client_peers_dir = dir.path().join("client-peers");
    server_keys
        .public()
        .save(&client_peers_dir.join("remote.pub"))
        .unwrap();

    // ── Config ───────────────────────────────────────────────────────
    let config = RemoteConfig {
        host: "127.0.0.1".into(),
        port: 0,
        local_keys_dir: "keys/server".into(),
        callers: HashMap::from([(
            "agent".to_string(),
            CallerConfig {
                name: Some("Agent".into()),
                peer_key_dir: "keys/peers/agent".into(),
                connections: vec!["svc".into()],
                env: HashMap::new(),
                role,
                ingestor_overrides: HashMap::new(),
            },
        )]),
        connectors: vec![Route {
            alias: "svc".into(),
            allowed_endpoints: vec![format!("http://{upstream_addr}/**")],
            base_url: Some(format!("http://{upstream_addr}")),
            secrets: HashMap::new(),
            headers: HashMap::new(),
            ingestor: None,
        }],
        rate_limit_per_minute: rate_limit,
        request_timeout_ms: 5_000,
        session_idle_secs: 1800,
    };
    std::fs::write(
        dir.path().join("remote.config.json"),
        serde_json::to_string_pretty(&config).unwrap(),
    )
    .unwrap();

    // ── The remote itself ────────────────────────────────────────────
    let state = AppState::build(config, dir.path()).unwrap();
    let app = api::router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Harness {
        base_url: format!("http://{addr}"),
        state,
        client_keys,
        client_peers_dir,
        _dir: dir,
    }
}

#[tokio::test]
async fn handshake_then_list_routes() {
    let h = harness(CallerRole::User, 60).await;
    let client = ProxyClient::connect(&h.base_url, &h.client_keys, &h.client_peers_dir, None)
        .await
        .unwrap();

    assert_eq!(h.state.sessions.len(), 1);

    let routes = client.call("list_routes", serde_json::Value::Null).await.unwrap();
    let aliases: Vec<&str> = routes["routes"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["alias"].as_str().unwrap())
        .collect();
    assert_eq!(aliases, vec!["svc"]);
}

#[tokio::test]
async fn proxied_http_request_hits_the_upstream() {
    let h = harness(CallerRole::User, 60).await;
    let client = ProxyClient::connect(&h.base_url, &h.client_keys, &h.client_peers_dir, None)
        .await
        .unwrap();

    let result = client
        .call(
            "http_request",
            serde_json::json!({"connection": "svc", "method": "GET", "path": "/ok"}),
        )
        .await
        .unwrap();
    assert_eq!(result["status"], 200);
    let body: serde_json::Value =
        serde_json::from_str(result["body"].as_str().unwrap()).unwrap();
    assert_eq!(body["upstream"], "ok");
}

#[tokio::test]
async fn third_request_in_the_window_is_rate_limited() {
    let h = harness(CallerRole::User, 2).await;
    let client = ProxyClient::connect(&h.base_url, &h.client_keys, &h.client_peers_dir, None)
        .await
        .unwrap();

    let input = serde_json::json!({"connection": "svc", "method": "GET", "path": "/ok"});
    for _ in 0..2 {
        let result = client.call("http_request", input.clone()).await.unwrap();
        assert_eq!(result["status"], 200);
    }
    let err = client.call("http_request", input).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::RateLimited);
}

#[tokio::test]
async fn endpoint_outside_the_allowlist_is_denied() {
    let h = harness(CallerRole::User, 60).await;
    let client = ProxyClient::connect(&h.base_url, &h.client_keys, &h.client_peers_dir, None)
        .await
        .unwrap();

    let err = client
        .call(
            "http_request",
            serde_json::json!({
                "connection": "svc", "method": "GET",
                "url": "https://evil.example/exfil",
            }),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::EndpointDenied);
}

#[tokio::test]
async fn admin_tools_require_the_admin_role() {
    let h = harness(CallerRole::User, 60).await;
    let client = ProxyClient::connect(&h.base_url, &h.client_keys, &h.client_peers_dir, None)
        .await
        .unwrap();
    let err = client
        .call("admin_list_callers", serde_json::Value::Null)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotAuthorized);
}

#[tokio::test]
async fn admin_role_lists_callers() {
    let h = harness(CallerRole::Admin, 60).await;
    let client = ProxyClient::connect(&h.base_url, &h.client_keys, &h.client_peers_dir, None)
        .await
        .unwrap();
    let result = client
        .call("admin_list_callers", serde_json::Value::Null)
        .await
        .unwrap();
    let entry = &result["callers"][0];
    assert_eq!(entry["alias"], "agent");
    assert_eq!(entry["role"], "admin");
    assert!(entry["fingerprint"].is_string());
}

#[tokio::test]
async fn unregistered_caller_cannot_handshake() {
    let h = harness(CallerRole::User, 60).await;
    let stranger = KeyBundle::generate();
    let err = ProxyClient::connect(&h.base_url, &stranger, &h.client_peers_dir, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::UnknownPeer);
    assert!(h.state.sessions.is_empty());
}

#[tokio::test]
async fn sequential_calls_share_one_session() {
    let h = harness(CallerRole::User, 60).await;
    let client = Arc::new(
        ProxyClient::connect(&h.base_url, &h.client_keys, &h.client_peers_dir, None)
            .await
            .unwrap(),
    );

    // Concurrent callers queue on the channel lock; every response must
    // correlate with its own request.
    let mut tasks = Vec::new();
    for _ in 0..4 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            client.call("list_routes", serde_json::Value::Null).await
        }));
    }
    for task in tasks {
        let result = task.await.unwrap().unwrap();
        assert_eq!(result["routes"][0]["alias"], "svc");
    }
    assert_eq!(h.state.sessions.len(), 1);
}
