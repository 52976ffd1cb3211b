//! Discord gateway ingestor.
//!
//! Connection lifecycle:
//!
//! ```text
//! connect -> HELLO -> IDENTIFY/RESUME -> READY/RESUMED -> streaming
//!     ^                                                      |
//!     +--------- backoff <-- close / missed ACK <------------+
//! ```
//!
//! A heartbeat is sent every `heartbeat_interval` carrying the last seen
//! sequence number; a missed ACK means the connection is dead.  Resumable
//! closes reconnect to `resume_gateway_url` and send RESUME with the saved
//! session id and sequence; auth failure (4004) and disallowed intents
//! (4014) are fatal and stop the ingestor in the `error` state.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use dl_domain::config::WebsocketIngestorConfig;
use dl_domain::event::IngestedEvent;
use dl_domain::{ErrorKind, ProxyError};

use crate::backoff::Backoff;
use crate::base::{Ingestor, IngestorCore, IngestorState, IngestorStatus};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Gateway wire format
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub const OP_DISPATCH: u8 = 0;
pub const OP_HEARTBEAT: u8 = 1;
pub const OP_IDENTIFY: u8 = 2;
pub const OP_RESUME: u8 = 6;
pub const OP_RECONNECT: u8 = 7;
pub const OP_INVALID_SESSION: u8 = 9;
pub const OP_HELLO: u8 = 10;
pub const OP_HEARTBEAT_ACK: u8 = 11;

/// Close codes that must not be resumed or retried.
pub const CLOSE_AUTH_FAILED: u16 = 4004;
pub const CLOSE_DISALLOWED_INTENTS: u16 = 4014;

/// One gateway frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayPayload {
    pub op: u8,
    #[serde(default)]
    pub d: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

impl GatewayPayload {
    pub fn new(op: u8, d: serde_json::Value) -> Self {
        Self {
            op,
            d,
            s: None,
            t: None,
        }
    }
}

/// Saved after READY; drives RESUME on reconnect.
#[derive(Debug, Clone)]
struct ResumeState {
    session_id: String,
    resume_gateway_url: String,
    last_seq: i64,
}

/// Why a single connection ended.
enum ConnEnd {
    /// Reconnect; `resumable: false` falls back to a fresh IDENTIFY.
    Retry { resumable: bool },
    /// Stop the ingestor in the error state.
    Fatal(String),
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// DiscordIngestor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct DiscordIngestor {
    core: Arc<IngestorCore>,
    config: WebsocketIngestorConfig,
    token: String,
    runtime: Mutex<Option<Runtime>>,
}

impl std::fmt::Debug for DiscordIngestor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscordIngestor")
            .field("config", &self.config)
            .finish()
    }
}

struct Runtime {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl DiscordIngestor {
    pub fn new(
        caller: &str,
        connection: &str,
        config: WebsocketIngestorConfig,
        buffer_capacity: usize,
        token: String,
    ) -> Result<Self, ProxyError> {
        if token.is_empty() {
            return Err(ProxyError::new(
                ErrorKind::MissingSecret,
                "discord ingestor requires the botToken secret",
            ));
        }
        Ok(Self {
            core: IngestorCore::new(caller, connection, buffer_capacity),
            config,
            token,
            runtime: Mutex::new(None),
        })
    }

    pub fn core(&self) -> &Arc<IngestorCore> {
        &self.core
    }
}

#[async_trait]
impl Ingestor for DiscordIngestor {
    async fn start(&self) -> Result<(), ProxyError> {
        let mut runtime = self.runtime.lock();
        if runtime.is_some() {
            return Ok(());
        }
        self.core.set_state(IngestorState::Starting);

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let core = self.core.clone();
        let config = self.config.clone();
        let bot_token = self.token.clone();
        let task = tokio::spawn(async move {
            run_loop(core, config, bot_token, token).await;
        });
        *runtime = Some(Runtime { cancel, task });
        Ok(())
    }

    async fn stop(&self) {
        let runtime = self.runtime.lock().take();
        if let Some(rt) = runtime {
            rt.cancel.cancel();
            let _ = rt.task.await;
        }
        self.core.set_state(IngestorState::Stopped);
    }

    fn status(&self) -> IngestorStatus {
        self.core.status()
    }

    fn events(&self, after_id: i64) -> Vec<IngestedEvent> {
        self.core.events_since(after_id)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Connection loop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn run_loop(
    core: Arc<IngestorCore>,
    config: WebsocketIngestorConfig,
    bot_token: String,
    cancel: CancellationToken,
) {
    let backoff = Backoff::default();
    let mut attempt: u32 = 0;
    let mut resume: Option<ResumeState> = None;

    loop {
        if cancel.is_cancelled() {
            return;
        }
        let connected_at = Instant::now();
        let end = tokio::select! {
            end = run_connection(&core, &config, &bot_token, &mut resume) => end,
            _ = cancel.cancelled() => return,
        };

        match end {
            ConnEnd::Fatal(message) => {
                tracing::error!(
                    connection = %core.connection(),
                    error = %message,
                    "gateway connection failed fatally"
                );
                core.set_error(message);
                return;
            }
            ConnEnd::Retry { resumable } => {
                if !resumable {
                    resume = None;
                }
                if connected_at.elapsed() >= backoff.stable_after {
                    attempt = 0;
                }
                core.set_state(IngestorState::Reconnecting);
                let delay = backoff.delay(attempt);
                attempt = attempt.saturating_add(1);
                tracing::info!(
                    connection = %core.connection(),
                    delay_ms = delay.as_millis() as u64,
                    resumable,
                    "gateway reconnecting"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return,
                }
            }
        }
    }
}

async fn run_connection(
    core: &Arc<IngestorCore>,
    config: &WebsocketIngestorConfig,
    bot_token: &str,
    resume: &mut Option<ResumeState>,
) -> ConnEnd {
    let url = resume
        .as_ref()
        .map(|r| r.resume_gateway_url.clone())
        .unwrap_or_else(|| config.gateway_url.clone());

    let ws = match tokio_tungstenite::connect_async(&url).await {
        Ok((ws, _response)) => ws,
        Err(e) => {
            tracing::warn!(url = %url, error = %e, "gateway connect failed");
            return ConnEnd::Retry { resumable: true };
        }
    };
    let (mut sink, mut stream) = ws.split();

    // ── HELLO ────────────────────────────────────────────────────────
    let hello_timeout = std::time::Duration::from_secs(10);
    let heartbeat_ms = match tokio::time::timeout(hello_timeout, wait_for_hello(&mut stream)).await
    {
        Ok(Some(interval)) => interval,
        Ok(None) | Err(_) => {
            tracing::warn!(url = %url, "no HELLO from gateway");
            return ConnEnd::Retry { resumable: true };
        }
    };

    // ── IDENTIFY or RESUME ───────────────────────────────────────────
    let opening = match resume.as_ref() {
        Some(r) => GatewayPayload::new(
            OP_RESUME,
            serde_json::json!({
                "token": bot_token,
                "session_id": r.session_id,
                "seq": r.last_seq,
            }),
        ),
        None => {
            let mut d = serde_json::json!({
                "token": bot_token,
                "intents": config.intents,
                "properties": {
                    "os": std::env::consts::OS,
                    "browser": "drawlatch",
                    "device": "drawlatch",
                },
            });
            if let Some([id, count]) = config.shard {
                d["shard"] = serde_json::json!([id, count]);
            }
            GatewayPayload::new(OP_IDENTIFY, d)
        }
    };
    if send_payload(&mut sink, &opening).await.is_err() {
        return ConnEnd::Retry { resumable: true };
    }

    // ── Streaming loop with heartbeat ────────────────────────────────
    let mut last_seq: Option<i64> = resume.as_ref().map(|r| r.last_seq);
    let mut acked = true;
    let period = std::time::Duration::from_millis(heartbeat_ms.max(100));
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if !acked {
                    // ACK never arrived within one interval: the connection
                    // is dead even if TCP says otherwise.
                    tracing::warn!(connection = %core.connection(), "heartbeat ACK missed");
                    return ConnEnd::Retry { resumable: true };
                }
                let beat = GatewayPayload::new(OP_HEARTBEAT, serde_json::json!(last_seq));
                if send_payload(&mut sink, &beat).await.is_err() {
                    return ConnEnd::Retry { resumable: true };
                }
                acked = false;
            }
            msg = stream.next() => {
                let msg = match msg {
                    Some(Ok(m)) => m,
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "gateway read error");
                        return ConnEnd::Retry { resumable: true };
                    }
                    None => return ConnEnd::Retry { resumable: true },
                };
                match msg {
                    Message::Text(text) => {
                        let payload: GatewayPayload = match serde_json::from_str(&text) {
                            Ok(p) => p,
                            Err(_) => continue,
                        };
                        if let Some(s) = payload.s {
                            last_seq = Some(s);
                            if let Some(r) = resume.as_mut() {
                                r.last_seq = s;
                            }
                        }
                        match payload.op {
                            OP_HEARTBEAT_ACK => acked = true,
                            OP_HEARTBEAT => {
                                // Gateway asked for an immediate beat.
                                let beat = GatewayPayload::new(
                                    OP_HEARTBEAT,
                                    serde_json::json!(last_seq),
                                );
                                if send_payload(&mut sink, &beat).await.is_err() {
                                    return ConnEnd::Retry { resumable: true };
                                }
                            }
                            OP_RECONNECT => return ConnEnd::Retry { resumable: true },
                            OP_INVALID_SESSION => {
                                let resumable = payload.d.as_bool().unwrap_or(false);
                                return ConnEnd::Retry { resumable };
                            }
                            OP_DISPATCH => handle_dispatch(
                                core,
                                config,
                                payload,
                                last_seq,
                                resume,
                            ),
                            _ => {}
                        }
                    }
                    Message::Close(frame) => {
                        let code = frame.as_ref().map(|f| u16::from(f.code));
                        if matches!(code, Some(CLOSE_AUTH_FAILED) | Some(CLOSE_DISALLOWED_INTENTS)) {
                            return ConnEnd::Fatal(format!(
                                "gateway closed with non-recoverable code {}",
                                code.unwrap_or_default()
                            ));
                        }
                        tracing::info!(code = ?code, "gateway closed, will resume");
                        return ConnEnd::Retry { resumable: true };
                    }
                    _ => {}
                }
            }
        }
    }
}

async fn wait_for_hello(
    stream: &mut (impl StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
              + Unpin),
) -> Option<u64> {
    while let Some(Ok(msg)) = stream.next().await {
        if let Message::Text(text) = msg {
            if let Ok(payload) = serde_json::from_str::<GatewayPayload>(&text) {
                if payload.op == OP_HELLO {
                    return payload.d.get("heartbeat_interval").and_then(|v| v.as_u64());
                }
            }
        }
    }
    None
}

async fn send_payload(
    sink: &mut (impl SinkExt<Message> + Unpin),
    payload: &GatewayPayload,
) -> Result<(), ()> {
    let json = serde_json::to_string(payload).map_err(|_| ())?;
    sink.send(Message::Text(json)).await.map_err(|_| ())
}

fn handle_dispatch(
    core: &Arc<IngestorCore>,
    config: &WebsocketIngestorConfig,
    payload: GatewayPayload,
    last_seq: Option<i64>,
    resume: &mut Option<ResumeState>,
) {
    let event_type = payload.t.unwrap_or_default();
    match event_type.as_str() {
        "READY" => {
            let session_id = payload
                .d
                .get("session_id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let resume_url = payload
                .d
                .get("resume_gateway_url")
                .and_then(|v| v.as_str())
                .unwrap_or(&config.gateway_url)
                .to_string();
            *resume = Some(ResumeState {
                session_id,
                resume_gateway_url: resume_url,
                last_seq: last_seq.unwrap_or(0),
            });
            core.set_state(IngestorState::Connected);
            tracing::info!(connection = %core.connection(), "gateway ready");
        }
        "RESUMED" => {
            core.set_state(IngestorState::Connected);
            tracing::info!(connection = %core.connection(), "gateway resumed");
        }
        _ => {
            if passes_filters(config, &event_type, &payload.d) {
                core.push_event(&event_type, payload.d);
            }
        }
    }
}

/// A dispatch passes when the event filter allows its type and every
/// non-empty id filter matches the corresponding payload field.
fn passes_filters(
    config: &WebsocketIngestorConfig,
    event_type: &str,
    d: &serde_json::Value,
) -> bool {
    if !config.event_filter.is_empty()
        && !config.event_filter.iter().any(|e| e == event_type)
    {
        return false;
    }
    if !config.guild_ids.is_empty() {
        match d.get("guild_id").and_then(|v| v.as_str()) {
            Some(guild) if config.guild_ids.iter().any(|g| g == guild) => {}
            _ => return false,
        }
    }
    if !config.channel_ids.is_empty() {
        match d.get("channel_id").and_then(|v| v.as_str()) {
            Some(channel) if config.channel_ids.iter().any(|c| c == channel) => {}
            _ => return false,
        }
    }
    if !config.user_ids.is_empty() {
        let user = d
            .pointer("/author/id")
            .or_else(|| d.pointer("/user/id"))
            .and_then(|v| v.as_str());
        match user {
            Some(user) if config.user_ids.iter().any(|u| u == user) => {}
            _ => return false,
        }
    }
    true
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(
        event_filter: &[&str],
        guild_ids: &[&str],
        channel_ids: &[&str],
        user_ids: &[&str],
    ) -> WebsocketIngestorConfig {
        WebsocketIngestorConfig {
            protocol: "discord".into(),
            gateway_url: "wss://gateway.example".into(),
            intents: 1,
            shard: None,
            event_filter: event_filter.iter().map(|s| s.to_string()).collect(),
            guild_ids: guild_ids.iter().map(|s| s.to_string()).collect(),
            channel_ids: channel_ids.iter().map(|s| s.to_string()).collect(),
            user_ids: user_ids.iter().map(|s| s.to_string()).collect(),
            buffer_size: None,
        }
    }

    #[test]
    fn empty_filters_allow_everything() {
        let cfg = config_with(&[], &[], &[], &[]);
        assert!(passes_filters(&cfg, "MESSAGE_CREATE", &serde_json::json!({})));
    }

    #[test]
    fn event_filter_limits_types() {
        let cfg = config_with(&["MESSAGE_CREATE"], &[], &[], &[]);
        assert!(passes_filters(&cfg, "MESSAGE_CREATE", &serde_json::json!({})));
        assert!(!passes_filters(&cfg, "TYPING_START", &serde_json::json!({})));
    }

    #[test]
    fn guild_filter_requires_matching_guild() {
        let cfg = config_with(&[], &["g1"], &[], &[]);
        assert!(passes_filters(
            &cfg,
            "MESSAGE_CREATE",
            &serde_json::json!({"guild_id": "g1"})
        ));
        assert!(!passes_filters(
            &cfg,
            "MESSAGE_CREATE",
            &serde_json::json!({"guild_id": "g2"})
        ));
        // Events without the field cannot match a non-empty filter.
        assert!(!passes_filters(&cfg, "MESSAGE_CREATE", &serde_json::json!({})));
    }

    #[test]
    fn user_filter_accepts_author_or_user_shapes() {
        let cfg = config_with(&[], &[], &[], &["u1"]);
        assert!(passes_filters(
            &cfg,
            "MESSAGE_CREATE",
            &serde_json::json!({"author": {"id": "u1"}})
        ));
        assert!(passes_filters(
            &cfg,
            "PRESENCE_UPDATE",
            &serde_json::json!({"user": {"id": "u1"}})
        ));
        assert!(!passes_filters(
            &cfg,
            "MESSAGE_CREATE",
            &serde_json::json!({"author": {"id": "u2"}})
        ));
    }

    #[test]
    fn all_filters_must_match_together() {
        let cfg = config_with(&["MESSAGE_CREATE"], &["g1"], &["c1"], &[]);
        let good = serde_json::json!({"guild_id": "g1", "channel_id": "c1"});
        let wrong_channel = serde_json::json!({"guild_id": "g1", "channel_id": "c9"});
        assert!(passes_filters(&cfg, "MESSAGE_CREATE", &good));
        assert!(!passes_filters(&cfg, "MESSAGE_CREATE", &wrong_channel));
        assert!(!passes_filters(&cfg, "TYPING_START", &good));
    }

    #[test]
    fn payload_roundtrip_preserves_sequence_and_type() {
        let raw = r#"{"op":0,"d":{"content":"hi"},"s":42,"t":"MESSAGE_CREATE"}"#;
        let p: GatewayPayload = serde_json::from_str(raw).unwrap();
        assert_eq!(p.op, OP_DISPATCH);
        assert_eq!(p.s, Some(42));
        assert_eq!(p.t.as_deref(), Some("MESSAGE_CREATE"));
        let heartbeat = GatewayPayload::new(OP_HEARTBEAT, serde_json::json!(42));
        let json = serde_json::to_string(&heartbeat).unwrap();
        assert_eq!(json, r#"{"op":1,"d":42}"#);
    }

    #[test]
    fn missing_token_fails_construction() {
        let err = DiscordIngestor::new(
            "agent",
            "discord",
            config_with(&[], &[], &[], &[]),
            8,
            String::new(),
        )
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::MissingSecret);
    }
}
