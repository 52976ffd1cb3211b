//! Remote proxy configuration (`remote.config.json`).
//!
//! The config names the server's identity keys, the registered callers, the
//! connection templates ("connectors") they may use, and the global rate
//! limit.  All `${VAR}` placeholders stay raw here; substitution happens at
//! resolution time (see [`crate::resolve`]).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ProxyError, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteConfig {
    #[serde(default = "d_host")]
    pub host: String,
    #[serde(default = "d_port")]
    pub port: u16,
    pub local_keys_dir: PathBuf,
    /// Registered callers, keyed by alias.
    #[serde(default)]
    pub callers: HashMap<String, CallerConfig>,
    /// User-defined connection templates.  A connector with the same alias
    /// as a built-in template replaces it.
    #[serde(default)]
    pub connectors: Vec<Route>,
    #[serde(default = "d_rate_limit")]
    pub rate_limit_per_minute: u32,
    /// Per-request timeout for outbound HTTP dispatch, in milliseconds.
    #[serde(default = "d_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Sessions idle longer than this are discarded, in seconds.
    #[serde(default = "d_session_idle_secs")]
    pub session_idle_secs: u64,
}

fn d_host() -> String {
    "127.0.0.1".into()
}
fn d_port() -> u16 {
    3470
}
fn d_rate_limit() -> u32 {
    60
}
fn d_request_timeout_ms() -> u64 {
    30_000
}
fn d_session_idle_secs() -> u64 {
    1800
}

impl RemoteConfig {
    /// Parse and structurally validate a `remote.config.json` file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::bad_config(format!("cannot read {}: {e}", path.display()))
        })?;
        let config: RemoteConfig = serde_json::from_str(&raw).map_err(|e| {
            ProxyError::bad_config(format!("cannot parse {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Structural checks that serde cannot express: every enabled connection
    /// alias must name a known route, and rate limits must be positive.
    pub fn validate(&self) -> Result<()> {
        if self.rate_limit_per_minute == 0 {
            return Err(ProxyError::bad_config("rateLimitPerMinute must be >= 1"));
        }
        let routes = self.routes();
        for (alias, caller) in &self.callers {
            for conn in &caller.connections {
                if !routes.iter().any(|r| &r.alias == conn) {
                    return Err(ProxyError::bad_config(format!(
                        "caller {alias} enables unknown connection: {conn}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// All known routes: built-in templates overlaid by user connectors.
    pub fn routes(&self) -> Vec<Route> {
        let mut routes = Route::builtin_templates();
        for connector in &self.connectors {
            if let Some(slot) = routes.iter_mut().find(|r| r.alias == connector.alias) {
                *slot = connector.clone();
            } else {
                routes.push(connector.clone());
            }
        }
        routes
    }

    pub fn caller(&self, alias: &str) -> Result<&CallerConfig> {
        self.callers
            .get(alias)
            .ok_or_else(|| ProxyError::unknown_caller(alias))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Callers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Directory holding this caller's `*.pub` key bundles.
    pub peer_key_dir: PathBuf,
    /// Enabled connection aliases.
    #[serde(default)]
    pub connections: Vec<String>,
    /// Caller-scoped placeholder bindings, overlaid on the process env.
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub role: CallerRole,
    /// Per-connection ingestor overrides, keyed by connection alias.
    #[serde(default)]
    pub ingestor_overrides: HashMap<String, IngestorOverrides>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallerRole {
    Admin,
    #[default]
    User,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Routes (connection templates)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub alias: String,
    /// Glob patterns the effective request URL must match.
    #[serde(default)]
    pub allowed_endpoints: Vec<String>,
    /// Base URL prepended when the caller supplies a `path` instead of `url`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Secret name -> value or `${ENV_VAR}` placeholder.
    #[serde(default)]
    pub secrets: HashMap<String, String>,
    /// Header template; values may reference `${...}` placeholders over
    /// `secrets` and the env.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingestor: Option<IngestorConfig>,
}

impl Route {
    /// Connection templates compiled into the binary.  User connectors with
    /// the same alias shadow these.
    pub fn builtin_templates() -> Vec<Route> {
        vec![
            Route {
                alias: "github".into(),
                allowed_endpoints: vec!["https://api.github.com/**".into()],
                base_url: Some("https://api.github.com".into()),
                secrets: secrets(&[("apiToken", "${GITHUB_TOKEN}"), ("webhookSecret", "${GITHUB_WEBHOOK_SECRET}")]),
                headers: headers(&[
                    ("Authorization", "Bearer ${apiToken}"),
                    ("Accept", "application/vnd.github+json"),
                ]),
                ingestor: Some(IngestorConfig::Webhook(WebhookIngestorConfig {
                    protocol: "github".into(),
                    webhook_path: "github".into(),
                    signature_header: Some("x-hub-signature-256".into()),
                    signature_secret: Some("webhookSecret".into()),
                    tolerance_secs: None,
                    callback_url: None,
                    buffer_size: None,
                })),
            },
            Route {
                alias: "stripe".into(),
                allowed_endpoints: vec!["https://api.stripe.com/**".into()],
                base_url: Some("https://api.stripe.com".into()),
                secrets: secrets(&[("apiKey", "${STRIPE_API_KEY}"), ("webhookSecret", "${STRIPE_WEBHOOK_SECRET}")]),
                headers: headers(&[("Authorization", "Bearer ${apiKey}")]),
                ingestor: Some(IngestorConfig::Webhook(WebhookIngestorConfig {
                    protocol: "stripe".into(),
                    webhook_path: "stripe".into(),
                    signature_header: Some("stripe-signature".into()),
                    signature_secret: Some("webhookSecret".into()),
                    tolerance_secs: None,
                    callback_url: None,
                    buffer_size: None,
                })),
            },
            Route {
                alias: "trello".into(),
                allowed_endpoints: vec!["https://api.trello.com/**".into()],
                base_url: Some("https://api.trello.com".into()),
                secrets: secrets(&[
                    ("apiKey", "${TRELLO_API_KEY}"),
                    ("apiToken", "${TRELLO_API_TOKEN}"),
                    ("webhookSecret", "${TRELLO_WEBHOOK_SECRET}"),
                ]),
                headers: HashMap::new(),
                ingestor: Some(IngestorConfig::Webhook(WebhookIngestorConfig {
                    protocol: "trello".into(),
                    webhook_path: "trello".into(),
                    signature_header: Some("x-trello-webhook".into()),
                    signature_secret: Some("webhookSecret".into()),
                    tolerance_secs: None,
                    callback_url: Some("${TRELLO_CALLBACK_URL}".into()),
                    buffer_size: None,
                })),
            },
            Route {
                alias: "discord".into(),
                allowed_endpoints: vec!["https://discord.com/api/**".into()],
                base_url: Some("https://discord.com/api/v10".into()),
                secrets: secrets(&[("botToken", "${DISCORD_BOT_TOKEN}")]),
                headers: headers(&[("Authorization", "Bot ${botToken}")]),
                ingestor: Some(IngestorConfig::Websocket(WebsocketIngestorConfig {
                    protocol: "discord".into(),
                    gateway_url: "wss://gateway.discord.gg/?v=10&encoding=json".into(),
                    intents: d_intents(),
                    shard: None,
                    event_filter: Vec::new(),
                    guild_ids: Vec::new(),
                    channel_ids: Vec::new(),
                    user_ids: Vec::new(),
                    buffer_size: None,
                })),
            },
        ]
    }
}

fn secrets(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn headers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    secrets(pairs)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Ingestor config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Events kept per ingestor when the config doesn't say otherwise.
pub const DEFAULT_BUFFER_SIZE: usize = 200;
/// Hard cap on configurable buffer capacity.
pub const MAX_BUFFER_SIZE: usize = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum IngestorConfig {
    Websocket(WebsocketIngestorConfig),
    Webhook(WebhookIngestorConfig),
    Poll(PollIngestorConfig),
}

impl IngestorConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            IngestorConfig::Websocket(_) => "websocket",
            IngestorConfig::Webhook(_) => "webhook",
            IngestorConfig::Poll(_) => "poll",
        }
    }

    pub fn protocol(&self) -> &str {
        match self {
            IngestorConfig::Websocket(c) => &c.protocol,
            IngestorConfig::Webhook(c) => &c.protocol,
            IngestorConfig::Poll(_) => "",
        }
    }

    pub fn buffer_size(&self) -> usize {
        let configured = match self {
            IngestorConfig::Websocket(c) => c.buffer_size,
            IngestorConfig::Webhook(c) => c.buffer_size,
            IngestorConfig::Poll(c) => c.buffer_size,
        };
        configured
            .unwrap_or(DEFAULT_BUFFER_SIZE)
            .clamp(1, MAX_BUFFER_SIZE)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebsocketIngestorConfig {
    /// Gateway dialect; currently only `"discord"`.
    pub protocol: String,
    pub gateway_url: String,
    #[serde(default = "d_intents")]
    pub intents: u64,
    /// `[shard_id, shard_count]` when sharding is configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard: Option<[u32; 2]>,
    /// Dispatch event names to keep; empty = all.
    #[serde(default)]
    pub event_filter: Vec<String>,
    #[serde(default)]
    pub guild_ids: Vec<String>,
    #[serde(default)]
    pub channel_ids: Vec<String>,
    #[serde(default)]
    pub user_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffer_size: Option<usize>,
}

/// GUILDS | GUILD_MESSAGES | DIRECT_MESSAGES | MESSAGE_CONTENT
fn d_intents() -> u64 {
    (1 << 0) | (1 << 9) | (1 << 12) | (1 << 15)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookIngestorConfig {
    /// Signature dialect: `"github"`, `"stripe"`, or `"trello"`.
    pub protocol: String,
    /// Mounted under `POST /webhooks/:path`.
    pub webhook_path: String,
    /// Header carrying the signature.  When this and `signatureSecret` are
    /// both absent, verification is skipped entirely.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature_header: Option<String>,
    /// Name of the route secret holding the signing key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature_secret: Option<String>,
    /// Stripe timestamp tolerance in seconds (default 300; 0 disables).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerance_secs: Option<i64>,
    /// Trello signs `rawBody + callbackURL`; this is that callback URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffer_size: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollIngestorConfig {
    pub url: String,
    #[serde(default = "d_poll_method")]
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default = "d_interval_ms")]
    pub interval_ms: u64,
    /// Dotted path to the array of items in the response body; defaults to
    /// the whole body when it is already an array.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_path: Option<String>,
    /// Field used to compute each item's dedup key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deduplicate_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffer_size: Option<usize>,
}

fn d_poll_method() -> String {
    "GET".into()
}
fn d_interval_ms() -> u64 {
    60_000
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Caller-scoped ingestor overrides
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Fields a caller may override on a connection's ingestor template.  Only
/// fields compatible with the template's type are applied; the rest are
/// silently ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IngestorOverrides {
    pub buffer_size: Option<usize>,
    // websocket only
    pub intents: Option<u64>,
    pub event_filter: Option<Vec<String>>,
    pub guild_ids: Option<Vec<String>>,
    pub channel_ids: Option<Vec<String>>,
    pub user_ids: Option<Vec<String>>,
    // poll only
    pub interval_ms: Option<u64>,
}

impl IngestorOverrides {
    /// Apply these overrides to a template, returning a new config.  The
    /// template itself is never mutated.
    pub fn apply(&self, template: &IngestorConfig) -> IngestorConfig {
        let mut merged = template.clone();
        match &mut merged {
            IngestorConfig::Websocket(ws) => {
                if let Some(v) = self.buffer_size {
                    ws.buffer_size = Some(v);
                }
                if let Some(v) = self.intents {
                    ws.intents = v;
                }
                if let Some(v) = &self.event_filter {
                    ws.event_filter = v.clone();
                }
                if let Some(v) = &self.guild_ids {
                    ws.guild_ids = v.clone();
                }
                if let Some(v) = &self.channel_ids {
                    ws.channel_ids = v.clone();
                }
                if let Some(v) = &self.user_ids {
                    ws.user_ids = v.clone();
                }
            }
            IngestorConfig::Webhook(wh) => {
                if let Some(v) = self.buffer_size {
                    wh.buffer_size = Some(v);
                }
            }
            IngestorConfig::Poll(p) => {
                if let Some(v) = self.buffer_size {
                    p.buffer_size = Some(v);
                }
                if let Some(v) = self.interval_ms {
                    p.interval_ms = v;
                }
            }
        }
        merged
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config_json() -> String {
        serde_json::json!({
            "localKeysDir": "keys/server",
            "callers": {
                "agent": {
                    "peerKeyDir": "keys/peers/agent",
                    "connections": ["github"]
                }
            },
            "rateLimitPerMinute": 30
        })
        .to_string()
    }

    #[test]
    fn parses_minimal_config() {
        let config: RemoteConfig = serde_json::from_str(&minimal_config_json()).unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.rate_limit_per_minute, 30);
        assert_eq!(config.callers["agent"].role, CallerRole::User);
        config.validate().unwrap();
    }

    #[test]
    fn unknown_connection_alias_is_a_config_error() {
        let mut config: RemoteConfig = serde_json::from_str(&minimal_config_json()).unwrap();
        config
            .callers
            .get_mut("agent")
            .unwrap()
            .connections
            .push("nonexistent".into());
        let err = config.validate().unwrap_err();
        assert_eq!(err.kind, crate::ErrorKind::BadConfig);
        assert!(err.message.contains("nonexistent"));
    }

    #[test]
    fn user_connector_shadows_builtin_template() {
        let mut config: RemoteConfig = serde_json::from_str(&minimal_config_json()).unwrap();
        config.connectors.push(Route {
            alias: "github".into(),
            allowed_endpoints: vec!["https://github.example.internal/**".into()],
            base_url: None,
            secrets: HashMap::new(),
            headers: HashMap::new(),
            ingestor: None,
        });
        let routes = config.routes();
        let github: Vec<_> = routes.iter().filter(|r| r.alias == "github").collect();
        assert_eq!(github.len(), 1);
        assert_eq!(
            github[0].allowed_endpoints,
            vec!["https://github.example.internal/**".to_string()]
        );
    }

    #[test]
    fn buffer_size_is_clamped_to_valid_range() {
        let mut ws = match &Route::builtin_templates()[3].ingestor {
            Some(IngestorConfig::Websocket(c)) => c.clone(),
            _ => panic!("discord template should be websocket"),
        };
        ws.buffer_size = Some(50_000);
        assert_eq!(IngestorConfig::Websocket(ws.clone()).buffer_size(), 1000);
        ws.buffer_size = Some(0);
        assert_eq!(IngestorConfig::Websocket(ws.clone()).buffer_size(), 1);
        ws.buffer_size = None;
        assert_eq!(IngestorConfig::Websocket(ws).buffer_size(), 200);
    }

    #[test]
    fn overrides_apply_only_compatible_fields() {
        let template = IngestorConfig::Poll(PollIngestorConfig {
            url: "https://api.example.com/items".into(),
            method: "GET".into(),
            body: None,
            headers: HashMap::new(),
            interval_ms: 60_000,
            response_path: None,
            deduplicate_by: None,
            event_type: None,
            buffer_size: None,
        });
        let overrides = IngestorOverrides {
            interval_ms: Some(5_000),
            intents: Some(123), // websocket-only: ignored for poll
            ..Default::default()
        };
        let merged = overrides.apply(&template);
        match merged {
            IngestorConfig::Poll(p) => assert_eq!(p.interval_ms, 5_000),
            _ => panic!("merge must not change the ingestor type"),
        }
    }

    #[test]
    fn override_merge_does_not_mutate_template() {
        let template = Route::builtin_templates()
            .into_iter()
            .find(|r| r.alias == "discord")
            .unwrap()
            .ingestor
            .unwrap();
        let before = serde_json::to_value(&template).unwrap();
        let overrides = IngestorOverrides {
            intents: Some(1),
            event_filter: Some(vec!["MESSAGE_CREATE".into()]),
            ..Default::default()
        };
        let _ = overrides.apply(&template);
        let after = serde_json::to_value(&template).unwrap();
        assert_eq!(before, after);
    }
}
