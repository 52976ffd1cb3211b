//! Passive webhook ingestors: GitHub, Stripe, and Trello.
//!
//! These never open outbound connections; the server's `POST /webhooks/:path`
//! route feeds them raw request bodies.  Each provider dialect verifies its
//! signature scheme with a constant-time comparison, then extracts the event
//! type and pushes the payload into the ring.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use dl_domain::config::WebhookIngestorConfig;
use dl_domain::event::IngestedEvent;
use dl_domain::{ErrorKind, ProxyError};

use crate::base::{Ingestor, IngestorCore, IngestorState, IngestorStatus, WebhookOutcome};

type HmacSha256 = Hmac<Sha256>;
type HmacSha1 = Hmac<Sha1>;

/// Default Stripe timestamp tolerance in seconds; 0 disables the check.
const DEFAULT_TOLERANCE_SECS: i64 = 300;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Provider dialects
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Provider {
    Github,
    Stripe,
    Trello,
}

impl Provider {
    fn parse(protocol: &str) -> Result<Self, ProxyError> {
        match protocol {
            "github" => Ok(Provider::Github),
            "stripe" => Ok(Provider::Stripe),
            "trello" => Ok(Provider::Trello),
            other => Err(ProxyError::new(
                ErrorKind::BadConfig,
                format!("unknown webhook protocol: {other}"),
            )),
        }
    }

    fn default_signature_header(self) -> &'static str {
        match self {
            Provider::Github => "x-hub-signature-256",
            Provider::Stripe => "stripe-signature",
            Provider::Trello => "x-trello-webhook",
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// WebhookIngestor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct WebhookIngestor {
    core: Arc<IngestorCore>,
    config: WebhookIngestorConfig,
    provider: Provider,
    /// Resolved signing secret, looked up by `config.signature_secret` name
    /// at construction.  `None` when unresolved or unconfigured.
    secret: Option<String>,
}

impl WebhookIngestor {
    pub fn new(
        caller: &str,
        connection: &str,
        config: WebhookIngestorConfig,
        buffer_capacity: usize,
        secret: Option<String>,
    ) -> Result<Self, ProxyError> {
        let provider = Provider::parse(&config.protocol)?;
        Ok(Self {
            core: IngestorCore::new(caller, connection, buffer_capacity),
            config,
            provider,
            secret,
        })
    }

    pub fn core(&self) -> &Arc<IngestorCore> {
        &self.core
    }

    fn verification_configured(&self) -> bool {
        self.config.signature_header.is_some() || self.config.signature_secret.is_some()
    }

    fn signature_header_name(&self) -> String {
        self.config
            .signature_header
            .clone()
            .unwrap_or_else(|| self.provider.default_signature_header().to_string())
            .to_ascii_lowercase()
    }

    fn verify(&self, headers: &HashMap<String, String>, body: &[u8]) -> Result<(), WebhookOutcome> {
        // Verification is skipped only when neither the header nor the
        // secret name is configured.
        if !self.verification_configured() {
            return Ok(());
        }
        let Some(secret) = self.secret.as_deref() else {
            return Err(WebhookOutcome::rejected("Signature secret not configured"));
        };
        let provided = headers
            .get(&self.signature_header_name())
            .map(String::as_str)
            .unwrap_or("");
        if provided.is_empty() {
            return Err(WebhookOutcome::rejected("Missing signature header"));
        }

        match self.provider {
            Provider::Github => verify_github(secret, provided, body),
            Provider::Stripe => verify_stripe(
                secret,
                provided,
                body,
                self.config.tolerance_secs.unwrap_or(DEFAULT_TOLERANCE_SECS),
                chrono::Utc::now().timestamp(),
            ),
            Provider::Trello => verify_trello(
                secret,
                provided,
                body,
                self.config.callback_url.as_deref().unwrap_or(""),
            ),
        }
    }

    fn ingest(&self, headers: &HashMap<String, String>, body: &[u8]) -> WebhookOutcome {
        let payload: serde_json::Value = match serde_json::from_slice(body) {
            Ok(v) => v,
            Err(_) => return WebhookOutcome::rejected("Invalid JSON body"),
        };

        let event_type = match self.provider {
            Provider::Github => headers
                .get("x-github-event")
                .cloned()
                .unwrap_or_else(|| "unknown".into()),
            Provider::Stripe => payload
                .get("type")
                .and_then(|t| t.as_str())
                .unwrap_or("unknown")
                .to_string(),
            Provider::Trello => payload
                .pointer("/action/type")
                .and_then(|t| t.as_str())
                .unwrap_or("unknown")
                .to_string(),
        };

        let delivery_id = match self.provider {
            Provider::Github => headers.get("x-github-delivery").cloned(),
            Provider::Stripe | Provider::Trello => None,
        };
        let event_id = match self.provider {
            Provider::Stripe => payload.get("id").and_then(|i| i.as_str()).map(String::from),
            Provider::Github | Provider::Trello => None,
        };

        let mut data = serde_json::json!({
            "event": event_type,
            "payload": payload,
        });
        if let Some(delivery) = delivery_id {
            data["deliveryId"] = serde_json::json!(delivery);
        }
        if let Some(id) = event_id {
            data["eventId"] = serde_json::json!(id);
        }

        self.core.push_event(&event_type, data);
        WebhookOutcome::accepted()
    }
}

#[async_trait]
impl Ingestor for WebhookIngestor {
    async fn start(&self) -> Result<(), ProxyError> {
        // Passive: "connected" just means mounted and accepting deliveries.
        self.core.set_state(IngestorState::Connected);
        Ok(())
    }

    async fn stop(&self) {
        self.core.set_state(IngestorState::Stopped);
    }

    fn status(&self) -> IngestorStatus {
        self.core.status()
    }

    fn events(&self, after_id: i64) -> Vec<IngestedEvent> {
        self.core.events_since(after_id)
    }

    fn webhook_path(&self) -> Option<&str> {
        Some(&self.config.webhook_path)
    }

    async fn handle_webhook(
        &self,
        headers: &HashMap<String, String>,
        body: &[u8],
    ) -> WebhookOutcome {
        if self.core.state() != IngestorState::Connected {
            return WebhookOutcome::rejected("Ingestor not running");
        }
        if let Err(outcome) = self.verify(headers, body) {
            tracing::warn!(
                connection = %self.core.connection(),
                reason = outcome.reason.as_deref().unwrap_or(""),
                "webhook rejected"
            );
            return outcome;
        }
        self.ingest(headers, body)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Signature schemes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn hex_hmac_sha256(secret: &str, message: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(message);
    hex::encode(mac.finalize().into_bytes())
}

fn ct_str_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// GitHub: `X-Hub-Signature-256: sha256=<hex of HMAC-SHA256(body)>`.
fn verify_github(secret: &str, provided: &str, body: &[u8]) -> Result<(), WebhookOutcome> {
    let provided_hex = provided.strip_prefix("sha256=").unwrap_or(provided);
    let computed = hex_hmac_sha256(secret, body);
    if ct_str_eq(&computed, &provided_hex.to_ascii_lowercase()) {
        Ok(())
    } else {
        Err(WebhookOutcome::rejected("Invalid signature"))
    }
}

/// Stripe: `Stripe-Signature: t=<unix>,v1=<hex>[,v1=<hex>...]` over
/// `"{t}.{body}"`, with a timestamp tolerance window.
fn verify_stripe(
    secret: &str,
    provided: &str,
    body: &[u8],
    tolerance_secs: i64,
    now: i64,
) -> Result<(), WebhookOutcome> {
    let mut timestamp: Option<i64> = None;
    let mut candidates: Vec<&str> = Vec::new();
    for part in provided.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => candidates.push(value),
            _ => {}
        }
    }
    let Some(t) = timestamp else {
        return Err(WebhookOutcome::rejected("Malformed Stripe-Signature header"));
    };
    if candidates.is_empty() {
        return Err(WebhookOutcome::rejected("Malformed Stripe-Signature header"));
    }
    if tolerance_secs > 0 && (now - t).abs() > tolerance_secs {
        return Err(WebhookOutcome::rejected("Timestamp outside tolerance window"));
    }

    let mut signed_payload = Vec::with_capacity(body.len() + 16);
    signed_payload.extend_from_slice(t.to_string().as_bytes());
    signed_payload.push(b'.');
    signed_payload.extend_from_slice(body);
    let computed = hex_hmac_sha256(secret, &signed_payload);

    // Any matching v1 candidate accepts; each compare is constant-time.
    let mut matched = false;
    for candidate in candidates {
        if ct_str_eq(&computed, &candidate.to_ascii_lowercase()) {
            matched = true;
        }
    }
    if matched {
        Ok(())
    } else {
        Err(WebhookOutcome::rejected("Invalid signature"))
    }
}

/// Trello: `X-Trello-Webhook: base64(HMAC-SHA1(body + callbackURL))`.
fn verify_trello(
    secret: &str,
    provided: &str,
    body: &[u8],
    callback_url: &str,
) -> Result<(), WebhookOutcome> {
    let mut mac = HmacSha1::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body);
    mac.update(callback_url.as_bytes());
    let computed = {
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine;
        STANDARD.encode(mac.finalize().into_bytes())
    };
    if ct_str_eq(&computed, provided) {
        Ok(())
    } else {
        Err(WebhookOutcome::rejected("Invalid signature"))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
