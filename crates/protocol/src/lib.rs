//! Proxy wire protocol: handshake messages, the encrypted envelope, and the
//! tool request/response frames carried inside it.
//!
//! Everything on the wire is JSON; binary fields (keys, nonces, signatures,
//! ciphertext) travel base64-encoded via the [`b64`] serde helper.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use dl_domain::ProxyError;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Base64 serde helper
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// `#[serde(with = "b64")]` for `Vec<u8>` fields.
pub mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD
            .decode(text.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handshake messages
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// First leg, client → server (`POST /handshake/init`).
///
/// The signature covers `client_nonce || timestamp_be || server_fingerprint`,
/// binding the attempt to one server identity and a narrow time window.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeInit {
    #[serde(with = "b64")]
    pub client_signing_pub: Vec<u8>,
    #[serde(with = "b64")]
    pub client_exchange_pub: Vec<u8>,
    #[serde(with = "b64")]
    pub client_nonce: Vec<u8>,
    /// Unix seconds.
    pub timestamp: i64,
    /// Fingerprint of the server the client believes it is talking to.
    pub server_fingerprint: String,
    #[serde(with = "b64")]
    pub signature: Vec<u8>,
}

/// Second leg, server → client (the `/handshake/init` response body).
///
/// The signature covers `client_nonce || server_nonce || client_fingerprint`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeReply {
    #[serde(with = "b64")]
    pub server_signing_pub: Vec<u8>,
    #[serde(with = "b64")]
    pub server_exchange_pub: Vec<u8>,
    #[serde(with = "b64")]
    pub server_nonce: Vec<u8>,
    #[serde(with = "b64")]
    pub signature: Vec<u8>,
}

/// Third leg, client → server (`POST /handshake/finish`).
///
/// The signature covers `server_nonce || session_id`, proving the client
/// derived the same session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeFinish {
    pub session_id: String,
    #[serde(with = "b64")]
    pub signature: Vec<u8>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Encrypted envelope
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One sealed message on an established session
/// (`POST /session/:id/request` body and response).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    #[serde(with = "b64")]
    pub nonce: Vec<u8>,
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool frames
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A tool invocation, carried encrypted inside an [`EncryptedEnvelope`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyRequest {
    pub request_id: String,
    pub tool: String,
    #[serde(default)]
    pub input: Value,
}

/// The matching result frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyResponse {
    pub request_id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ProxyError>,
}

impl ProxyResponse {
    pub fn success(request_id: impl Into<String>, result: Value) -> Self {
        Self {
            request_id: request_id.into(),
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(request_id: impl Into<String>, error: ProxyError) -> Self {
        Self {
            request_id: request_id.into(),
            ok: false,
            result: None,
            error: Some(error),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
