//! Client-side channel adapter.
//!
//! [`ProxyClient`] opens the three-leg handshake against a remote, then
//! issues [`ProxyRequest`] frames over the encrypted channel and matches
//! responses by request id.  Cycles are serialized on the channel lock —
//! the counter-based nonces require strict ordering anyway — so concurrent
//! callers simply queue.  Dropping a pending call is safe: the cycle holds
//! the lock until its response is read, so no late frame can desynchronize
//! the channel.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex;

use dl_crypto::handshake::{self, ClientHandshake};
use dl_crypto::{keys, EncryptedChannel, KeyBundle, PublicKeyBundle};
use dl_domain::{ErrorKind, ProxyError, Result};
use dl_protocol::{EncryptedEnvelope, HandshakeReply, ProxyRequest, ProxyResponse};

/// Default per-call timeout; handshake legs use
/// [`handshake::HANDSHAKE_TIMEOUT`].
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub struct ProxyClient {
    http: reqwest::Client,
    base_url: String,
    session_id: String,
    channel: Mutex<EncryptedChannel>,
    call_timeout: Duration,
}

impl ProxyClient {
    /// Handshake with the remote at `base_url`.
    ///
    /// `peers_dir` holds the `*.pub` bundles of trusted servers;
    /// `server_name` picks one by file stem when the directory has several.
    pub async fn connect(
        base_url: &str,
        bundle: &KeyBundle,
        peers_dir: &Path,
        server_name: Option<&str>,
    ) -> Result<Self> {
        let peers = keys::load_peer_bundles(peers_dir).map_err(ProxyError::from)?;
        let (server_fingerprint, known_servers) = pick_server(&peers, server_name)?;

        let http = reqwest::Client::builder()
            .timeout(DEFAULT_CALL_TIMEOUT)
            .build()
            .map_err(|e| ProxyError::bad_config(format!("http client: {e}")))?;

        let base_url = base_url.trim_end_matches('/').to_string();
        let (state, init) = ClientHandshake::initiate(bundle, &server_fingerprint);

        let reply: HandshakeReply = post_json(
            &http,
            &format!("{base_url}/handshake/init"),
            &init,
            handshake::HANDSHAKE_TIMEOUT,
            ErrorKind::HandshakeTimeout,
        )
        .await?;

        let (session_keys, finish) = state
            .complete(&reply, &known_servers)
            .map_err(ProxyError::from)?;
        let session_id = session_keys.session_id.clone();

        let _ok: Value = post_json(
            &http,
            &format!("{base_url}/handshake/finish"),
            &finish,
            handshake::HANDSHAKE_TIMEOUT,
            ErrorKind::HandshakeTimeout,
        )
        .await?;

        tracing::info!(session_id = %session_id, server = %server_fingerprint, "session established");
        Ok(Self {
            http,
            base_url,
            session_id,
            channel: Mutex::new(EncryptedChannel::new(&session_keys)),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Invoke one tool.  `Ok` carries the tool result; `Err` carries either
    /// the remote's tagged error or a transport/channel failure.  Channel
    /// failures mean the session is gone — reconnect to continue.
    pub async fn call(&self, tool: &str, input: Value) -> Result<Value> {
        let request = ProxyRequest {
            request_id: uuid::Uuid::new_v4().to_string(),
            tool: tool.to_string(),
            input,
        };
        let frame = serde_json::to_vec(&request)
            .map_err(|e| ProxyError::new(ErrorKind::MalformedMessage, e.to_string()))?;

        // One seal/open cycle per lock hold keeps nonce counters aligned
        // with the wire order.
        let mut channel = self.channel.lock().await;
        let (nonce, ciphertext) = channel.seal(&frame).map_err(ProxyError::from)?;

        let envelope: EncryptedEnvelope = post_json(
            &self.http,
            &format!("{}/session/{}/request", self.base_url, self.session_id),
            &EncryptedEnvelope { nonce, ciphertext },
            self.call_timeout,
            ErrorKind::UpstreamError,
        )
        .await?;

        let plaintext = channel
            .open(&envelope.nonce, &envelope.ciphertext)
            .map_err(ProxyError::from)?;
        drop(channel);

        let response: ProxyResponse = serde_json::from_slice(&plaintext)
            .map_err(|e| ProxyError::new(ErrorKind::MalformedMessage, format!("bad frame: {e}")))?;
        if response.request_id != request.request_id {
            return Err(ProxyError::new(
                ErrorKind::MalformedMessage,
                "response does not match the pending request",
            ));
        }
        if response.ok {
            Ok(response.result.unwrap_or(Value::Null))
        } else {
            Err(response.error.unwrap_or_else(|| {
                ProxyError::new(ErrorKind::UpstreamError, "remote reported failure without detail")
            }))
        }
    }
}

/// Choose the server identity from the peer directory.
fn pick_server(
    peers: &HashMap<String, (String, PublicKeyBundle)>,
    server_name: Option<&str>,
) -> Result<(String, HashMap<String, PublicKeyBundle>)> {
    let known: HashMap<String, PublicKeyBundle> = peers
        .iter()
        .map(|(fp, (_, bundle))| (fp.clone(), bundle.clone()))
        .collect();

    let fingerprint = match server_name {
        Some(name) => peers
            .iter()
            .find(|(_, (stem, _))| stem == name)
            .map(|(fp, _)| fp.clone())
            .ok_or_else(|| {
                ProxyError::new(
                    ErrorKind::UnknownPeer,
                    format!("no peer bundle named {name} in the peers directory"),
                )
            })?,
        None => {
            let mut fingerprints: Vec<&String> = peers.keys().collect();
            fingerprints.sort();
            match fingerprints.as_slice() {
                [only] => (*only).clone(),
                [] => {
                    return Err(ProxyError::new(
                        ErrorKind::UnknownPeer,
                        "peers directory holds no server bundles",
                    ))
                }
                _ => {
                    return Err(ProxyError::bad_config(
                        "several server bundles found; pass server_name to pick one",
                    ))
                }
            }
        }
    };
    Ok((fingerprint, known))
}

/// POST a JSON body and decode a JSON response, converting the remote's
/// tagged error envelope into a `ProxyError`.
///
/// `timeout_kind` tags a timed-out request: handshake legs report
/// `HandshakeTimeout`, established-session calls report `UpstreamError`.
async fn post_json<B: serde::Serialize, T: serde::de::DeserializeOwned>(
    http: &reqwest::Client,
    url: &str,
    body: &B,
    timeout: Duration,
    timeout_kind: ErrorKind,
) -> Result<T> {
    let response = http
        .post(url)
        .timeout(timeout)
        .json(body)
        .send()
        .await
        .map_err(|e| {
            let kind = if e.is_timeout() {
                timeout_kind
            } else {
                ErrorKind::UpstreamError
            };
            ProxyError::new(kind, format!("request to {url} failed: {e}"))
        })?;

    if !response.status().is_success() {
        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if let Ok(err) = serde_json::from_value::<ProxyError>(body["error"].clone()) {
            return Err(err);
        }
        return Err(ProxyError::new(
            ErrorKind::UpstreamError,
            format!("{url} answered HTTP {status}"),
        ));
    }
    response
        .json::<T>()
        .await
        .map_err(|e| ProxyError::new(ErrorKind::MalformedMessage, format!("bad response: {e}")))
}
