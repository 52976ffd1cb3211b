//! The three-leg mutually-authenticated handshake.
//!
//! ```text
//! client                                server
//!   |-- Init: pubs, nonce, ts, sig ------->|  verify caller known + sig + skew
//!   |<- Reply: pubs, nonce, sig -----------|  both sides run ECDH + HKDF
//!   |-- Finish: session id, sig ---------->|  verify, session becomes live
//! ```
//!
//! Both sides derive directional keys from HKDF-SHA256 over the X25519
//! shared secret, salted with both nonces and bound to both fingerprints.
//! The session id is the truncated hash of both nonces, rendered
//! UUID-shaped.  Any verification failure aborts the attempt; there are no
//! retries within one handshake.

use std::collections::HashMap;
use std::time::Duration;

use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

use dl_protocol::{HandshakeFinish, HandshakeInit, HandshakeReply};

use crate::channel::SessionKeys;
use crate::error::CryptoError;
use crate::keys::{KeyBundle, PublicKeyBundle};

/// Init timestamps further than this from local time are rejected.
pub const MAX_CLOCK_SKEW_SECS: i64 = 60;
/// Hard per-leg timeout clients should apply to handshake HTTP calls.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const NONCE_LEN: usize = 32;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Signed transcripts
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn init_transcript(client_nonce: &[u8], timestamp: i64, server_fingerprint: &str) -> Vec<u8> {
    let mut msg = Vec::with_capacity(NONCE_LEN + 8 + server_fingerprint.len());
    msg.extend_from_slice(client_nonce);
    msg.extend_from_slice(&timestamp.to_be_bytes());
    msg.extend_from_slice(server_fingerprint.as_bytes());
    msg
}

fn reply_transcript(client_nonce: &[u8], server_nonce: &[u8], client_fingerprint: &str) -> Vec<u8> {
    let mut msg = Vec::with_capacity(2 * NONCE_LEN + client_fingerprint.len());
    msg.extend_from_slice(client_nonce);
    msg.extend_from_slice(server_nonce);
    msg.extend_from_slice(client_fingerprint.as_bytes());
    msg
}

fn finish_transcript(server_nonce: &[u8], session_id: &str) -> Vec<u8> {
    let mut msg = Vec::with_capacity(NONCE_LEN + session_id.len());
    msg.extend_from_slice(server_nonce);
    msg.extend_from_slice(session_id.as_bytes());
    msg
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Key schedule
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Session id = UUID rendering of `SHA-256(client_nonce || server_nonce)[..16]`.
fn derive_session_id(client_nonce: &[u8], server_nonce: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(client_nonce);
    hasher.update(server_nonce);
    let digest = hasher.finalize();
    let mut id = [0u8; 16];
    id.copy_from_slice(&digest[..16]);
    uuid::Uuid::from_bytes(id).to_string()
}

/// HKDF-SHA256: salt = both nonces, ikm = ECDH shared secret, info bound to
/// both fingerprints.  First 32 bytes are client->server, last 32 are
/// server->client.
fn derive_directional_keys(
    shared: &x25519_dalek::SharedSecret,
    client_nonce: &[u8],
    server_nonce: &[u8],
    client_fingerprint: &str,
    server_fingerprint: &str,
) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    let mut salt = Vec::with_capacity(2 * NONCE_LEN);
    salt.extend_from_slice(client_nonce);
    salt.extend_from_slice(server_nonce);

    let info = format!("drawlatch-session:{client_fingerprint}:{server_fingerprint}");
    let hk = Hkdf::<Sha256>::new(Some(&salt), shared.as_bytes());
    let mut okm = [0u8; 64];
    hk.expand(info.as_bytes(), &mut okm)
        .map_err(|_| CryptoError::EncryptFailed)?;

    let mut c2s = [0u8; 32];
    let mut s2c = [0u8; 32];
    c2s.copy_from_slice(&okm[..32]);
    s2c.copy_from_slice(&okm[32..]);
    Ok((c2s, s2c))
}

fn random_nonce() -> Vec<u8> {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce.to_vec()
}

fn check_nonce(nonce: &[u8]) -> Result<(), CryptoError> {
    if nonce.len() != NONCE_LEN {
        return Err(CryptoError::MalformedMessage(format!(
            "nonce must be {NONCE_LEN} bytes, got {}",
            nonce.len()
        )));
    }
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Client side
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Client-held state between Init and Reply.
pub struct ClientHandshake {
    bundle: KeyBundle,
    client_fingerprint: String,
    server_fingerprint: String,
    client_nonce: Vec<u8>,
}

impl ClientHandshake {
    /// Build the Init message for the server identified by
    /// `server_fingerprint`.
    pub fn initiate(bundle: &KeyBundle, server_fingerprint: &str) -> (Self, HandshakeInit) {
        Self::initiate_at(bundle, server_fingerprint, chrono::Utc::now().timestamp())
    }

    fn initiate_at(
        bundle: &KeyBundle,
        server_fingerprint: &str,
        timestamp: i64,
    ) -> (Self, HandshakeInit) {
        let client_nonce = random_nonce();
        let public = bundle.public();
        let signature = bundle.sign(&init_transcript(&client_nonce, timestamp, server_fingerprint));

        let init = HandshakeInit {
            client_signing_pub: public.signing.as_bytes().to_vec(),
            client_exchange_pub: public.exchange.as_bytes().to_vec(),
            client_nonce: client_nonce.clone(),
            timestamp,
            server_fingerprint: server_fingerprint.to_string(),
            signature,
        };
        let state = Self {
            bundle: bundle.clone(),
            client_fingerprint: public.fingerprint(),
            server_fingerprint: server_fingerprint.to_string(),
            client_nonce,
        };
        (state, init)
    }

    /// Verify the server's Reply and derive session keys plus the Finish
    /// message.  `known_servers` is the client's peer directory, keyed by
    /// fingerprint.
    pub fn complete(
        self,
        reply: &HandshakeReply,
        known_servers: &HashMap<String, PublicKeyBundle>,
    ) -> Result<(SessionKeys, HandshakeFinish), CryptoError> {
        check_nonce(&reply.server_nonce)?;
        let server_pub =
            PublicKeyBundle::from_parts(&reply.server_signing_pub, &reply.server_exchange_pub)?;
        let server_fingerprint = server_pub.fingerprint();

        if server_fingerprint != self.server_fingerprint {
            return Err(CryptoError::UnknownPeer(format!(
                "reply identity {server_fingerprint} does not match the expected server"
            )));
        }
        let registered = known_servers
            .get(&server_fingerprint)
            .ok_or_else(|| CryptoError::UnknownPeer(server_fingerprint.clone()))?;
        if *registered != server_pub {
            return Err(CryptoError::UnknownPeer(server_fingerprint));
        }

        server_pub.verify(
            &reply_transcript(&self.client_nonce, &reply.server_nonce, &self.client_fingerprint),
            &reply.signature,
        )?;

        let shared = self.bundle.diffie_hellman(&server_pub.exchange);
        let (c2s, s2c) = derive_directional_keys(
            &shared,
            &self.client_nonce,
            &reply.server_nonce,
            &self.client_fingerprint,
            &server_fingerprint,
        )?;
        let session_id = derive_session_id(&self.client_nonce, &reply.server_nonce);

        let finish = HandshakeFinish {
            session_id: session_id.clone(),
            signature: self
                .bundle
                .sign(&finish_transcript(&reply.server_nonce, &session_id)),
        };
        let keys = SessionKeys {
            session_id,
            peer_fingerprint: server_fingerprint,
            send_key: c2s,
            recv_key: s2c,
        };
        Ok((keys, finish))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server side
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Server-held state between Reply and Finish.
pub struct PendingHandshake {
    pub session_keys: SessionKeys,
    pub client_fingerprint: String,
    server_nonce: Vec<u8>,
    client_pub: PublicKeyBundle,
}

/// Validate an Init and produce the Reply plus the pending session.
///
/// `known_callers` is the union of all registered caller key bundles,
/// keyed by fingerprint.
pub fn respond(
    bundle: &KeyBundle,
    init: &HandshakeInit,
    known_callers: &HashMap<String, PublicKeyBundle>,
) -> Result<(PendingHandshake, HandshakeReply), CryptoError> {
    respond_at(bundle, init, known_callers, chrono::Utc::now().timestamp())
}

fn respond_at(
    bundle: &KeyBundle,
    init: &HandshakeInit,
    known_callers: &HashMap<String, PublicKeyBundle>,
    now: i64,
) -> Result<(PendingHandshake, HandshakeReply), CryptoError> {
    check_nonce(&init.client_nonce)?;
    let own = bundle.public();
    let server_fingerprint = own.fingerprint();

    if init.server_fingerprint != server_fingerprint {
        return Err(CryptoError::UnknownPeer(
            "init targets a different server identity".into(),
        ));
    }
    if (now - init.timestamp).abs() > MAX_CLOCK_SKEW_SECS {
        return Err(CryptoError::TimestampSkew);
    }

    let client_pub =
        PublicKeyBundle::from_parts(&init.client_signing_pub, &init.client_exchange_pub)?;
    let client_fingerprint = client_pub.fingerprint();
    let registered = known_callers
        .get(&client_fingerprint)
        .ok_or_else(|| CryptoError::UnknownPeer(client_fingerprint.clone()))?;
    if *registered != client_pub {
        return Err(CryptoError::UnknownPeer(client_fingerprint));
    }

    client_pub.verify(
        &init_transcript(&init.client_nonce, init.timestamp, &init.server_fingerprint),
        &init.signature,
    )?;

    let server_nonce = random_nonce();
    let signature = bundle.sign(&reply_transcript(
        &init.client_nonce,
        &server_nonce,
        &client_fingerprint,
    ));

    let shared = bundle.diffie_hellman(&client_pub.exchange);
    let (c2s, s2c) = derive_directional_keys(
        &shared,
        &init.client_nonce,
        &server_nonce,
        &client_fingerprint,
        &server_fingerprint,
    )?;
    let session_id = derive_session_id(&init.client_nonce, &server_nonce);

    let pending = PendingHandshake {
        session_keys: SessionKeys {
            session_id,
            peer_fingerprint: client_fingerprint.clone(),
            send_key: s2c,
            recv_key: c2s,
        },
        client_fingerprint,
        server_nonce: server_nonce.clone(),
        client_pub,
    };
    let reply = HandshakeReply {
        server_signing_pub: own.signing.as_bytes().to_vec(),
        server_exchange_pub: own.exchange.as_bytes().to_vec(),
        server_nonce,
        signature,
    };
    Ok((pending, reply))
}

/// Verify the client's Finish against the pending session.
pub fn finish(pending: &PendingHandshake, msg: &HandshakeFinish) -> Result<(), CryptoError> {
    if msg.session_id != pending.session_keys.session_id {
        return Err(CryptoError::MalformedMessage(
            "finish names a different session".into(),
        ));
    }
    pending.client_pub.verify(
        &finish_transcript(&pending.server_nonce, &msg.session_id),
        &msg.signature,
    )
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
