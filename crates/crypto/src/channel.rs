//! The per-session authenticated channel.
//!
//! Each direction owns its own ChaCha20-Poly1305 key and nonce counter.
//! Nonces are `4 random bytes || 8-byte big-endian counter`; the receiver
//! accepts only strictly increasing counters, so a replayed or reordered
//! envelope fails before decryption.  The session id is bound into every
//! seal as associated data.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

pub const NONCE_LEN: usize = 12;
const COUNTER_OFFSET: usize = 4;

/// Directional key material derived by the handshake.
///
/// `send_key`/`recv_key` are from this party's perspective: the client's
/// `send_key` is the server's `recv_key` and vice versa.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    #[zeroize(skip)]
    pub session_id: String,
    #[zeroize(skip)]
    pub peer_fingerprint: String,
    pub send_key: [u8; 32],
    pub recv_key: [u8; 32],
}

/// A live channel built from [`SessionKeys`].
pub struct EncryptedChannel {
    session_id: String,
    send: ChaCha20Poly1305,
    recv: ChaCha20Poly1305,
    send_counter: u64,
    last_recv_counter: u64,
}

impl std::fmt::Debug for EncryptedChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedChannel")
            .field("session_id", &self.session_id)
            .field("send_counter", &self.send_counter)
            .field("last_recv_counter", &self.last_recv_counter)
            .finish()
    }
}

impl EncryptedChannel {
    pub fn new(keys: &SessionKeys) -> Self {
        Self {
            session_id: keys.session_id.clone(),
            send: ChaCha20Poly1305::new(Key::from_slice(&keys.send_key)),
            recv: ChaCha20Poly1305::new(Key::from_slice(&keys.recv_key)),
            send_counter: 0,
            last_recv_counter: 0,
        }
    }

    /// Encrypt one message, consuming the next send counter.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>), CryptoError> {
        self.send_counter += 1;
        let mut nonce = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce[..COUNTER_OFFSET]);
        nonce[COUNTER_OFFSET..].copy_from_slice(&self.send_counter.to_be_bytes());

        let ciphertext = self
            .send
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: self.session_id.as_bytes(),
                },
            )
            .map_err(|_| CryptoError::EncryptFailed)?;
        Ok((nonce.to_vec(), ciphertext))
    }

    /// Decrypt one message, enforcing strict counter monotonicity.
    ///
    /// Failures are fatal to the session: the caller must discard the
    /// channel and re-handshake.
    pub fn open(&mut self, nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if nonce.len() != NONCE_LEN {
            return Err(CryptoError::MalformedMessage(format!(
                "nonce must be {NONCE_LEN} bytes, got {}",
                nonce.len()
            )));
        }
        let counter_bytes: [u8; 8] = nonce[COUNTER_OFFSET..]
            .try_into()
            .map_err(|_| CryptoError::MalformedMessage("truncated nonce counter".into()))?;
        let counter = u64::from_be_bytes(counter_bytes);
        if counter <= self.last_recv_counter {
            return Err(CryptoError::ReplayDetected);
        }

        let plaintext = self
            .recv
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: self.session_id.as_bytes(),
                },
            )
            .map_err(|_| CryptoError::InvalidSignature)?;

        self.last_recv_counter = counter;
        Ok(plaintext)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paired_channels() -> (EncryptedChannel, EncryptedChannel) {
        let client_keys = SessionKeys {
            session_id: "11111111-2222-3333-4444-555555555555".into(),
            peer_fingerprint: "server-fp".into(),
            send_key: [7u8; 32],
            recv_key: [9u8; 32],
        };
        let server_keys = SessionKeys {
            session_id: client_keys.session_id.clone(),
            peer_fingerprint: "client-fp".into(),
            send_key: client_keys.recv_key,
            recv_key: client_keys.send_key,
        };
        (
            EncryptedChannel::new(&client_keys),
            EncryptedChannel::new(&server_keys),
        )
    }

    #[test]
    fn seal_open_roundtrip_both_directions() {
        let (mut client, mut server) = paired_channels();
        for msg in [&b"first"[..], b"", b"a much longer message body"] {
            let (nonce, ct) = client.seal(msg).unwrap();
            assert_eq!(server.open(&nonce, &ct).unwrap(), msg);
        }
        let (nonce, ct) = server.seal(b"reply").unwrap();
        assert_eq!(client.open(&nonce, &ct).unwrap(), b"reply");
    }

    #[test]
    fn tampered_ciphertext_fails_authentication() {
        let (mut client, mut server) = paired_channels();
        let (nonce, mut ct) = client.seal(b"payload").unwrap();
        ct[0] ^= 0x01;
        assert!(matches!(
            server.open(&nonce, &ct),
            Err(CryptoError::InvalidSignature)
        ));
    }

    #[test]
    fn replayed_nonce_is_rejected_before_decryption() {
        let (mut client, mut server) = paired_channels();
        let (nonce, ct) = client.seal(b"once").unwrap();
        server.open(&nonce, &ct).unwrap();
        assert!(matches!(
            server.open(&nonce, &ct),
            Err(CryptoError::ReplayDetected)
        ));
    }

    #[test]
    fn reordered_counters_are_rejected() {
        let (mut client, mut server) = paired_channels();
        let (n1, c1) = client.seal(b"one").unwrap();
        let (n2, c2) = client.seal(b"two").unwrap();
        server.open(&n2, &c2).unwrap();
        assert!(matches!(
            server.open(&n1, &c1),
            Err(CryptoError::ReplayDetected)
        ));
    }

    #[test]
    fn wrong_session_aad_fails() {
        let (mut client, _) = paired_channels();
        let other_keys = SessionKeys {
            session_id: "99999999-0000-0000-0000-000000000000".into(),
            peer_fingerprint: "client-fp".into(),
            send_key: [9u8; 32],
            recv_key: [7u8; 32],
        };
        let mut other = EncryptedChannel::new(&other_keys);
        let (nonce, ct) = client.seal(b"bound to session").unwrap();
        assert!(matches!(
            other.open(&nonce, &ct),
            Err(CryptoError::InvalidSignature)
        ));
    }

    #[test]
    fn short_nonce_is_malformed() {
        let (_, mut server) = paired_channels();
        assert!(matches!(
            server.open(&[0u8; 5], b"junk"),
            Err(CryptoError::MalformedMessage(_))
        ));
    }
}
