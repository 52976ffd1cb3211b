//! Cryptographic core: long-lived identities, the per-session authenticated
//! channel, and the mutual handshake that establishes it.
//!
//! Identities are Ed25519 (authentication) + X25519 (key agreement) pairs
//! persisted as raw key files.  Sessions derive two directional
//! ChaCha20-Poly1305 keys via HKDF over the ECDH shared secret and both
//! handshake nonces.

pub mod channel;
pub mod error;
pub mod handshake;
pub mod keys;

pub use channel::{EncryptedChannel, SessionKeys};
pub use error::CryptoError;
pub use keys::{KeyBundle, PublicKeyBundle};
