//! Crypto-layer errors and their mapping onto the proxy error vocabulary.

use dl_domain::{ErrorKind, ProxyError};

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("key store I/O: {0}")]
    Io(String),

    #[error("invalid key material: expected {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("unknown peer: {0}")]
    UnknownPeer(String),

    #[error("signature verification failed")]
    InvalidSignature,

    #[error("handshake timestamp outside the allowed skew window")]
    TimestampSkew,

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("nonce counter replayed or reordered")]
    ReplayDetected,

    #[error("encryption failure")]
    EncryptFailed,
}

impl From<CryptoError> for ProxyError {
    fn from(err: CryptoError) -> Self {
        let kind = match &err {
            CryptoError::Io(_) | CryptoError::InvalidKeyLength { .. } => ErrorKind::BadConfig,
            CryptoError::UnknownPeer(_) => ErrorKind::UnknownPeer,
            CryptoError::InvalidSignature | CryptoError::EncryptFailed => {
                ErrorKind::InvalidSignature
            }
            CryptoError::TimestampSkew => ErrorKind::TimestampSkew,
            CryptoError::MalformedMessage(_) => ErrorKind::MalformedMessage,
            CryptoError::ReplayDetected => ErrorKind::ReplayDetected,
        };
        ProxyError::new(kind, err.to_string())
    }
}
