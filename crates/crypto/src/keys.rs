//! Identity key bundles and their on-disk layout.
//!
//! A bundle directory holds four raw-byte files:
//! `signing.key` / `signing.pub` (Ed25519) and `exchange.key` /
//! `exchange.pub` (X25519).  Secret files are written with mode 0o600 inside
//! a 0o700 directory; loading refuses symlinked secret files.  Peer
//! directories hold only `<name>.pub` files: the two public halves
//! concatenated (64 bytes).

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as ExchangePublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::error::CryptoError;

const KEY_LEN: usize = 32;
const BUNDLE_PUB_LEN: usize = 2 * KEY_LEN;
/// Fingerprints are the first 16 bytes of the bundle hash, hex-encoded.
const FINGERPRINT_BYTES: usize = 16;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// KeyBundle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A long-lived identity: Ed25519 signing pair + X25519 exchange pair.
#[derive(Clone)]
pub struct KeyBundle {
    signing: SigningKey,
    exchange: StaticSecret,
}

impl KeyBundle {
    pub fn generate() -> Self {
        let mut seed = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut seed);
        let signing = SigningKey::from_bytes(&seed);
        let exchange = StaticSecret::random_from_rng(OsRng);
        Self { signing, exchange }
    }

    /// The exported public halves.
    pub fn public(&self) -> PublicKeyBundle {
        PublicKeyBundle {
            signing: self.signing.verifying_key(),
            exchange: ExchangePublicKey::from(&self.exchange),
        }
    }

    pub fn fingerprint(&self) -> String {
        self.public().fingerprint()
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing.sign(message).to_bytes().to_vec()
    }

    pub fn diffie_hellman(&self, peer_exchange: &ExchangePublicKey) -> x25519_dalek::SharedSecret {
        self.exchange.diffie_hellman(peer_exchange)
    }

    /// Persist into `dir` (created 0o700 if needed); secret files get 0o600.
    pub fn save(&self, dir: &Path) -> Result<(), CryptoError> {
        std::fs::create_dir_all(dir).map_err(io_err)?;
        restrict_dir_mode(dir)?;

        write_secret_file(&dir.join("signing.key"), &self.signing.to_bytes())?;
        write_secret_file(&dir.join("exchange.key"), self.exchange.as_bytes())?;

        let public = self.public();
        std::fs::write(dir.join("signing.pub"), public.signing.as_bytes()).map_err(io_err)?;
        std::fs::write(dir.join("exchange.pub"), public.exchange.as_bytes()).map_err(io_err)?;
        Ok(())
    }

    /// Load from a directory written by [`save`](Self::save).  The public
    /// halves are re-derived from the secret files, so only `*.key` files
    /// are read.
    pub fn load(dir: &Path) -> Result<Self, CryptoError> {
        let signing_bytes = read_secret_file(&dir.join("signing.key"))?;
        let exchange_bytes = read_secret_file(&dir.join("exchange.key"))?;
        Ok(Self {
            signing: SigningKey::from_bytes(&signing_bytes),
            exchange: StaticSecret::from(*exchange_bytes),
        })
    }
}

impl PartialEq for KeyBundle {
    fn eq(&self, other: &Self) -> bool {
        self.signing.to_bytes() == other.signing.to_bytes()
            && self.exchange.as_bytes() == other.exchange.as_bytes()
    }
}

impl std::fmt::Debug for KeyBundle {
    /// Secret halves never reach logs.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyBundle")
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// PublicKeyBundle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The public halves of a [`KeyBundle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKeyBundle {
    pub signing: VerifyingKey,
    pub exchange: ExchangePublicKey,
}

impl PublicKeyBundle {
    /// Deterministic short identity: hex of the truncated SHA-256 over
    /// `ed25519_pub || x25519_pub`.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.signing.as_bytes());
        hasher.update(self.exchange.as_bytes());
        let digest = hasher.finalize();
        hex::encode(&digest[..FINGERPRINT_BYTES])
    }

    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        let sig_bytes: [u8; 64] = signature
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength {
                expected: 64,
                actual: signature.len(),
            })?;
        self.signing
            .verify(message, &Signature::from_bytes(&sig_bytes))
            .map_err(|_| CryptoError::InvalidSignature)
    }

    /// `ed25519_pub || x25519_pub`, the `.pub` file layout.
    pub fn to_bytes(&self) -> [u8; BUNDLE_PUB_LEN] {
        let mut out = [0u8; BUNDLE_PUB_LEN];
        out[..KEY_LEN].copy_from_slice(self.signing.as_bytes());
        out[KEY_LEN..].copy_from_slice(self.exchange.as_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != BUNDLE_PUB_LEN {
            return Err(CryptoError::InvalidKeyLength {
                expected: BUNDLE_PUB_LEN,
                actual: bytes.len(),
            });
        }
        Self::from_parts(&bytes[..KEY_LEN], &bytes[KEY_LEN..])
    }

    /// Assemble from separately transmitted halves (handshake messages).
    pub fn from_parts(signing: &[u8], exchange: &[u8]) -> Result<Self, CryptoError> {
        let signing_bytes: [u8; KEY_LEN] =
            signing.try_into().map_err(|_| CryptoError::InvalidKeyLength {
                expected: KEY_LEN,
                actual: signing.len(),
            })?;
        let exchange_bytes: [u8; KEY_LEN] =
            exchange.try_into().map_err(|_| CryptoError::InvalidKeyLength {
                expected: KEY_LEN,
                actual: exchange.len(),
            })?;
        let signing = VerifyingKey::from_bytes(&signing_bytes)
            .map_err(|_| CryptoError::MalformedMessage("invalid ed25519 public key".into()))?;
        Ok(Self {
            signing,
            exchange: ExchangePublicKey::from(exchange_bytes),
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), CryptoError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        std::fs::write(path, self.to_bytes()).map_err(io_err)
    }

    pub fn load(path: &Path) -> Result<Self, CryptoError> {
        let bytes = std::fs::read(path).map_err(io_err)?;
        Self::from_bytes(&bytes)
    }
}

/// Scan a peer directory for `*.pub` bundles.  Returns fingerprint ->
/// (file stem, bundle).  Unreadable or malformed files fail the whole load;
/// a peer directory is security configuration, not best-effort data.
pub fn load_peer_bundles(
    dir: &Path,
) -> Result<HashMap<String, (String, PublicKeyBundle)>, CryptoError> {
    let mut peers = HashMap::new();
    let entries = std::fs::read_dir(dir).map_err(io_err)?;
    for entry in entries {
        let entry = entry.map_err(io_err)?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("pub") {
            continue;
        }
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("peer")
            .to_string();
        let bundle = PublicKeyBundle::load(&path)?;
        peers.insert(bundle.fingerprint(), (name, bundle));
    }
    Ok(peers)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// File helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn io_err(e: std::io::Error) -> CryptoError {
    CryptoError::Io(e.to_string())
}

#[cfg(unix)]
fn restrict_dir_mode(dir: &Path) -> Result<(), CryptoError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700)).map_err(io_err)
}

#[cfg(not(unix))]
fn restrict_dir_mode(_dir: &Path) -> Result<(), CryptoError> {
    Ok(())
}

#[cfg(unix)]
fn write_secret_file(path: &Path, bytes: &[u8]) -> Result<(), CryptoError> {
    use std::os::unix::fs::OpenOptionsExt;
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .map_err(io_err)?;
    file.write_all(bytes).map_err(io_err)
}

#[cfg(not(unix))]
fn write_secret_file(path: &Path, bytes: &[u8]) -> Result<(), CryptoError> {
    std::fs::write(path, bytes).map_err(io_err)
}

/// Read a 32-byte secret key file.  Refuses symlinks so a swapped link
/// cannot redirect the read, and zeroizes the transient buffer.
fn read_secret_file(path: &Path) -> Result<Zeroizing<[u8; KEY_LEN]>, CryptoError> {
    let meta = std::fs::symlink_metadata(path).map_err(io_err)?;
    if meta.file_type().is_symlink() {
        return Err(CryptoError::Io(format!(
            "refusing symlinked key file: {}",
            path.display()
        )));
    }
    let bytes = Zeroizing::new(std::fs::read(path).map_err(io_err)?);
    if bytes.len() != KEY_LEN {
        return Err(CryptoError::InvalidKeyLength {
            expected: KEY_LEN,
            actual: bytes.len(),
        });
    }
    let mut out = Zeroizing::new([0u8; KEY_LEN]);
    out.copy_from_slice(&bytes);
    Ok(out)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
