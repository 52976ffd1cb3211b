//! Shared application state passed to all API handlers.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dl_crypto::{keys, KeyBundle, PublicKeyBundle};
use dl_domain::config::RemoteConfig;
use dl_domain::{ProxyError, Result};
use dl_ingest::IngestorManager;

use crate::ratelimit::RateLimiter;
use crate::sessions::{PendingHandshakes, SessionStore};

/// A registered caller identity: which alias a presented key bundle maps to.
#[derive(Clone)]
pub struct CallerPeer {
    pub alias: String,
    pub bundle: PublicKeyBundle,
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RemoteConfig>,
    /// `remote.config.json` location; admin mutations rewrite it atomically.
    pub config_path: Arc<PathBuf>,
    /// `.env` location for `admin_set_secrets`.
    pub env_path: Arc<PathBuf>,
    pub keys: Arc<KeyBundle>,
    pub fingerprint: String,
    /// Caller fingerprints loaded once at startup from the peer key dirs.
    pub peers: Arc<HashMap<String, CallerPeer>>,
    pub pending: Arc<PendingHandshakes>,
    pub sessions: Arc<SessionStore>,
    pub limiter: Arc<RateLimiter>,
    pub ingestors: Arc<IngestorManager>,
    /// Outbound executor for `http_request`.
    pub http: reqwest::Client,
}

impl AppState {
    /// Assemble state from a validated config.  Paths inside the config are
    /// resolved relative to `config_dir`.
    pub fn build(config: RemoteConfig, config_dir: &Path) -> Result<Self> {
        let keys_dir = config_dir.join(&config.local_keys_dir);
        let keys = KeyBundle::load(&keys_dir).map_err(ProxyError::from)?;
        let fingerprint = keys.fingerprint();
        let peers = load_caller_peers(&config, config_dir)?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| ProxyError::bad_config(format!("http client: {e}")))?;

        let idle = Duration::from_secs(config.session_idle_secs);
        let limiter = Arc::new(RateLimiter::new(config.rate_limit_per_minute));
        Ok(Self {
            config_path: Arc::new(config_dir.join("remote.config.json")),
            env_path: Arc::new(config_dir.join(".env")),
            config: Arc::new(config),
            keys: Arc::new(keys),
            fingerprint,
            peers: Arc::new(peers),
            pending: Arc::new(PendingHandshakes::new()),
            sessions: Arc::new(SessionStore::new(idle)),
            limiter,
            ingestors: Arc::new(IngestorManager::new()),
            http,
        })
    }

    /// The bundle view the handshake layer consumes.
    pub fn peer_bundles(&self) -> HashMap<String, PublicKeyBundle> {
        self.peers
            .iter()
            .map(|(fp, peer)| (fp.clone(), peer.bundle.clone()))
            .collect()
    }

    /// First registered fingerprint for a caller alias, if any.
    pub fn fingerprint_of(&self, alias: &str) -> Option<String> {
        let mut fingerprints: Vec<&String> = self
            .peers
            .iter()
            .filter(|(_, peer)| peer.alias == alias)
            .map(|(fp, _)| fp)
            .collect();
        fingerprints.sort();
        fingerprints.first().map(|fp| (*fp).clone())
    }
}

/// Scan every caller's peer key dir and map fingerprints to aliases.
/// A missing directory is a config error; the server must not silently run
/// with an unauthenticatable caller.
fn load_caller_peers(
    config: &RemoteConfig,
    config_dir: &Path,
) -> Result<HashMap<String, CallerPeer>> {
    let mut peers = HashMap::new();
    for (alias, caller) in &config.callers {
        let dir = config_dir.join(&caller.peer_key_dir);
        let bundles = keys::load_peer_bundles(&dir).map_err(|e| {
            ProxyError::bad_config(format!(
                "caller {alias}: peer key dir {}: {e}",
                dir.display()
            ))
        })?;
        for (fingerprint, (_name, bundle)) in bundles {
            peers.insert(
                fingerprint,
                CallerPeer {
                    alias: alias.clone(),
                    bundle,
                },
            );
        }
    }
    Ok(peers)
}
