//! The session table and pending-handshake staging area.
//!
//! Handshakes park in [`PendingHandshakes`] between Init and Finish; live
//! sessions move into [`SessionStore`].  Channel failures and idle timeouts
//! evict sessions; the client must re-handshake.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use dl_crypto::handshake::PendingHandshake;
use dl_crypto::EncryptedChannel;

/// Pending handshakes expire if Finish never arrives.
const PENDING_TTL: Duration = Duration::from_secs(10);
/// How often the idle sweeper runs.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pending handshakes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct PendingEntry {
    pending: PendingHandshake,
    caller_alias: String,
    created: Instant,
}

#[derive(Default)]
pub struct PendingHandshakes {
    inner: Mutex<HashMap<String, PendingEntry>>,
}

impl PendingHandshakes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, pending: PendingHandshake, caller_alias: String) {
        let mut inner = self.inner.lock();
        inner.retain(|_, entry| entry.created.elapsed() < PENDING_TTL);
        inner.insert(
            pending.session_keys.session_id.clone(),
            PendingEntry {
                pending,
                caller_alias,
                created: Instant::now(),
            },
        );
    }

    /// Claim a pending handshake by session id.  Expired entries are gone.
    pub fn take(&self, session_id: &str) -> Option<(PendingHandshake, String)> {
        let mut inner = self.inner.lock();
        let entry = inner.remove(session_id)?;
        if entry.created.elapsed() >= PENDING_TTL {
            return None;
        }
        Some((entry.pending, entry.caller_alias))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Live sessions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Session {
    pub id: String,
    pub caller_alias: String,
    pub peer_fingerprint: String,
    pub created_at: DateTime<Utc>,
    /// Seal/open are serialized per session: nonce counters require it.
    pub channel: Mutex<EncryptedChannel>,
    last_seen: Mutex<Instant>,
}

impl Session {
    pub fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }
}

pub struct SessionStore {
    inner: RwLock<HashMap<String, Arc<Session>>>,
    idle_timeout: Duration,
}

impl SessionStore {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            idle_timeout,
        }
    }

    pub fn insert(
        &self,
        caller_alias: String,
        peer_fingerprint: String,
        channel: EncryptedChannel,
    ) -> Arc<Session> {
        let session = Arc::new(Session {
            id: channel.session_id().to_string(),
            caller_alias,
            peer_fingerprint,
            created_at: Utc::now(),
            channel: Mutex::new(channel),
            last_seen: Mutex::new(Instant::now()),
        });
        self.inner
            .write()
            .insert(session.id.clone(), session.clone());
        session
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.inner.read().get(session_id).cloned()
    }

    /// Evict a session (handshake-level trust is gone; client must redo it).
    pub fn remove(&self, session_id: &str) -> Option<Arc<Session>> {
        self.inner.write().remove(session_id)
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    pub fn clear(&self) {
        self.inner.write().clear();
    }

    /// Drop sessions idle past the timeout; returns how many were evicted.
    pub fn sweep_idle(&self) -> usize {
        let mut inner = self.inner.write();
        let before = inner.len();
        let timeout = self.idle_timeout;
        inner.retain(|_, session| session.idle_for() < timeout);
        before - inner.len()
    }

    /// Periodic idle sweep until shutdown.
    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let evicted = store.sweep_idle();
                if evicted > 0 {
                    tracing::info!(evicted, "idle sessions evicted");
                }
            }
        });
    }
}
