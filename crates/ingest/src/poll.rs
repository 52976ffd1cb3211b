//! Periodic HTTP poll ingestor with response-path extraction and
//! deduplication.
//!
//! Every `intervalMs` the configured request is issued; the response body is
//! narrowed to an array via the dotted `responsePath`, and each unseen item
//! (keyed by `deduplicateBy`) becomes one event.  A failed poll marks the
//! ingestor `error` and the loop keeps going; the next success clears it.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use dl_domain::config::PollIngestorConfig;
use dl_domain::event::IngestedEvent;
use dl_domain::{ErrorKind, ProxyError};

use crate::base::{Ingestor, IngestorCore, IngestorState, IngestorStatus};

/// Floor for the poll interval so a misconfigured `intervalMs: 1` cannot
/// hot-loop against the upstream.
const MIN_INTERVAL_MS: u64 = 100;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Dedup LRU
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Bounded set of recently seen dedup keys, evicting oldest-first.
struct SeenKeys {
    capacity: usize,
    order: VecDeque<String>,
    set: HashSet<String>,
}

impl SeenKeys {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            set: HashSet::new(),
        }
    }

    /// Returns `true` when the key is new (and records it).
    fn insert(&mut self, key: String) -> bool {
        if self.set.contains(&key) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
        self.set.insert(key.clone());
        self.order.push_back(key);
        true
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Response handling
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Narrow the response body to the polled array.  A dotted `responsePath`
/// descends object keys; without one the body itself must be an array.
fn extract_items(body: &serde_json::Value, response_path: Option<&str>) -> Vec<serde_json::Value> {
    let target = match response_path.filter(|p| !p.is_empty()) {
        Some(path) => {
            let pointer = format!("/{}", path.replace('.', "/"));
            body.pointer(&pointer)
        }
        None => Some(body),
    };
    match target {
        Some(serde_json::Value::Array(items)) => items.clone(),
        _ => Vec::new(),
    }
}

/// The dedup key: the named field's JSON rendering, or the whole item when
/// the field is absent or unconfigured.
fn dedup_key(item: &serde_json::Value, field: Option<&str>) -> String {
    match field.and_then(|f| item.get(f)) {
        Some(value) => value.to_string(),
        None => item.to_string(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// PollIngestor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct PollIngestor {
    core: Arc<IngestorCore>,
    config: PollIngestorConfig,
    client: reqwest::Client,
    runtime: Mutex<Option<PollRuntime>>,
}

struct PollRuntime {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl PollIngestor {
    pub fn new(
        caller: &str,
        connection: &str,
        config: PollIngestorConfig,
        buffer_capacity: usize,
    ) -> Result<Self, ProxyError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| {
                ProxyError::new(ErrorKind::IngestorStartFailed, format!("http client: {e}"))
            })?;
        Ok(Self {
            core: IngestorCore::new(caller, connection, buffer_capacity),
            config,
            client,
            runtime: Mutex::new(None),
        })
    }

    pub fn core(&self) -> &Arc<IngestorCore> {
        &self.core
    }

    async fn poll_once(
        client: &reqwest::Client,
        config: &PollIngestorConfig,
    ) -> Result<serde_json::Value, String> {
        let method = reqwest::Method::from_bytes(config.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| format!("invalid poll method: {}", config.method))?;
        let mut request = client.request(method, &config.url);
        for (name, value) in &config.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &config.body {
            request = request.json(body);
        }
        let response = request.send().await.map_err(|e| format!("poll failed: {e}"))?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!("poll returned HTTP {status}"));
        }
        response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| format!("poll body was not JSON: {e}"))
    }
}

#[async_trait]
impl Ingestor for PollIngestor {
    async fn start(&self) -> Result<(), ProxyError> {
        let mut runtime = self.runtime.lock();
        if runtime.is_some() {
            return Ok(());
        }
        self.core.set_state(IngestorState::Starting);

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let core = self.core.clone();
        let config = self.config.clone();
        let client = self.client.clone();

        let task = tokio::spawn(async move {
            let event_type = config.event_type.clone().unwrap_or_else(|| "poll".into());
            let mut seen = SeenKeys::new(2 * core.status().buffer_capacity);
            let mut ticker = tokio::time::interval(Duration::from_millis(
                config.interval_ms.max(MIN_INTERVAL_MS),
            ));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match Self::poll_once(&client, &config).await {
                    Ok(body) => {
                        core.set_state(IngestorState::Connected);
                        let items = extract_items(&body, config.response_path.as_deref());
                        for item in items {
                            let key = dedup_key(&item, config.deduplicate_by.as_deref());
                            if seen.insert(key) {
                                core.push_event(&event_type, item);
                            }
                        }
                    }
                    Err(message) => {
                        tracing::warn!(
                            connection = %core.connection(),
                            error = %message,
                            "poll attempt failed"
                        );
                        core.set_error(message);
                    }
                }
            }
        });

        *runtime = Some(PollRuntime { cancel, task });
        Ok(())
    }

    async fn stop(&self) {
        let runtime = self.runtime.lock().take();
        if let Some(rt) = runtime {
            rt.cancel.cancel();
            let _ = rt.task.await;
        }
        self.core.set_state(IngestorState::Stopped);
    }

    fn status(&self) -> IngestorStatus {
        self.core.status()
    }

    fn events(&self, after_id: i64) -> Vec<IngestedEvent> {
        self.core.events_since(after_id)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
