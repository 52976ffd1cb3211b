//! Ingestor registry and factory.
//!
//! One ingestor instance exists per `(caller, connection)` pair; every
//! session of that caller shares it.  The manager owns the registry map,
//! merges caller overrides into connection templates, resolves secrets, and
//! drives lifecycle.  A failing ingestor never takes down its siblings.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use parking_lot::RwLock;

use dl_domain::config::{CallerConfig, IngestorConfig, RemoteConfig};
use dl_domain::event::IngestedEvent;
use dl_domain::resolve::{self, ResolvedRoute};
use dl_domain::{ErrorKind, ProxyError};

use crate::base::{Ingestor, IngestorStatus};
use crate::discord::DiscordIngestor;
use crate::poll::PollIngestor;
use crate::webhook::WebhookIngestor;

pub struct IngestorManager {
    /// Keyed `caller:connection`.  Mutated only here; readers get snapshots.
    registry: RwLock<HashMap<String, Arc<dyn Ingestor>>>,
}

fn registry_key(caller: &str, connection: &str) -> String {
    format!("{caller}:{connection}")
}

impl Default for IngestorManager {
    fn default() -> Self {
        Self::new()
    }
}

impl IngestorManager {
    pub fn new() -> Self {
        Self {
            registry: RwLock::new(HashMap::new()),
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Create and start every configured ingestor.  Individual failures are
    /// logged and skipped.
    pub async fn start_all(&self, config: &RemoteConfig) {
        for (caller_alias, caller) in &config.callers {
            let raw = match resolve::caller_routes(config, caller_alias) {
                Ok(routes) => routes,
                Err(e) => {
                    tracing::warn!(caller = %caller_alias, error = %e, "skipping caller routes");
                    continue;
                }
            };
            for route in raw.iter().filter(|r| r.ingestor.is_some()) {
                let resolved = match resolve::resolve_routes(std::slice::from_ref(route), caller) {
                    Ok(mut routes) => routes.remove(0),
                    Err(e) => {
                        tracing::warn!(
                            caller = %caller_alias,
                            connection = %route.alias,
                            error = %e,
                            "ingestor route resolution failed"
                        );
                        continue;
                    }
                };
                if let Err(e) = self.spawn(caller_alias, caller, &resolved).await {
                    tracing::warn!(
                        caller = %caller_alias,
                        connection = %route.alias,
                        error = %e,
                        "ingestor failed to start"
                    );
                }
            }
        }
    }

    /// Stop everything in parallel and clear the registry.
    pub async fn stop_all(&self) {
        let drained: Vec<Arc<dyn Ingestor>> = {
            let mut registry = self.registry.write();
            registry.drain().map(|(_, ing)| ing).collect()
        };
        join_all(drained.iter().map(|ing| ing.stop())).await;
    }

    /// Start one `(caller, connection)` ingestor.  Starting one that is
    /// already running is success and reports its current state.
    pub async fn start_one(
        &self,
        config: &RemoteConfig,
        caller_alias: &str,
        connection: &str,
    ) -> Result<IngestorStatus, ProxyError> {
        let caller = config.caller(caller_alias)?;
        if !caller.connections.iter().any(|c| c == connection) {
            return Err(ProxyError::new(
                ErrorKind::CallerLacksConnection,
                format!("caller {caller_alias} does not enable {connection}"),
            ));
        }
        if let Some(existing) = self.get(caller_alias, connection) {
            return Ok(existing.status());
        }

        let raw = resolve::caller_routes(config, caller_alias)?;
        let route = raw
            .iter()
            .find(|r| r.alias == connection)
            .ok_or_else(|| ProxyError::unknown_connection(connection))?;
        if route.ingestor.is_none() {
            return Err(ProxyError::new(
                ErrorKind::IngestorNotRunning,
                format!("connection {connection} has no ingestor configured"),
            ));
        }
        let resolved = resolve::resolve_routes(std::slice::from_ref(route), caller)?.remove(0);
        let ingestor = self.spawn(caller_alias, caller, &resolved).await?;
        Ok(ingestor.status())
    }

    /// Stop and deregister one ingestor.
    pub async fn stop_one(&self, caller_alias: &str, connection: &str) -> Result<(), ProxyError> {
        let removed = self
            .registry
            .write()
            .remove(&registry_key(caller_alias, connection));
        match removed {
            Some(ingestor) => {
                ingestor.stop().await;
                Ok(())
            }
            None => Err(ProxyError::new(
                ErrorKind::IngestorNotRunning,
                format!("no ingestor running for {caller_alias}:{connection}"),
            )),
        }
    }

    pub async fn restart_one(
        &self,
        config: &RemoteConfig,
        caller_alias: &str,
        connection: &str,
    ) -> Result<IngestorStatus, ProxyError> {
        if self.get(caller_alias, connection).is_some() {
            self.stop_one(caller_alias, connection).await?;
        }
        self.start_one(config, caller_alias, connection).await
    }

    // ── Queries ──────────────────────────────────────────────────────

    fn get(&self, caller_alias: &str, connection: &str) -> Option<Arc<dyn Ingestor>> {
        self.registry
            .read()
            .get(&registry_key(caller_alias, connection))
            .cloned()
    }

    fn for_caller(&self, caller_alias: &str) -> Vec<(String, Arc<dyn Ingestor>)> {
        let prefix = format!("{caller_alias}:");
        let mut entries: Vec<(String, Arc<dyn Ingestor>)> = self
            .registry
            .read()
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .map(|(key, ing)| (key.clone(), ing.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn get_events(
        &self,
        caller_alias: &str,
        connection: &str,
        after_id: i64,
    ) -> Result<Vec<IngestedEvent>, ProxyError> {
        let ingestor = self.get(caller_alias, connection).ok_or_else(|| {
            ProxyError::new(
                ErrorKind::IngestorNotRunning,
                format!("no ingestor running for {caller_alias}:{connection}"),
            )
        })?;
        Ok(ingestor.events(after_id))
    }

    /// Merge events from all of the caller's ingestors, ordered by
    /// `receivedAt` (lexicographic RFC 3339 compare).  Ties keep per-source
    /// insertion order — the sort is stable.
    pub fn get_all_events(&self, caller_alias: &str, after_id: i64) -> Vec<IngestedEvent> {
        let mut events: Vec<IngestedEvent> = self
            .for_caller(caller_alias)
            .into_iter()
            .flat_map(|(_, ing)| ing.events(after_id))
            .collect();
        events.sort_by(|a, b| a.received_at.cmp(&b.received_at));
        events
    }

    pub fn get_statuses(&self, caller_alias: &str) -> Vec<IngestorStatus> {
        self.for_caller(caller_alias)
            .into_iter()
            .map(|(_, ing)| ing.status())
            .collect()
    }

    /// All running webhook ingestors mounted at `path`, across callers.
    pub fn webhook_ingestors(&self, path: &str) -> Vec<Arc<dyn Ingestor>> {
        self.registry
            .read()
            .values()
            .filter(|ing| ing.webhook_path() == Some(path))
            .cloned()
            .collect()
    }

    // ── Factory ──────────────────────────────────────────────────────

    async fn spawn(
        &self,
        caller_alias: &str,
        caller: &CallerConfig,
        route: &ResolvedRoute,
    ) -> Result<Arc<dyn Ingestor>, ProxyError> {
        let template = route.ingestor.as_ref().ok_or_else(|| {
            ProxyError::new(
                ErrorKind::IngestorNotRunning,
                format!("connection {} has no ingestor configured", route.alias),
            )
        })?;
        let merged = match caller.ingestor_overrides.get(&route.alias) {
            Some(overrides) => overrides.apply(template),
            None => template.clone(),
        };

        let ingestor = build_ingestor(caller_alias, &route.alias, &merged, &route.secrets)?;
        ingestor.start().await.map_err(|e| {
            ProxyError::new(ErrorKind::IngestorStartFailed, e.message)
        })?;
        self.registry
            .write()
            .insert(registry_key(caller_alias, &route.alias), ingestor.clone());
        tracing::info!(
            caller = %caller_alias,
            connection = %route.alias,
            kind = merged.kind(),
            "ingestor started"
        );
        Ok(ingestor)
    }
}

/// Instantiate a concrete ingestor for a `{type, protocol}` combination.
fn build_ingestor(
    caller_alias: &str,
    connection: &str,
    config: &IngestorConfig,
    secrets: &HashMap<String, String>,
) -> Result<Arc<dyn Ingestor>, ProxyError> {
    let capacity = config.buffer_size();
    match config {
        IngestorConfig::Websocket(ws) if ws.protocol == "discord" => {
            let token = secrets.get("botToken").cloned().unwrap_or_default();
            Ok(Arc::new(DiscordIngestor::new(
                caller_alias,
                connection,
                ws.clone(),
                capacity,
                token,
            )?))
        }
        IngestorConfig::Websocket(ws) => {
            tracing::error!(protocol = %ws.protocol, "no websocket ingestor for protocol");
            Err(ProxyError::new(
                ErrorKind::BadConfig,
                format!("no ingestor registered for websocket:{}", ws.protocol),
            ))
        }
        IngestorConfig::Webhook(wh) => {
            let secret = wh
                .signature_secret
                .as_ref()
                .and_then(|name| secrets.get(name))
                .cloned();
            Ok(Arc::new(WebhookIngestor::new(
                caller_alias,
                connection,
                wh.clone(),
                capacity,
                secret,
            )?))
        }
        IngestorConfig::Poll(p) => Ok(Arc::new(PollIngestor::new(
            caller_alias,
            connection,
            p.clone(),
            capacity,
        )?)),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::IngestorState;
    use dl_domain::config::{IngestorOverrides, Route, WebhookIngestorConfig};

    /// Unverified webhook connector: passive, starts without network.
    fn hook_route(alias: &str, path: &str) -> Route {
        Route {
            alias: alias.into(),
            allowed_endpoints: vec![],
            base_url: None,
            secrets: HashMap::new(),
            headers: HashMap::new(),
            ingestor: Some(IngestorConfig::Webhook(WebhookIngestorConfig {
                protocol: "github".into(),
                webhook_path: path.into(),
                signature_header: None,
                signature_secret: None,
                tolerance_secs: None,
                callback_url: None,
                buffer_size: None,
            })),
        }
    }

    fn plain_route(alias: &str) -> Route {
        Route {
            alias: alias.into(),
            allowed_endpoints: vec!["https://api.example.com/**".into()],
            base_url: None,
            secrets: HashMap::new(),
            headers: HashMap::new(),
            ingestor: None,
        }
    }

    fn fixture() -> RemoteConfig {
        let caller = CallerConfig {
            name: None,
            peer_key_dir: "keys/peers/agent".into(),
            connections: vec!["hooks-a".into(), "hooks-b".into(), "plain".into()],
            env: HashMap::new(),
            role: Default::default(),
            ingestor_overrides: HashMap::new(),
        };
        RemoteConfig {
            host: "127.0.0.1".into(),
            port: 0,
            local_keys_dir: "keys/server".into(),
            callers: HashMap::from([("agent".to_string(), caller)]),
            connectors: vec![
                hook_route("hooks-a", "path-a"),
                hook_route("hooks-b", "path-b"),
                plain_route("plain"),
            ],
            rate_limit_per_minute: 60,
            request_timeout_ms: 30_000,
            session_idle_secs: 1800,
        }
    }

    #[tokio::test]
    async fn start_all_spawns_configured_ingestors() {
        let config = fixture();
        let manager = IngestorManager::new();
        manager.start_all(&config).await;

        let statuses = manager.get_statuses("agent");
        assert_eq!(statuses.len(), 2);
        assert!(statuses.iter().all(|s| s.state == IngestorState::Connected));
        manager.stop_all().await;
        assert!(manager.get_statuses("agent").is_empty());
    }

    #[tokio::test]
    async fn start_one_error_kinds() {
        let config = fixture();
        let manager = IngestorManager::new();

        let err = manager.start_one(&config, "ghost", "hooks-a").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnknownCaller);

        let err = manager.start_one(&config, "agent", "other").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::CallerLacksConnection);

        let err = manager.start_one(&config, "agent", "plain").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::IngestorNotRunning);
    }

    #[tokio::test]
    async fn starting_twice_reports_current_state() {
        let config = fixture();
        let manager = IngestorManager::new();
        let first = manager.start_one(&config, "agent", "hooks-a").await.unwrap();
        assert_eq!(first.state, IngestorState::Connected);
        let second = manager.start_one(&config, "agent", "hooks-a").await.unwrap();
        assert_eq!(second.state, IngestorState::Connected);
        assert_eq!(manager.get_statuses("agent").len(), 1);
    }

    #[tokio::test]
    async fn stop_one_removes_and_errors_when_absent() {
        let config = fixture();
        let manager = IngestorManager::new();
        manager.start_one(&config, "agent", "hooks-a").await.unwrap();
        manager.stop_one("agent", "hooks-a").await.unwrap();
        let err = manager.stop_one("agent", "hooks-a").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::IngestorNotRunning);
    }

    #[tokio::test]
    async fn restart_one_replaces_the_instance() {
        let config = fixture();
        let manager = IngestorManager::new();
        manager.start_one(&config, "agent", "hooks-a").await.unwrap();
        let status = manager.restart_one(&config, "agent", "hooks-a").await.unwrap();
        assert_eq!(status.state, IngestorState::Connected);
        // Restarting a stopped ingestor just starts it.
        manager.stop_one("agent", "hooks-a").await.unwrap();
        let status = manager.restart_one(&config, "agent", "hooks-a").await.unwrap();
        assert_eq!(status.state, IngestorState::Connected);
    }

    #[tokio::test]
    async fn get_events_requires_a_running_ingestor() {
        let manager = IngestorManager::new();
        let err = manager.get_events("agent", "hooks-a", -1).unwrap_err();
        assert_eq!(err.kind, ErrorKind::IngestorNotRunning);
    }

    #[tokio::test]
    async fn webhook_ingestors_filter_by_path() {
        let config = fixture();
        let manager = IngestorManager::new();
        manager.start_all(&config).await;
        assert_eq!(manager.webhook_ingestors("path-a").len(), 1);
        assert_eq!(manager.webhook_ingestors("path-b").len(), 1);
        assert!(manager.webhook_ingestors("path-z").is_empty());
    }

    #[tokio::test]
    async fn all_events_merge_sorted_by_received_at() {
        let config = fixture();
        let manager = IngestorManager::new();
        manager.start_all(&config).await;

        let a = manager.webhook_ingestors("path-a").remove(0);
        let b = manager.webhook_ingestors("path-b").remove(0);
        let headers = HashMap::from([("x-github-event".to_string(), "push".to_string())]);
        for i in 0..2 {
            let body = format!("{{\"n\":{i}}}");
            assert!(a.handle_webhook(&headers, body.as_bytes()).await.accepted);
            assert!(b.handle_webhook(&headers, body.as_bytes()).await.accepted);
        }

        let merged = manager.get_all_events("agent", -1);
        assert_eq!(merged.len(), 4);
        let stamps: Vec<&str> = merged.iter().map(|e| e.received_at.as_str()).collect();
        let mut sorted = stamps.clone();
        sorted.sort();
        assert_eq!(stamps, sorted);
    }

    #[tokio::test]
    async fn caller_override_changes_buffer_capacity() {
        let mut config = fixture();
        config
            .callers
            .get_mut("agent")
            .unwrap()
            .ingestor_overrides
            .insert(
                "hooks-a".into(),
                IngestorOverrides {
                    buffer_size: Some(5),
                    ..Default::default()
                },
            );
        let manager = IngestorManager::new();
        let status = manager.start_one(&config, "agent", "hooks-a").await.unwrap();
        assert_eq!(status.buffer_capacity, 5);
        // The shared template is untouched.
        let template = &config.connectors[0];
        match template.ingestor.as_ref().unwrap() {
            IngestorConfig::Webhook(wh) => assert_eq!(wh.buffer_size, None),
            _ => panic!("template type changed"),
        }
    }
}
