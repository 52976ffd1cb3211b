//! The capability surface shared by every ingestor flavor.
//!
//! Concrete ingestors embed an [`IngestorCore`] — the ring buffer, the id
//! counter, lifecycle state, and counters — and implement the [`Ingestor`]
//! trait on top.  The manager holds them as `Arc<dyn Ingestor>`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;

use dl_domain::event::IngestedEvent;
use dl_domain::ProxyError;

use crate::ring::EventRing;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Lifecycle state & status snapshot
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestorState {
    Starting,
    Connected,
    Reconnecting,
    Stopped,
    Error,
}

/// Point-in-time view returned by `ingestor_status`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestorStatus {
    pub caller: String,
    pub connection: String,
    pub state: IngestorState,
    pub buffer_capacity: usize,
    pub buffered_events: usize,
    pub total_events_received: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Result of a webhook dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WebhookOutcome {
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl WebhookOutcome {
    pub fn accepted() -> Self {
        Self {
            accepted: true,
            reason: None,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            reason: Some(reason.into()),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// IngestorCore
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct CoreInner {
    ring: EventRing,
    state: IngestorState,
    error_message: Option<String>,
    /// Next id to assign; survives ring eviction and clears.
    next_id: i64,
    total_events_received: u64,
    last_event_at: Option<String>,
}

/// Shared state embedded in every concrete ingestor: one writer (the
/// ingestor's own task), many readers (request handlers) through the mutex.
pub struct IngestorCore {
    caller: String,
    connection: String,
    inner: Mutex<CoreInner>,
    /// Best-effort observers; lagging or closed subscribers are dropped.
    observers: Mutex<Vec<mpsc::Sender<IngestedEvent>>>,
}

impl IngestorCore {
    pub fn new(caller: &str, connection: &str, buffer_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            caller: caller.to_string(),
            connection: connection.to_string(),
            inner: Mutex::new(CoreInner {
                ring: EventRing::new(buffer_capacity),
                state: IngestorState::Stopped,
                error_message: None,
                next_id: 0,
                total_events_received: 0,
                last_event_at: None,
            }),
            observers: Mutex::new(Vec::new()),
        })
    }

    pub fn caller(&self) -> &str {
        &self.caller
    }

    pub fn connection(&self) -> &str {
        &self.connection
    }

    /// Assign the next id, timestamp the event, and append it.
    pub fn push_event(&self, event_type: &str, data: serde_json::Value) -> IngestedEvent {
        let event = {
            let mut inner = self.inner.lock();
            let event = IngestedEvent {
                id: inner.next_id,
                received_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
                source: self.connection.clone(),
                event_type: event_type.to_string(),
                data,
            };
            inner.next_id += 1;
            inner.total_events_received += 1;
            inner.last_event_at = Some(event.received_at.clone());
            inner.ring.push(event.clone());
            event
        };

        let mut observers = self.observers.lock();
        observers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => true, // lagging, skip this event
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        event
    }

    /// Events after the cursor; a negative cursor returns the full buffer.
    pub fn events_since(&self, after_id: i64) -> Vec<IngestedEvent> {
        let inner = self.inner.lock();
        if after_id < 0 {
            inner.ring.to_vec()
        } else {
            inner.ring.since(after_id)
        }
    }

    /// Subscribe for future events.  Delivery is best-effort.
    pub fn subscribe(&self) -> mpsc::Receiver<IngestedEvent> {
        let (tx, rx) = mpsc::channel(64);
        self.observers.lock().push(tx);
        rx
    }

    /// Drop buffered events.  Does not reset the id counter.
    pub fn clear(&self) {
        self.inner.lock().ring.clear();
    }

    pub fn state(&self) -> IngestorState {
        self.inner.lock().state
    }

    pub fn set_state(&self, state: IngestorState) {
        let mut inner = self.inner.lock();
        inner.state = state;
        if state != IngestorState::Error {
            inner.error_message = None;
        }
    }

    pub fn set_error(&self, message: impl Into<String>) {
        let mut inner = self.inner.lock();
        inner.state = IngestorState::Error;
        inner.error_message = Some(message.into());
    }

    pub fn status(&self) -> IngestorStatus {
        let inner = self.inner.lock();
        IngestorStatus {
            caller: self.caller.clone(),
            connection: self.connection.clone(),
            state: inner.state,
            buffer_capacity: inner.ring.capacity(),
            buffered_events: inner.ring.len(),
            total_events_received: inner.total_events_received,
            last_event_at: inner.last_event_at.clone(),
            error_message: inner.error_message.clone(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Ingestor capability
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The capability set the manager programs against.
#[async_trait]
pub trait Ingestor: Send + Sync {
    /// Transition `stopped -> starting -> connected` (or `error`).
    /// Idempotent: starting a running ingestor is a no-op.
    async fn start(&self) -> Result<(), ProxyError>;

    /// Transition any state to `stopped`, tearing down tasks.
    async fn stop(&self);

    fn status(&self) -> IngestorStatus;

    fn events(&self, after_id: i64) -> Vec<IngestedEvent>;

    /// The `/webhooks/:path` suffix this ingestor listens on, if any.
    fn webhook_path(&self) -> Option<&str> {
        None
    }

    /// Verify and ingest an incoming webhook.  Header names are lowercased.
    async fn handle_webhook(
        &self,
        _headers: &HashMap<String, String>,
        _body: &[u8],
    ) -> WebhookOutcome {
        WebhookOutcome::rejected("Not a webhook ingestor")
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_increase_monotonically() {
        let core = IngestorCore::new("agent", "github", 10);
        let a = core.push_event("push", serde_json::json!({}));
        let b = core.push_event("push", serde_json::json!({}));
        assert_eq!((a.id, b.id), (0, 1));
    }

    #[test]
    fn clear_does_not_reset_the_id_counter() {
        let core = IngestorCore::new("agent", "github", 10);
        for _ in 0..5 {
            core.push_event("push", serde_json::json!({}));
        }
        core.clear();
        assert!(core.events_since(-1).is_empty());
        let next = core.push_event("push", serde_json::json!({}));
        assert_eq!(next.id, 5);
    }

    #[test]
    fn ids_keep_increasing_across_eviction() {
        let core = IngestorCore::new("agent", "github", 3);
        for _ in 0..10 {
            core.push_event("tick", serde_json::json!({}));
        }
        let ids: Vec<i64> = core.events_since(-1).iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![7, 8, 9]);
        assert_eq!(core.status().total_events_received, 10);
        assert_eq!(core.status().buffered_events, 3);
    }

    #[test]
    fn negative_cursor_returns_full_buffer() {
        let core = IngestorCore::new("agent", "github", 10);
        core.push_event("a", serde_json::json!({}));
        core.push_event("b", serde_json::json!({}));
        assert_eq!(core.events_since(-1).len(), 2);
        assert_eq!(core.events_since(0).len(), 1);
    }

    #[test]
    fn status_reflects_state_and_error() {
        let core = IngestorCore::new("agent", "github", 10);
        core.set_state(IngestorState::Starting);
        assert_eq!(core.status().state, IngestorState::Starting);
        core.set_error("gateway unreachable");
        let status = core.status();
        assert_eq!(status.state, IngestorState::Error);
        assert_eq!(status.error_message.as_deref(), Some("gateway unreachable"));
        // Leaving the error state clears the message.
        core.set_state(IngestorState::Connected);
        assert!(core.status().error_message.is_none());
    }

    #[tokio::test]
    async fn observers_receive_pushed_events() {
        let core = IngestorCore::new("agent", "github", 10);
        let mut rx = core.subscribe();
        core.push_event("push", serde_json::json!({"n": 1}));
        let got = rx.recv().await.unwrap();
        assert_eq!(got.event_type, "push");
        assert_eq!(got.id, 0);
    }

    #[tokio::test]
    async fn closed_observers_are_pruned() {
        let core = IngestorCore::new("agent", "github", 10);
        let rx = core.subscribe();
        drop(rx);
        core.push_event("push", serde_json::json!({}));
        assert!(core.observers.lock().is_empty());
    }
}
