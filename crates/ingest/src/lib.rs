//! Event ingestors: long-lived collectors that buffer external events for
//! later retrieval through `poll_events`.
//!
//! Three flavors exist — a Discord gateway WebSocket client, passive webhook
//! receivers (GitHub/Stripe/Trello), and a periodic HTTP poller.  All share
//! [`base::IngestorCore`]: a bounded ring of events with monotonically
//! assigned ids, lifecycle state, and counters.  [`manager::IngestorManager`]
//! owns one instance per `(caller, connection)` pair.

pub mod backoff;
pub mod base;
pub mod discord;
pub mod manager;
pub mod poll;
pub mod ring;
pub mod webhook;

pub use base::{Ingestor, IngestorCore, IngestorState, IngestorStatus, WebhookOutcome};
pub use manager::IngestorManager;
