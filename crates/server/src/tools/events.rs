//! Event tools: polling buffered events and ingestor lifecycle.

use serde::Deserialize;
use serde_json::Value;

use dl_domain::{ErrorKind, ProxyError};

use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PollEventsInput {
    #[serde(default)]
    connection: Option<String>,
    /// Cursor: only events with a strictly greater id are returned.
    /// Negative means "everything still buffered".
    #[serde(default = "d_after_id")]
    after_id: i64,
}

impl Default for PollEventsInput {
    fn default() -> Self {
        Self {
            connection: None,
            after_id: d_after_id(),
        }
    }
}

fn d_after_id() -> i64 {
    -1
}

fn parse_input<T: serde::de::DeserializeOwned + Default>(input: Value) -> Result<T, ProxyError> {
    if input.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(input)
        .map_err(|e| ProxyError::new(ErrorKind::MalformedMessage, format!("bad input: {e}")))
}

/// `poll_events` — drain one connection's buffer (or all of the caller's,
/// merged by `receivedAt`) past the cursor.
pub fn poll_events(state: &AppState, caller_alias: &str, input: Value) -> Result<Value, ProxyError> {
    let input: PollEventsInput = parse_input(input)?;
    let events = match &input.connection {
        Some(connection) => state
            .ingestors
            .get_events(caller_alias, connection, input.after_id)?,
        None => state.ingestors.get_all_events(caller_alias, input.after_id),
    };
    let cursor = events.iter().map(|e| e.id).max().unwrap_or(input.after_id);
    Ok(serde_json::json!({ "events": events, "cursor": cursor }))
}

/// `ingestor_status` — lifecycle snapshots, optionally for one connection.
pub fn ingestor_status(
    state: &AppState,
    caller_alias: &str,
    input: Value,
) -> Result<Value, ProxyError> {
    let input: PollEventsInput = parse_input(input)?;
    let mut statuses = state.ingestors.get_statuses(caller_alias);
    if let Some(connection) = &input.connection {
        statuses.retain(|s| &s.connection == connection);
    }
    Ok(serde_json::json!({ "ingestors": statuses }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LifecycleInput {
    connection: String,
}

pub async fn ingestor_start(
    state: &AppState,
    caller_alias: &str,
    input: Value,
) -> Result<Value, ProxyError> {
    let input: LifecycleInput = serde_json::from_value(input)
        .map_err(|e| ProxyError::new(ErrorKind::MalformedMessage, format!("bad input: {e}")))?;
    let status = state
        .ingestors
        .start_one(&state.config, caller_alias, &input.connection)
        .await?;
    Ok(serde_json::json!({ "status": status }))
}

pub async fn ingestor_stop(
    state: &AppState,
    caller_alias: &str,
    input: Value,
) -> Result<Value, ProxyError> {
    let input: LifecycleInput = serde_json::from_value(input)
        .map_err(|e| ProxyError::new(ErrorKind::MalformedMessage, format!("bad input: {e}")))?;
    state
        .ingestors
        .stop_one(caller_alias, &input.connection)
        .await?;
    Ok(serde_json::json!({ "stopped": input.connection }))
}

pub async fn ingestor_restart(
    state: &AppState,
    caller_alias: &str,
    input: Value,
) -> Result<Value, ProxyError> {
    let input: LifecycleInput = serde_json::from_value(input)
        .map_err(|e| ProxyError::new(ErrorKind::MalformedMessage, format!("bad input: {e}")))?;
    let status = state
        .ingestors
        .restart_one(&state.config, caller_alias, &input.connection)
        .await?;
    Ok(serde_json::json!({ "status": status }))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
