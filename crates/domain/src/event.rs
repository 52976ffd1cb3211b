//! The event record ingestors buffer and callers poll.

use serde::{Deserialize, Serialize};

/// One buffered external event.
///
/// `received_at` is an RFC 3339 UTC timestamp kept as a string so that
/// cross-ingestor merges can order events by plain lexicographic compare.
/// `data` is whatever the external service sent; no schema is imposed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestedEvent {
    /// Monotonically increasing within one ingestor; survives buffer
    /// eviction and explicit clears.
    pub id: i64,
    pub received_at: String,
    /// Connection alias that produced the event.
    pub source: String,
    pub event_type: String,
    pub data: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_camel_case_keys() {
        let ev = IngestedEvent {
            id: 7,
            received_at: "2026-08-01T12:00:00Z".into(),
            source: "github".into(),
            event_type: "push".into(),
            data: serde_json::json!({"ref": "refs/heads/main"}),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["receivedAt"], "2026-08-01T12:00:00Z");
        assert_eq!(json["eventType"], "push");
    }
}
