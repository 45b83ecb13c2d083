//! Relay envelope.
//!
//! The unit moved across the relay bus: a normalized event plus routing and
//! ordering metadata.
//!
//! # Format
//!
//! ```json
//! {
//!   "sourceId": 3,
//!   "eventType": "receive",
//!   "data": { "method": "ScoreUpdated", "args": [90] },
//!   "timestampMs": 1760601600000,
//!   "monotonicSeq": 17
//! }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::identifiers::SourceId;

// ============================================================================
// Event Types
// ============================================================================

/// Connection lifecycle change (`connecting`, `connected`, `disconnected`, `error`).
pub const EVENT_CONNECTION_STATE: &str = "connection-state";

/// Transport first confirmed to speak SignalR.
pub const EVENT_CONNECTION_CREATED: &str = "connection-created";

/// Message written by the monitored client.
pub const EVENT_SEND: &str = "send";

/// Message delivered to the monitored client.
pub const EVENT_RECEIVE: &str = "receive";

/// Record outside the known taxonomy.
pub const EVENT_UNCLASSIFIED: &str = "unclassified";

// ============================================================================
// Envelope
// ============================================================================

/// A normalized event ready for relay.
///
/// `monotonic_seq` is zero until the relay bus assigns it on publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Owning source.
    pub source_id: SourceId,

    /// One of the `EVENT_*` names.
    pub event_type: String,

    /// Flattened event payload.
    pub data: Value,

    /// Wall-clock milliseconds at observation time.
    pub timestamp_ms: i64,

    /// Per-source sequence, strictly increasing.
    pub monotonic_seq: u64,
}

impl Envelope {
    /// Creates an unsequenced envelope.
    #[inline]
    #[must_use]
    pub fn new(
        source_id: SourceId,
        event_type: impl Into<String>,
        data: Value,
        timestamp_ms: i64,
    ) -> Self {
        Self {
            source_id,
            event_type: event_type.into(),
            data,
            timestamp_ms,
            monotonic_seq: 0,
        }
    }

    /// Returns `true` if this envelope was produced strictly after `cleared_at`.
    #[inline]
    #[must_use]
    pub fn is_after(&self, cleared_at: i64) -> bool {
        self.timestamp_ms > cleared_at
    }
}

// ============================================================================
// Clock
// ============================================================================

/// Current wall-clock time in milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or_default()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[test]
    fn test_envelope_wire_format() {
        let source_id = SourceId::new(3).expect("non-zero");
        let mut envelope = Envelope::new(source_id, EVENT_RECEIVE, json!({ "method": "Foo" }), 10);
        envelope.monotonic_seq = 4;

        let value = serde_json::to_value(&envelope).expect("serialize");
        assert_eq!(
            value,
            json!({
                "sourceId": 3,
                "eventType": "receive",
                "data": { "method": "Foo" },
                "timestampMs": 10,
                "monotonicSeq": 4
            })
        );
    }

    #[test]
    fn test_is_after() {
        let source_id = SourceId::new(1).expect("non-zero");
        let envelope = Envelope::new(source_id, EVENT_SEND, Value::Null, 100);
        assert!(envelope.is_after(99));
        assert!(!envelope.is_after(100));
    }

    #[test]
    fn test_now_ms_is_positive() {
        assert!(now_ms() > 0);
    }
}
