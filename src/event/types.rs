//! Normalized monitor events.
//!
//! Transport-agnostic event shapes produced by the normalizer and flattened
//! into [`Envelope::data`](super::Envelope).
//!
//! | Event type | Shape |
//! |------------|-------|
//! | `connection-state` | `{ state, protocol?, version?, url, code?, reason?, error? }` |
//! | `connection-created` | `{ url }` |
//! | `send` / `receive` | `{ method, args, invocationId?, error? }` |
//! | `unclassified` | `{ direction, url, raw }` |

// ============================================================================
// Imports
// ============================================================================

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::identifiers::SourceId;
use crate::protocol::Direction;

use super::envelope::{
    EVENT_CONNECTION_CREATED, EVENT_CONNECTION_STATE, EVENT_RECEIVE, EVENT_SEND,
    EVENT_UNCLASSIFIED, Envelope,
};

// ============================================================================
// ConnectionState
// ============================================================================

/// Lifecycle state of a monitored connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Handshake request sent.
    Connecting,
    /// Handshake acknowledged.
    Connected,
    /// Close frame or transport close.
    Disconnected,
    /// Handshake rejected or transport error.
    Error,
}

impl ConnectionState {
    /// Reads the `state` field of a `connection-state` payload.
    #[must_use]
    pub fn from_data(data: &Value) -> Option<Self> {
        data.get("state")
            .cloned()
            .and_then(|state| serde_json::from_value(state).ok())
    }
}

// ============================================================================
// StateChange
// ============================================================================

/// Payload of a `connection-state` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateChange {
    /// New state.
    pub state: ConnectionState,

    /// Negotiated protocol name (handshake request only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Value>,

    /// Negotiated protocol version (handshake request only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Value>,

    /// URL of the monitored connection.
    pub url: String,

    /// Transport close code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,

    /// Transport close reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Handshake, close-frame or transport error text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl StateChange {
    /// Creates a bare state change for `url`.
    #[must_use]
    pub fn new(state: ConnectionState, url: impl Into<String>) -> Self {
        Self {
            state,
            protocol: None,
            version: None,
            url: url.into(),
            code: None,
            reason: None,
            error: None,
        }
    }
}

// ============================================================================
// CallEvent
// ============================================================================

/// Payload of a `send` or `receive` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallEvent {
    /// Hub method, or a bracketed label such as `[Completion]`.
    pub method: String,

    /// Call arguments, always an array.
    pub args: Value,

    /// Invocation correlation ID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invocation_id: Option<Value>,

    /// Completion error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

// ============================================================================
// MonitorEvent
// ============================================================================

/// A normalized event, before sequencing.
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorEvent {
    /// Transport confirmed to speak SignalR.
    ConnectionCreated {
        /// URL of the monitored connection.
        url: String,
    },

    /// Connection lifecycle change.
    ConnectionState(StateChange),

    /// Outgoing call.
    Send(CallEvent),

    /// Incoming call or result.
    Receive(CallEvent),

    /// Record outside the known taxonomy, passed through raw.
    Unclassified {
        /// Transport direction.
        direction: Direction,
        /// URL of the monitored connection.
        url: String,
        /// The parsed record.
        raw: Value,
    },
}

impl MonitorEvent {
    /// Creates a `connection-created` event.
    #[inline]
    #[must_use]
    pub fn created(url: impl Into<String>) -> Self {
        Self::ConnectionCreated { url: url.into() }
    }

    /// Creates a `disconnected` event from transport close metadata.
    #[must_use]
    pub fn disconnected(url: impl Into<String>, code: Option<u16>, reason: Option<String>) -> Self {
        let mut change = StateChange::new(ConnectionState::Disconnected, url);
        change.code = code;
        change.reason = reason;
        Self::ConnectionState(change)
    }

    /// Creates an `error` state event for a transport-level failure.
    #[must_use]
    pub fn transport_error(url: impl Into<String>) -> Self {
        let mut change = StateChange::new(ConnectionState::Error, url);
        change.error = Some(Value::String("WebSocket error".to_string()));
        Self::ConnectionState(change)
    }

    /// Returns the envelope event type.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ConnectionCreated { .. } => EVENT_CONNECTION_CREATED,
            Self::ConnectionState(_) => EVENT_CONNECTION_STATE,
            Self::Send(_) => EVENT_SEND,
            Self::Receive(_) => EVENT_RECEIVE,
            Self::Unclassified { .. } => EVENT_UNCLASSIFIED,
        }
    }

    /// Flattens the event into its envelope payload.
    #[must_use]
    pub fn data(&self) -> Value {
        match self {
            Self::ConnectionCreated { url } => json!({ "url": url }),
            Self::ConnectionState(change) => serde_json::to_value(change).unwrap_or_default(),
            Self::Send(call) | Self::Receive(call) => {
                serde_json::to_value(call).unwrap_or_default()
            }
            Self::Unclassified {
                direction,
                url,
                raw,
            } => json!({ "direction": direction, "url": url, "raw": raw }),
        }
    }

    /// Wraps the event into an unsequenced envelope.
    #[must_use]
    pub fn into_envelope(self, source_id: SourceId, timestamp_ms: i64) -> Envelope {
        Envelope::new(source_id, self.event_type(), self.data(), timestamp_ms)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_change_omits_absent_fields() {
        let event = MonitorEvent::ConnectionState(StateChange::new(
            ConnectionState::Connected,
            "ws://localhost/scoreHub",
        ));
        assert_eq!(
            event.data(),
            json!({ "state": "connected", "url": "ws://localhost/scoreHub" })
        );
        assert_eq!(event.event_type(), EVENT_CONNECTION_STATE);
    }

    #[test]
    fn test_disconnected_carries_close_metadata() {
        let event = MonitorEvent::disconnected("ws://h/hub", Some(1006), Some("gone".into()));
        assert_eq!(
            event.data(),
            json!({ "state": "disconnected", "url": "ws://h/hub", "code": 1006, "reason": "gone" })
        );
    }

    #[test]
    fn test_transport_error() {
        let event = MonitorEvent::transport_error("ws://h/hub");
        assert_eq!(ConnectionState::from_data(&event.data()), Some(ConnectionState::Error));
        assert_eq!(event.data()["error"], json!("WebSocket error"));
    }

    #[test]
    fn test_call_event_camel_case() {
        let event = MonitorEvent::Send(CallEvent {
            method: "StartCalculation".into(),
            args: json!(["sequential"]),
            invocation_id: Some(json!("0")),
            error: None,
        });
        assert_eq!(
            event.data(),
            json!({ "method": "StartCalculation", "args": ["sequential"], "invocationId": "0" })
        );
    }

    #[test]
    fn test_into_envelope() {
        let source_id = SourceId::new(2).expect("non-zero");
        let envelope = MonitorEvent::created("ws://h/hub").into_envelope(source_id, 55);
        assert_eq!(envelope.event_type, EVENT_CONNECTION_CREATED);
        assert_eq!(envelope.timestamp_ms, 55);
        assert_eq!(envelope.monotonic_seq, 0);
        assert_eq!(envelope.data, json!({ "url": "ws://h/hub" }));
    }

    #[test]
    fn test_connection_state_from_data() {
        assert_eq!(
            ConnectionState::from_data(&json!({ "state": "connecting" })),
            Some(ConnectionState::Connecting)
        );
        assert_eq!(ConnectionState::from_data(&json!({ "state": "weird" })), None);
        assert_eq!(ConnectionState::from_data(&json!({})), None);
    }
}
