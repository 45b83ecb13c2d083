//! Frame to event normalization.
//!
//! Maps each [`ProtocolFrame`] to a [`MonitorEvent`]. Never fails: shapes it
//! does not understand pass through as `unclassified` with the raw record.
//!
//! | Frame | Event |
//! |-------|-------|
//! | `HandshakeRequest` | `connection-state` `connecting` + protocol/version |
//! | `HandshakeResponse` | `connection-state` `connected` |
//! | `HandshakeError` | `connection-state` `error` + error |
//! | `Invocation` | `send`/`receive` by direction, method = target |
//! | `StreamItem` | `receive` `[StreamItem]` |
//! | `Completion` | `send`/`receive` `[Completion]` + result/error |
//! | `StreamInvocation` | `send` `[StreamInvocation] <target>` |
//! | `CancelInvocation` | `send` `[CancelInvocation]` |
//! | `Ping` | none |
//! | `Close` | `connection-state` `disconnected` + frame error |
//! | `Unclassified` | `unclassified` |

// ============================================================================
// Imports
// ============================================================================

use serde_json::Value;

use crate::protocol::{Direction, FrameKind, ProtocolFrame};

use super::types::{CallEvent, ConnectionState, MonitorEvent, StateChange};

// ============================================================================
// Normalization
// ============================================================================

/// Normalizes a frame observed on the connection at `url`.
///
/// Returns `None` only for `Ping`.
#[must_use]
pub fn normalize(frame: &ProtocolFrame, url: &str) -> Option<MonitorEvent> {
    let event = match frame.kind {
        FrameKind::HandshakeRequest => {
            let mut change = StateChange::new(ConnectionState::Connecting, url);
            change.protocol = frame.field("protocol").cloned();
            change.version = frame.field("version").cloned();
            MonitorEvent::ConnectionState(change)
        }

        FrameKind::HandshakeResponse => {
            MonitorEvent::ConnectionState(StateChange::new(ConnectionState::Connected, url))
        }

        FrameKind::HandshakeError => {
            let mut change = StateChange::new(ConnectionState::Error, url);
            change.error = frame.field("error").cloned();
            MonitorEvent::ConnectionState(change)
        }

        FrameKind::Invocation => {
            let call = CallEvent {
                method: frame.get_string("target"),
                args: arguments(frame),
                invocation_id: invocation_id(frame),
                error: None,
            };
            directed(frame.direction, call)
        }

        FrameKind::StreamItem => MonitorEvent::Receive(CallEvent {
            method: "[StreamItem]".to_string(),
            args: Value::Array(vec![frame.field("item").cloned().unwrap_or_default()]),
            invocation_id: invocation_id(frame),
            error: None,
        }),

        FrameKind::Completion => {
            let args = match frame.field("result") {
                Some(result) => Value::Array(vec![result.clone()]),
                None => Value::Array(Vec::new()),
            };
            let call = CallEvent {
                method: "[Completion]".to_string(),
                args,
                invocation_id: invocation_id(frame),
                error: non_null(frame.field("error")),
            };
            directed(frame.direction, call)
        }

        FrameKind::StreamInvocation => MonitorEvent::Send(CallEvent {
            method: format!("[StreamInvocation] {}", frame.get_string("target")),
            args: arguments(frame),
            invocation_id: invocation_id(frame),
            error: None,
        }),

        FrameKind::CancelInvocation => MonitorEvent::Send(CallEvent {
            method: "[CancelInvocation]".to_string(),
            args: Value::Array(Vec::new()),
            invocation_id: invocation_id(frame),
            error: None,
        }),

        FrameKind::Ping => return None,

        FrameKind::Close => {
            // Close code and reason only exist at the transport layer.
            let mut change = StateChange::new(ConnectionState::Disconnected, url);
            change.error = non_null(frame.field("error"));
            MonitorEvent::ConnectionState(change)
        }

        FrameKind::Unclassified(_) => MonitorEvent::Unclassified {
            direction: frame.direction,
            url: url.to_string(),
            raw: frame.payload.clone(),
        },
    };

    Some(event)
}

// ============================================================================
// Helpers
// ============================================================================

/// Wraps a call in the event matching its direction.
#[inline]
fn directed(direction: Direction, call: CallEvent) -> MonitorEvent {
    match direction {
        Direction::Send => MonitorEvent::Send(call),
        Direction::Receive => MonitorEvent::Receive(call),
    }
}

/// Gets `arguments` as an array, defaulting to empty.
#[inline]
fn arguments(frame: &ProtocolFrame) -> Value {
    match frame.field("arguments") {
        Some(Value::Array(args)) => Value::Array(args.clone()),
        Some(Value::Null) | None => Value::Array(Vec::new()),
        Some(other) => Value::Array(vec![other.clone()]),
    }
}

/// Gets `invocationId`, whatever its JSON type.
#[inline]
fn invocation_id(frame: &ProtocolFrame) -> Option<Value> {
    non_null(frame.field("invocationId"))
}

#[inline]
fn non_null(value: Option<&Value>) -> Option<Value> {
    value.filter(|value| !value.is_null()).cloned()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    use crate::protocol::decode;

    const URL: &str = "ws://localhost:5000/scoreHub";

    fn events(raw: &str, direction: Direction) -> Vec<MonitorEvent> {
        decode(raw, direction)
            .iter()
            .filter_map(|frame| normalize(frame, URL))
            .collect()
    }

    fn single(raw: &str, direction: Direction) -> MonitorEvent {
        let mut events = events(raw, direction);
        assert_eq!(events.len(), 1, "expected one event for {raw:?}");
        events.remove(0)
    }

    #[test]
    fn test_handshake_request_connecting() {
        let event = single("{\"protocol\":\"json\",\"version\":1}\u{1e}", Direction::Send);
        assert_eq!(event.event_type(), "connection-state");
        assert_eq!(
            event.data(),
            json!({ "state": "connecting", "protocol": "json", "version": 1, "url": URL })
        );
    }

    #[test]
    fn test_handshake_response_and_error() {
        let connected = single("{}\u{1e}", Direction::Receive);
        assert_eq!(connected.data()["state"], json!("connected"));

        let rejected = single("{\"error\":\"Handshake was canceled.\"}\u{1e}", Direction::Receive);
        assert_eq!(rejected.data()["state"], json!("error"));
        assert_eq!(rejected.data()["error"], json!("Handshake was canceled."));
    }

    #[test]
    fn test_invocation_by_direction() {
        let raw = "{\"type\":1,\"target\":\"Foo\",\"arguments\":[1,2]}\u{1e}";

        let received = single(raw, Direction::Receive);
        assert_eq!(received.event_type(), "receive");
        assert_eq!(received.data(), json!({ "method": "Foo", "args": [1, 2] }));

        let sent = single(raw, Direction::Send);
        assert_eq!(sent.event_type(), "send");
    }

    #[test]
    fn test_invocation_without_arguments() {
        let event = single("{\"type\":1,\"target\":\"Ping\"}", Direction::Send);
        assert_eq!(event.data()["args"], json!([]));
    }

    #[test]
    fn test_stream_item_always_receive() {
        let event = single("{\"type\":2,\"invocationId\":\"3\",\"item\":7}", Direction::Send);
        assert_eq!(event.event_type(), "receive");
        assert_eq!(
            event.data(),
            json!({ "method": "[StreamItem]", "args": [7], "invocationId": "3" })
        );
    }

    #[test]
    fn test_completion_with_result_and_error() {
        let ok = single("{\"type\":3,\"invocationId\":\"1\",\"result\":{\"id\":\"a\"}}", Direction::Receive);
        assert_eq!(
            ok.data(),
            json!({ "method": "[Completion]", "args": [{ "id": "a" }], "invocationId": "1" })
        );

        let failed = single(
            "{\"type\":3,\"invocationId\":\"2\",\"error\":\"Calculation not found\"}",
            Direction::Receive,
        );
        assert_eq!(
            failed.data(),
            json!({
                "method": "[Completion]",
                "args": [],
                "invocationId": "2",
                "error": "Calculation not found"
            })
        );
    }

    #[test]
    fn test_stream_and_cancel_invocation_always_send() {
        let stream = single(
            "{\"type\":4,\"invocationId\":\"5\",\"target\":\"Counter\",\"arguments\":[10]}",
            Direction::Receive,
        );
        assert_eq!(stream.event_type(), "send");
        assert_eq!(stream.data()["method"], json!("[StreamInvocation] Counter"));

        let cancel = single("{\"type\":5,\"invocationId\":\"5\"}", Direction::Receive);
        assert_eq!(cancel.event_type(), "send");
        assert_eq!(
            cancel.data(),
            json!({ "method": "[CancelInvocation]", "args": [], "invocationId": "5" })
        );
    }

    #[test]
    fn test_ping_produces_nothing() {
        assert!(events("{\"type\":6}\u{1e}", Direction::Receive).is_empty());
    }

    #[test]
    fn test_close_frame_disconnected() {
        let event = single("{\"type\":7,\"error\":\"Server timeout\"}", Direction::Receive);
        assert_eq!(
            event.data(),
            json!({ "state": "disconnected", "url": URL, "error": "Server timeout" })
        );
    }

    #[test]
    fn test_unclassified_passes_raw() {
        let event = single("{\"type\":99,\"x\":true}", Direction::Receive);
        assert_eq!(event.event_type(), "unclassified");
        assert_eq!(
            event.data(),
            json!({ "direction": "receive", "url": URL, "raw": { "type": 99, "x": true } })
        );
    }
}
