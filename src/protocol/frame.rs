//! Decoded SignalR protocol frames.
//!
//! A [`ProtocolFrame`] is one JSON record split out of a raw WebSocket text
//! message and classified into the SignalR message taxonomy.
//!
//! # Message Types
//!
//! | Code | Kind | Shape |
//! |------|------|-------|
//! | – | `HandshakeRequest` | `{ "protocol": "json", "version": 1 }` |
//! | – | `HandshakeResponse` | `{}` |
//! | – | `HandshakeError` | `{ "error": "..." }` |
//! | 1 | `Invocation` | `{ "type": 1, "target", "arguments", "invocationId"? }` |
//! | 2 | `StreamItem` | `{ "type": 2, "invocationId", "item" }` |
//! | 3 | `Completion` | `{ "type": 3, "invocationId", "result"? , "error"? }` |
//! | 4 | `StreamInvocation` | `{ "type": 4, "target", "arguments", "invocationId" }` |
//! | 5 | `CancelInvocation` | `{ "type": 5, "invocationId" }` |
//! | 6 | `Ping` | `{ "type": 6 }` |
//! | 7 | `Close` | `{ "type": 7, "error"? }` |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Constants
// ============================================================================

/// ASCII record separator terminating every SignalR JSON record.
pub const RECORD_SEPARATOR: char = '\u{1e}';

// ============================================================================
// Direction
// ============================================================================

/// Which way a frame travelled through the intercepted transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Written by the monitored client.
    Send,
    /// Delivered to the monitored client.
    Receive,
}

impl Direction {
    /// Returns the lowercase wire name.
    #[inline]
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Send => "send",
            Self::Receive => "receive",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// FrameKind
// ============================================================================

/// Canonical SignalR message taxonomy.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameKind {
    /// Client handshake carrying `protocol` and `version`.
    HandshakeRequest,
    /// Server handshake acknowledgement.
    HandshakeResponse,
    /// Server handshake rejection carrying `error`.
    HandshakeError,
    /// Hub method call (type 1).
    Invocation,
    /// One item of a streaming result (type 2).
    StreamItem,
    /// Result or error of an invocation (type 3).
    Completion,
    /// Streaming hub method call (type 4).
    StreamInvocation,
    /// Cancellation of a streaming call (type 5).
    CancelInvocation,
    /// Keep-alive (type 6).
    Ping,
    /// Server-initiated close (type 7).
    Close,
    /// Record with an unknown discriminator, or a non-object record.
    ///
    /// Carries the raw discriminator (`Value::Null` when there was none) so
    /// future protocol extensions stay observable.
    Unclassified(Value),
}

impl FrameKind {
    /// Maps a numeric `type` discriminator to its kind.
    #[must_use]
    pub fn from_discriminator(discriminator: &Value) -> Self {
        match discriminator.as_u64() {
            Some(1) => Self::Invocation,
            Some(2) => Self::StreamItem,
            Some(3) => Self::Completion,
            Some(4) => Self::StreamInvocation,
            Some(5) => Self::CancelInvocation,
            Some(6) => Self::Ping,
            Some(7) => Self::Close,
            _ => Self::Unclassified(discriminator.clone()),
        }
    }

    /// Returns `true` for the three handshake kinds.
    #[inline]
    #[must_use]
    pub fn is_handshake(&self) -> bool {
        matches!(
            self,
            Self::HandshakeRequest | Self::HandshakeResponse | Self::HandshakeError
        )
    }

    /// Returns `true` for kinds carrying a numeric `type` in `1..=7`.
    #[inline]
    #[must_use]
    pub fn is_typed(&self) -> bool {
        !self.is_handshake() && !matches!(self, Self::Unclassified(_))
    }
}

// ============================================================================
// ProtocolFrame
// ============================================================================

/// One decoded record.
///
/// Immutable once produced; `payload` is the full parsed record.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolFrame {
    /// Classified message kind.
    pub kind: FrameKind,
    /// Transport direction.
    pub direction: Direction,
    /// `invocationId` of the record, when present as a string.
    pub correlation_id: Option<String>,
    /// The parsed record.
    pub payload: Value,
}

impl ProtocolFrame {
    /// Creates a frame, extracting the correlation ID from the payload.
    #[must_use]
    pub fn new(kind: FrameKind, direction: Direction, payload: Value) -> Self {
        let correlation_id = payload
            .get("invocationId")
            .and_then(Value::as_str)
            .map(str::to_string);

        Self {
            kind,
            direction,
            correlation_id,
            payload,
        }
    }

    /// Gets a field of the payload.
    #[inline]
    #[must_use]
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    /// Gets a string field, or empty string.
    #[inline]
    #[must_use]
    pub fn get_string(&self, key: &str) -> String {
        self.payload
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[test]
    fn test_discriminator_mapping() {
        assert_eq!(FrameKind::from_discriminator(&json!(1)), FrameKind::Invocation);
        assert_eq!(FrameKind::from_discriminator(&json!(6)), FrameKind::Ping);
        assert_eq!(FrameKind::from_discriminator(&json!(7)), FrameKind::Close);
        assert_eq!(
            FrameKind::from_discriminator(&json!(99)),
            FrameKind::Unclassified(json!(99))
        );
        assert_eq!(
            FrameKind::from_discriminator(&json!("1")),
            FrameKind::Unclassified(json!("1"))
        );
    }

    #[test]
    fn test_kind_predicates() {
        assert!(FrameKind::HandshakeError.is_handshake());
        assert!(!FrameKind::HandshakeError.is_typed());
        assert!(FrameKind::Ping.is_typed());
        assert!(!FrameKind::Unclassified(Value::Null).is_typed());
    }

    #[test]
    fn test_frame_correlation_id() {
        let frame = ProtocolFrame::new(
            FrameKind::Completion,
            Direction::Receive,
            json!({ "type": 3, "invocationId": "12", "result": 5 }),
        );
        assert_eq!(frame.correlation_id.as_deref(), Some("12"));

        let frame = ProtocolFrame::new(FrameKind::Ping, Direction::Receive, json!({ "type": 6 }));
        assert!(frame.correlation_id.is_none());
    }

    #[test]
    fn test_direction_serde() {
        assert_eq!(serde_json::to_string(&Direction::Send).expect("serialize"), "\"send\"");
        assert_eq!(Direction::Receive.to_string(), "receive");
    }
}
