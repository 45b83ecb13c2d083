//! SignalR JSON-protocol frame decoder.
//!
//! Splits a raw text message on [`RECORD_SEPARATOR`] and classifies each
//! JSON record. The decoder is pure and total: any input yields a (possibly
//! empty) list of frames, and records that are not JSON are skipped without
//! error because mixed framing on a WebSocket is expected.
//!
//! # Classification order
//!
//! 1. `protocol` and `version` present → `HandshakeRequest`
//! 2. no `type`/`kind` discriminator → `HandshakeError` if `error` is set,
//!    otherwise `HandshakeResponse`
//! 3. numeric discriminator `1..=7` → typed kind, anything else →
//!    `Unclassified`
//!
//! Records that parse as JSON but are not objects become `Unclassified`.

// ============================================================================
// Imports
// ============================================================================

use serde_json::Value;

use super::frame::{Direction, FrameKind, ProtocolFrame, RECORD_SEPARATOR};

// ============================================================================
// Decoding
// ============================================================================

/// Decodes a raw message into frames, dropping `Ping` records.
///
/// This is the entry point used for event production.
#[must_use]
pub fn decode(raw: &str, direction: Direction) -> Vec<ProtocolFrame> {
    let mut frames = decode_records(raw, direction);
    frames.retain(|frame| frame.kind != FrameKind::Ping);
    frames
}

/// Decodes a raw message into frames, keeping every record.
///
/// Used for the detection pass, where keep-alives still prove that the
/// connection speaks SignalR.
#[must_use]
pub fn decode_records(raw: &str, direction: Direction) -> Vec<ProtocolFrame> {
    raw.split(RECORD_SEPARATOR)
        .filter(|record| !record.is_empty())
        .filter_map(|record| serde_json::from_str::<Value>(record).ok())
        .map(|record| classify(record, direction))
        .collect()
}

/// Classifies one parsed record.
#[must_use]
pub fn classify(record: Value, direction: Direction) -> ProtocolFrame {
    let kind = match record.as_object() {
        None => FrameKind::Unclassified(Value::Null),
        Some(object) if object.contains_key("protocol") && object.contains_key("version") => {
            FrameKind::HandshakeRequest
        }
        Some(object) => match object.get("type").or_else(|| object.get("kind")) {
            Some(discriminator) => FrameKind::from_discriminator(discriminator),
            None => match object.get("error") {
                Some(error) if !error.is_null() => FrameKind::HandshakeError,
                _ => FrameKind::HandshakeResponse,
            },
        },
    };

    ProtocolFrame::new(kind, direction, record)
}

// ============================================================================
// Detection
// ============================================================================

/// Returns `true` if any frame proves the connection speaks SignalR.
///
/// On the send side the only proof is a handshake request. On the receive
/// side it is an empty handshake response or a record with an in-range
/// numeric type. A bare `{"error": ..}` is not enough, since plenty of
/// non-SignalR JSON looks like that.
#[must_use]
pub fn detect_protocol(frames: &[ProtocolFrame]) -> bool {
    frames.iter().any(|frame| match frame.direction {
        Direction::Send => frame.kind == FrameKind::HandshakeRequest,
        Direction::Receive => match frame.kind {
            FrameKind::HandshakeResponse => frame
                .payload
                .as_object()
                .is_some_and(|object| object.is_empty()),
            ref kind => kind.is_typed(),
        },
    })
}

// ============================================================================
// Tests
// ============================================================================
