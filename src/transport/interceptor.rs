//! Passive observation of WebSocket transports.
//!
//! The [`Interceptor`] is told about every transport opened by one source and
//! every text payload, error and close on it. It never alters or delays the
//! traffic: the caller forwards first and observes after.
//!
//! # Classification
//!
//! A transport is monitored only once one of its payloads proves it speaks
//! SignalR (see [`detect_protocol`]). From then on every non-keep-alive
//! record is normalized and published; before that, payloads are ignored.
//!
//! # Fault Isolation
//!
//! Every hook runs behind a guard that catches errors and panics and logs
//! them. A hook never returns an error to the transport it observes.
//!
//! # Lifetime
//!
//! Creating an interceptor registers its source on the bus. After
//! [`Interceptor::retire`], or once the source is torn down, hooks keep
//! tracking transports but publish nothing.

// ============================================================================
// Imports
// ============================================================================

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, error, info, trace};

use crate::error::Result;
use crate::event::{MonitorEvent, normalize, now_ms};
use crate::identifiers::{SourceId, TransportId};
use crate::protocol::{Direction, FrameKind, decode_records, detect_protocol};
use crate::relay::RelayBus;

// ============================================================================
// Types
// ============================================================================

/// Per-transport state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportHandle {
    /// Transport ID.
    pub id: TransportId,
    /// Connection URL.
    pub url: String,
    /// Confirmed to speak SignalR.
    pub classified: bool,
}

/// Transport-level close metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    /// WebSocket close code.
    pub code: u16,
    /// Close reason.
    pub reason: String,
}

impl CloseInfo {
    /// Creates close metadata.
    #[inline]
    #[must_use]
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

// ============================================================================
// Interceptor
// ============================================================================

/// Observes the transports of one source and publishes their events.
pub struct Interceptor {
    source_id: SourceId,
    bus: Arc<RelayBus>,
    transports: Mutex<FxHashMap<TransportId, TransportHandle>>,
    retired: AtomicBool,
}

// ============================================================================
// Interceptor - Constructor
// ============================================================================

impl Interceptor {
    /// Creates an interceptor publishing as `source_id`.
    ///
    /// Registers the source, lifting an earlier teardown.
    #[must_use]
    pub fn new(source_id: SourceId, bus: Arc<RelayBus>) -> Self {
        bus.register(source_id);

        Self {
            source_id,
            bus,
            transports: Mutex::new(FxHashMap::default()),
            retired: AtomicBool::new(false),
        }
    }

    /// Stops publishing. Hooks called afterwards are no-ops on the bus.
    pub fn retire(&self) {
        if !self.retired.swap(true, Ordering::SeqCst) {
            debug!(source_id = %self.source_id, "Interceptor retired");
        }
    }

    /// Returns `true` once [`Interceptor::retire`] was called.
    #[inline]
    #[must_use]
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    /// Returns the source this interceptor publishes as.
    #[inline]
    #[must_use]
    pub fn source_id(&self) -> SourceId {
        self.source_id
    }
}

// ============================================================================
// Interceptor - Hooks
// ============================================================================

impl Interceptor {
    /// Registers a newly opened transport.
    pub fn open(&self, url: impl Into<String>) -> TransportId {
        let id = TransportId::next();
        let url = url.into();

        debug!(source_id = %self.source_id, transport_id = %id, url = %url, "Transport opened");
        self.transports.lock().insert(
            id,
            TransportHandle {
                id,
                url,
                classified: false,
            },
        );
        id
    }

    /// Observes an outgoing text payload.
    pub fn on_send(&self, id: TransportId, raw: &str) {
        self.observe(id, Direction::Send, raw);
    }

    /// Observes an incoming text payload.
    pub fn on_receive(&self, id: TransportId, raw: &str) {
        self.observe(id, Direction::Receive, raw);
    }

    /// Observes a text payload in either direction.
    pub fn observe(&self, id: TransportId, direction: Direction, raw: &str) {
        self.guard("observe", id, || self.observe_inner(id, direction, raw));
    }

    /// Observes a transport-level error.
    pub fn on_error(&self, id: TransportId) {
        self.guard("error", id, || {
            let Some(url) = self.classified_url(id) else {
                return Ok(());
            };
            self.publish(MonitorEvent::transport_error(url), now_ms())
        });
    }

    /// Observes the transport closing and forgets it.
    pub fn on_close(&self, id: TransportId, close: Option<CloseInfo>) {
        self.guard("close", id, || {
            let Some(handle) = self.transports.lock().remove(&id) else {
                return Ok(());
            };

            debug!(source_id = %self.source_id, transport_id = %id, ?close, "Transport closed");
            if !handle.classified {
                return Ok(());
            }

            let (code, reason) = match close {
                Some(info) => (Some(info.code), Some(info.reason)),
                None => (None, None),
            };
            self.publish(MonitorEvent::disconnected(handle.url, code, reason), now_ms())
        });
    }
}

// ============================================================================
// Interceptor - Queries
// ============================================================================

impl Interceptor {
    /// Returns `true` if the transport was classified as SignalR.
    #[must_use]
    pub fn is_classified(&self, id: TransportId) -> bool {
        self.transports
            .lock()
            .get(&id)
            .is_some_and(|handle| handle.classified)
    }

    /// Returns a copy of a transport's state.
    #[must_use]
    pub fn handle(&self, id: TransportId) -> Option<TransportHandle> {
        self.transports.lock().get(&id).cloned()
    }

    /// Returns the number of open transports.
    #[inline]
    #[must_use]
    pub fn transport_count(&self) -> usize {
        self.transports.lock().len()
    }
}

// ============================================================================
// Interceptor - Internal
// ============================================================================

impl Interceptor {
    fn observe_inner(&self, id: TransportId, direction: Direction, raw: &str) -> Result<()> {
        let frames = decode_records(raw, direction);
        if frames.is_empty() {
            return Ok(());
        }
        let timestamp_ms = now_ms();

        let (url, newly_classified) = {
            let mut transports = self.transports.lock();
            let Some(handle) = transports.get_mut(&id) else {
                trace!(transport_id = %id, "Payload on unknown transport");
                return Ok(());
            };

            let newly_classified = !handle.classified && detect_protocol(&frames);
            if newly_classified {
                handle.classified = true;
            }
            if !handle.classified {
                return Ok(());
            }
            (handle.url.clone(), newly_classified)
        };

        if newly_classified {
            info!(source_id = %self.source_id, transport_id = %id, url = %url, "SignalR connection detected");
            self.publish(MonitorEvent::created(url.as_str()), timestamp_ms)?;
        }

        for frame in frames.iter().filter(|frame| frame.kind != FrameKind::Ping) {
            if let Some(event) = normalize(frame, &url) {
                self.publish(event, timestamp_ms)?;
            }
        }

        Ok(())
    }

    fn classified_url(&self, id: TransportId) -> Option<String> {
        self.transports
            .lock()
            .get(&id)
            .filter(|handle| handle.classified)
            .map(|handle| handle.url.clone())
    }

    fn publish(&self, event: MonitorEvent, timestamp_ms: i64) -> Result<()> {
        if self.is_retired() {
            return Ok(());
        }
        let envelope = event.into_envelope(self.source_id, timestamp_ms);
        self.bus.publish(self.source_id, envelope).map(|_| ())
    }

    /// Runs a hook body, logging instead of propagating failures.
    fn guard<F>(&self, hook: &'static str, id: TransportId, body: F)
    where
        F: FnOnce() -> Result<()>,
    {
        match catch_unwind(AssertUnwindSafe(body)) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(source_id = %self.source_id, transport_id = %id, hook, error = %e, "Observation failed");
            }
            Err(_) => {
                error!(source_id = %self.source_id, transport_id = %id, hook, "Observation panicked");
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    use crate::event::{EVENT_CONNECTION_CREATED, EVENT_CONNECTION_STATE, EVENT_SEND, Envelope};

    const URL: &str = "ws://localhost/scoreHub";

    fn setup() -> (Arc<RelayBus>, Interceptor) {
        let bus = Arc::new(RelayBus::default());
        let source_id = SourceId::new(1).expect("non-zero");
        let interceptor = Interceptor::new(source_id, Arc::clone(&bus));
        (bus, interceptor)
    }

    fn history(bus: &RelayBus) -> Vec<Envelope> {
        bus.history(SourceId::new(1).expect("non-zero"))
    }

    #[test]
    fn test_unclassified_transport_publishes_nothing() {
        let (bus, interceptor) = setup();
        let id = interceptor.open("ws://localhost/chat");

        interceptor.on_send(id, "{\"hello\":\"world\"}");
        interceptor.on_receive(id, "plain text");
        interceptor.on_error(id);
        interceptor.on_close(id, Some(CloseInfo::new(1000, "bye")));

        assert!(history(&bus).is_empty());
        assert_eq!(interceptor.transport_count(), 0);
    }

    #[test]
    fn test_handshake_classifies_and_publishes() {
        let (bus, interceptor) = setup();
        let id = interceptor.open(URL);

        interceptor.on_send(id, "{\"protocol\":\"json\",\"version\":1}\u{1e}");
        assert!(interceptor.is_classified(id));
        interceptor.on_receive(id, "{}\u{1e}");

        let events: Vec<(String, serde_json::Value)> = history(&bus)
            .into_iter()
            .map(|e| (e.event_type, e.data))
            .collect();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].0, EVENT_CONNECTION_CREATED);
        assert_eq!(events[1].0, EVENT_CONNECTION_STATE);
        assert_eq!(events[1].1["state"], json!("connecting"));
        assert_eq!(events[1].1["protocol"], json!("json"));
        assert_eq!(events[2].1["state"], json!("connected"));
    }

    #[test]
    fn test_ping_only_batch_classifies_without_events() {
        let (bus, interceptor) = setup();
        let id = interceptor.open(URL);

        interceptor.on_receive(id, "{\"type\":6}\u{1e}");

        assert!(interceptor.is_classified(id));
        let history = history(&bus);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].event_type, EVENT_CONNECTION_CREATED);
    }

    #[test]
    fn test_batched_records_keep_order() {
        let (bus, interceptor) = setup();
        let id = interceptor.open(URL);
        interceptor.on_send(id, "{\"protocol\":\"json\",\"version\":1}\u{1e}");

        interceptor.on_send(
            id,
            "{\"type\":1,\"target\":\"A\",\"arguments\":[]}\u{1e}{\"type\":6}\u{1e}{\"type\":1,\"target\":\"B\",\"arguments\":[]}\u{1e}",
        );

        let sends: Vec<String> = history(&bus)
            .into_iter()
            .filter(|e| e.event_type == EVENT_SEND)
            .map(|e| e.data["method"].as_str().unwrap_or_default().to_string())
            .collect();
        assert_eq!(sends, vec!["A", "B"]);
    }

    #[test]
    fn test_close_after_classification() {
        let (bus, interceptor) = setup();
        let id = interceptor.open(URL);
        interceptor.on_receive(id, "{}\u{1e}");

        interceptor.on_error(id);
        interceptor.on_close(id, Some(CloseInfo::new(1006, "abnormal")));

        let history = history(&bus);
        let last = history.last().expect("events");
        assert_eq!(last.data["state"], json!("disconnected"));
        assert_eq!(last.data["code"], json!(1006));
        assert_eq!(last.data["reason"], json!("abnormal"));

        let error = &history[history.len() - 2];
        assert_eq!(error.data["state"], json!("error"));
        assert_eq!(error.data["error"], json!("WebSocket error"));

        assert!(!interceptor.is_classified(id));
        assert!(interceptor.handle(id).is_none());
    }

    #[test]
    fn test_hooks_after_teardown_publish_nothing() {
        let (bus, interceptor) = setup();
        let source_id = interceptor.source_id();
        let id = interceptor.open(URL);
        interceptor.on_receive(id, "{}\u{1e}");

        bus.teardown(source_id);
        for _ in 0..5 {
            interceptor.on_receive(id, "{\"type\":1,\"target\":\"Late\",\"arguments\":[]}\u{1e}");
        }
        interceptor.on_error(id);
        interceptor.on_close(id, Some(CloseInfo::new(1000, "")));

        assert!(!bus.contains(source_id));
        assert_eq!(bus.source_count(), 0);
        assert!(history(&bus).is_empty());
        assert_eq!(interceptor.transport_count(), 0);
    }

    #[test]
    fn test_retired_interceptor_publishes_nothing() {
        let (bus, interceptor) = setup();
        let id = interceptor.open(URL);
        interceptor.on_receive(id, "{}\u{1e}");
        let before = history(&bus).len();

        interceptor.retire();
        assert!(interceptor.is_retired());
        interceptor.on_receive(id, "{\"type\":1,\"target\":\"Late\",\"arguments\":[]}\u{1e}");
        interceptor.on_close(id, None);

        assert_eq!(history(&bus).len(), before);
        assert_eq!(interceptor.transport_count(), 0);
    }

    #[test]
    fn test_new_interceptor_revives_retired_source() {
        let (bus, interceptor) = setup();
        let source_id = interceptor.source_id();
        bus.teardown(source_id);

        let fresh = Interceptor::new(source_id, Arc::clone(&bus));
        let id = fresh.open(URL);
        fresh.on_receive(id, "{}\u{1e}");

        assert!(bus.contains(source_id));
        assert_eq!(history(&bus)[0].monotonic_seq, 1);
    }

    #[test]
    fn test_hook_panic_is_contained() {
        let (bus, interceptor) = setup();
        let id = interceptor.open(URL);

        // Panic while holding the arena lock.
        interceptor.guard("observe", id, || {
            let _held = interceptor.transports.lock();
            panic!("observer fault");
        });
        interceptor.guard("observe", id, || Err(crate::Error::protocol("observer error")));

        // The interceptor keeps working afterwards.
        interceptor.on_receive(id, "{}\u{1e}");
        assert!(interceptor.is_classified(id));
        assert_eq!(history(&bus).len(), 2);
    }

    #[test]
    fn test_send_side_needs_handshake_request() {
        let (bus, interceptor) = setup();
        let id = interceptor.open(URL);

        interceptor.on_send(id, "{}\u{1e}");
        interceptor.on_send(id, "{\"type\":1,\"target\":\"Chat\",\"arguments\":[]}\u{1e}");
        assert!(!interceptor.is_classified(id));
        assert!(history(&bus).is_empty());

        interceptor.on_send(id, "{\"protocol\":\"json\",\"version\":1}\u{1e}");
        assert!(interceptor.is_classified(id));
    }

    #[test]
    fn test_malformed_payload_is_ignored() {
        let (bus, interceptor) = setup();
        let id = interceptor.open(URL);
        interceptor.on_receive(id, "{}\u{1e}");
        let before = history(&bus).len();

        interceptor.on_receive(id, "{not json\u{1e}\u{1e}");
        assert_eq!(history(&bus).len(), before);
    }
}
