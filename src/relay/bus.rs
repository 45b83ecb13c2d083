//! Relay bus: per-source history and subscriber fan-out.
//!
//! The bus owns the registry mapping each [`SourceId`] to its history and
//! subscribers. Lookup, insertion and removal take the table lock only
//! briefly; all per-source work runs under that source's own lock, so
//! independent sources never block each other.
//!
//! # Source Lifetime
//!
//! A source is registered on first use, or explicitly with
//! [`RelayBus::register`]. [`RelayBus::teardown`] retires it: the entry is
//! released and publishes, clears and subscriptions for that ID fail with
//! [`Error::SourceNotFound`] until it is registered again.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │                   RelayBus                     │
//! │  ┌─────────────────────────────────────────┐   │
//! │  │ SourceId=1 → Mutex<history, subs, seq>  │   │
//! │  │ SourceId=2 → Mutex<history, subs, seq>  │   │
//! │  └─────────────────────────────────────────┘   │
//! └───────────────────────────────────────────────┘
//!         publish ─┘          └─► NEW_MESSAGE → subscriber channels
//! ```
//!
//! # Ordering
//!
//! Sequence assignment, history append and forwarding happen under one
//! per-source lock, and forwarding uses unbounded channels, so every
//! subscriber sees a source's envelopes in publish order.

// ============================================================================
// Imports
// ============================================================================

use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use crate::error::{Error, Result};
use crate::event::{ConnectionState, EVENT_CONNECTION_STATE, Envelope};
use crate::identifiers::{SourceId, SubscriptionId};

use super::history::{HistoryBuffer, HistoryLimits};
use super::message::RelayMessage;

// ============================================================================
// Types
// ============================================================================

/// Channel carrying relay messages to one observer.
pub type ObserverSender = mpsc::UnboundedSender<RelayMessage>;

/// Process-wide bus, created on first use.
static GLOBAL_BUS: OnceLock<Arc<RelayBus>> = OnceLock::new();

// ============================================================================
// Subscription
// ============================================================================

/// Handle of one observer attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription {
    /// Attachment ID.
    pub id: SubscriptionId,
    /// Attached source.
    pub source_id: SourceId,
}

/// Bus-side state of a subscription.
struct Subscriber {
    sender: ObserverSender,
    last_clear_ms: i64,
}

// ============================================================================
// SourceState
// ============================================================================

/// Everything the bus keeps for one source.
struct SourceState {
    history: HistoryBuffer,
    subscribers: FxHashMap<SubscriptionId, Subscriber>,
    next_seq: u64,
    last_clear_ms: i64,
    status: Option<ConnectionState>,
    torn_down: bool,
}

impl SourceState {
    fn new(limits: HistoryLimits) -> Self {
        Self {
            history: HistoryBuffer::new(limits),
            subscribers: FxHashMap::default(),
            next_seq: 0,
            last_clear_ms: i64::MIN,
            status: None,
            torn_down: false,
        }
    }

    /// Sends `message` to every subscriber accepted by `filter`.
    ///
    /// Subscribers whose channel is closed are dropped.
    fn broadcast(
        &mut self,
        source_id: SourceId,
        message: &RelayMessage,
        filter: impl Fn(&Subscriber) -> bool,
    ) {
        let mut dead = Vec::new();

        for (id, subscriber) in &self.subscribers {
            if !filter(subscriber) {
                continue;
            }
            if subscriber.sender.send(message.clone()).is_err() {
                dead.push(*id);
            }
        }

        for id in dead {
            self.subscribers.remove(&id);
            debug!(source_id = %source_id, subscription_id = %id, "Dropped subscriber with closed link");
        }
    }
}

type SourceEntry = Mutex<SourceState>;

/// Live sources plus the IDs retired by teardown.
#[derive(Default)]
struct Registry {
    live: FxHashMap<SourceId, Arc<SourceEntry>>,
    retired: FxHashSet<SourceId>,
}

// ============================================================================
// RelayBus
// ============================================================================

/// Moves envelopes from sources to subscribers with bounded history.
///
/// Thread-safe; share it behind an [`Arc`].
pub struct RelayBus {
    /// Source registry.
    sources: RwLock<Registry>,
    /// History limits applied to new sources.
    limits: HistoryLimits,
}

// ============================================================================
// RelayBus - Constructor
// ============================================================================

impl RelayBus {
    /// Creates an empty bus.
    #[must_use]
    pub fn new(limits: HistoryLimits) -> Self {
        Self {
            sources: RwLock::new(Registry::default()),
            limits,
        }
    }

    /// Returns the process-wide bus, creating it with default limits on first use.
    #[must_use]
    pub fn global() -> Arc<Self> {
        Arc::clone(GLOBAL_BUS.get_or_init(|| Arc::new(Self::new(HistoryLimits::default()))))
    }

    /// Returns the history limits.
    #[inline]
    #[must_use]
    pub fn limits(&self) -> HistoryLimits {
        self.limits
    }
}

impl Default for RelayBus {
    fn default() -> Self {
        Self::new(HistoryLimits::default())
    }
}

// ============================================================================
// RelayBus - Publishing
// ============================================================================

impl RelayBus {
    /// Sequences, stores and forwards an envelope.
    ///
    /// Returns the assigned sequence number, or `None` when the envelope
    /// predates the source's last clear and was suppressed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SourceNotFound`] if the source was torn down.
    pub fn publish(&self, source_id: SourceId, mut envelope: Envelope) -> Result<Option<u64>> {
        let entry = self.entry(source_id)?;
        let mut state = entry.lock();

        if state.torn_down {
            return Err(Error::source_not_found(source_id));
        }

        if !envelope.is_after(state.last_clear_ms) {
            trace!(source_id = %source_id, timestamp_ms = envelope.timestamp_ms, "Suppressed pre-clear envelope");
            return Ok(None);
        }

        state.next_seq += 1;
        envelope.source_id = source_id;
        envelope.monotonic_seq = state.next_seq;

        if envelope.event_type == EVENT_CONNECTION_STATE
            && let Some(status) = ConnectionState::from_data(&envelope.data)
        {
            state.status = Some(status);
        }

        let dropped = state.history.push(envelope.clone());
        if dropped > 0 {
            debug!(source_id = %source_id, dropped, "History trimmed");
        }

        let timestamp_ms = envelope.timestamp_ms;
        let seq = envelope.monotonic_seq;
        let message = RelayMessage::NewMessage { envelope };
        state.broadcast(source_id, &message, |subscriber| {
            timestamp_ms > subscriber.last_clear_ms
        });

        trace!(source_id = %source_id, seq, "Envelope published");
        Ok(Some(seq))
    }

    /// Empties a source's history and suppresses anything at or before `at_ms`.
    ///
    /// Every current subscriber is told with `CLEARED`. Clearing an unknown
    /// source registers it, so late envelopes are still suppressed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SourceNotFound`] if the source was torn down.
    pub fn clear(&self, source_id: SourceId, at_ms: i64) -> Result<()> {
        let entry = self.entry(source_id)?;
        let mut state = entry.lock();

        if state.torn_down {
            return Err(Error::source_not_found(source_id));
        }

        state.history.clear();
        state.last_clear_ms = state.last_clear_ms.max(at_ms);
        for subscriber in state.subscribers.values_mut() {
            subscriber.last_clear_ms = subscriber.last_clear_ms.max(at_ms);
        }

        state.broadcast(source_id, &RelayMessage::Cleared { source_id }, |_| true);

        debug!(source_id = %source_id, at_ms, "Source history cleared");
        Ok(())
    }

    /// Registers a source, lifting an earlier teardown.
    ///
    /// Returns `true` if the source was not live before.
    pub fn register(&self, source_id: SourceId) -> bool {
        let mut sources = self.sources.write();
        let revived = sources.retired.remove(&source_id);
        if sources.live.contains_key(&source_id) {
            return false;
        }

        let limits = self.limits;
        sources
            .live
            .insert(source_id, Arc::new(Mutex::new(SourceState::new(limits))));
        debug!(source_id = %source_id, revived, "Source registered");
        true
    }

    /// Retires a source, discarding its history, subscribers and status.
    ///
    /// Subscribers get a final `CLEARED` and then lose their feed. Every
    /// later publish, clear or subscription for the source fails with
    /// [`Error::SourceNotFound`] until [`RelayBus::register`] is called.
    /// Returns `false` if the source was not live.
    pub fn teardown(&self, source_id: SourceId) -> bool {
        let removed = {
            let mut sources = self.sources.write();
            sources.retired.insert(source_id);
            sources.live.remove(&source_id)
        };

        let Some(entry) = removed else {
            return false;
        };

        let mut state = entry.lock();
        state.torn_down = true;
        state.history.clear();
        state.broadcast(source_id, &RelayMessage::Cleared { source_id }, |_| true);
        let subscribers = state.subscribers.len();
        state.subscribers.clear();

        info!(source_id = %source_id, subscribers, "Source torn down");
        true
    }
}

// ============================================================================
// RelayBus - Subscriptions
// ============================================================================

impl RelayBus {
    /// Replays history to `sender` and registers it for live forwarding.
    ///
    /// Replay and registration happen under the source lock, so no envelope
    /// is missed or duplicated between `HISTORY` and the first `NEW_MESSAGE`.
    /// `cleared_at` raises the subscription's clear mark above the source's.
    ///
    /// # Errors
    ///
    /// - [`Error::LinkLost`] if `sender` is already closed
    /// - [`Error::SourceNotFound`] if the source was torn down
    pub(crate) fn subscribe(
        &self,
        source_id: SourceId,
        sender: ObserverSender,
        cleared_at: Option<i64>,
    ) -> Result<Subscription> {
        let entry = self.entry(source_id)?;
        let mut state = entry.lock();

        if state.torn_down {
            return Err(Error::source_not_found(source_id));
        }

        let last_clear_ms = state.last_clear_ms.max(cleared_at.unwrap_or(i64::MIN));
        let envelopes = state.history.snapshot_after(last_clear_ms);
        let replayed = envelopes.len();

        sender
            .send(RelayMessage::History {
                source_id,
                envelopes,
            })
            .map_err(|_| Error::link_lost("observer channel closed before history replay"))?;

        let id = SubscriptionId::generate();
        state.subscribers.insert(
            id,
            Subscriber {
                sender,
                last_clear_ms,
            },
        );

        debug!(source_id = %source_id, subscription_id = %id, replayed, "Subscriber attached");
        Ok(Subscription { id, source_id })
    }

    /// Removes a subscription. Idempotent.
    ///
    /// Returns `true` if it was still registered.
    pub(crate) fn unsubscribe(&self, subscription: &Subscription) -> bool {
        let Some(entry) = self.get(subscription.source_id) else {
            return false;
        };

        let removed = entry.lock().subscribers.remove(&subscription.id).is_some();
        if removed {
            debug!(
                source_id = %subscription.source_id,
                subscription_id = %subscription.id,
                "Subscriber detached"
            );
        }
        removed
    }
}

// ============================================================================
// RelayBus - Queries
// ============================================================================

impl RelayBus {
    /// Returns a copy of a source's history, oldest first.
    #[must_use]
    pub fn history(&self, source_id: SourceId) -> Vec<Envelope> {
        self.get(source_id)
            .map(|entry| entry.lock().history.entries().to_vec())
            .unwrap_or_default()
    }

    /// Returns the latest connection state published for a source.
    #[must_use]
    pub fn status(&self, source_id: SourceId) -> Option<ConnectionState> {
        self.get(source_id).and_then(|entry| entry.lock().status)
    }

    /// Returns the number of live subscribers of a source.
    #[must_use]
    pub fn subscriber_count(&self, source_id: SourceId) -> usize {
        self.get(source_id)
            .map(|entry| entry.lock().subscribers.len())
            .unwrap_or_default()
    }

    /// Returns `true` if the source is live.
    #[inline]
    #[must_use]
    pub fn contains(&self, source_id: SourceId) -> bool {
        self.sources.read().live.contains_key(&source_id)
    }

    /// Returns `true` if the source was torn down and not registered since.
    #[inline]
    #[must_use]
    pub fn is_retired(&self, source_id: SourceId) -> bool {
        self.sources.read().retired.contains(&source_id)
    }

    /// Returns the number of live sources.
    #[inline]
    #[must_use]
    pub fn source_count(&self) -> usize {
        self.sources.read().live.len()
    }
}

// ============================================================================
// RelayBus - Registry
// ============================================================================

impl RelayBus {
    fn get(&self, source_id: SourceId) -> Option<Arc<SourceEntry>> {
        self.sources.read().live.get(&source_id).cloned()
    }

    /// Looks up a source, registering it on first use.
    ///
    /// Retired sources are not revived here.
    fn entry(&self, source_id: SourceId) -> Result<Arc<SourceEntry>> {
        {
            let sources = self.sources.read();
            if let Some(entry) = sources.live.get(&source_id) {
                return Ok(Arc::clone(entry));
            }
            if sources.retired.contains(&source_id) {
                return Err(Error::source_not_found(source_id));
            }
        }

        let mut sources = self.sources.write();
        if sources.retired.contains(&source_id) {
            return Err(Error::source_not_found(source_id));
        }

        let limits = self.limits;
        let entry = sources.live.entry(source_id).or_insert_with(|| {
            debug!(source_id = %source_id, "Source registered");
            Arc::new(Mutex::new(SourceState::new(limits)))
        });
        Ok(Arc::clone(entry))
    }
}

// ============================================================================
// Tests
// ============================================================================
