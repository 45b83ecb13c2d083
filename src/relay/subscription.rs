//! Observer subscriptions.
//!
//! [`SubscriptionManager`] binds observer channels to sources and runs the
//! per-observer control session: `INIT` attaches with a history replay,
//! `CLEAR` empties the source, `STATUS` answers with the latest state.
//!
//! A session ends when its control channel closes, when its source is
//! torn down, or when an `INIT` cannot attach; the attachment is then
//! removed and the observer's link closes. A new `INIT` on a fresh channel
//! performs a fresh replay.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, warn};

use crate::error::Result;
use crate::event::now_ms;
use crate::identifiers::SourceId;

use super::bus::{ObserverSender, RelayBus, Subscription};
use super::message::{ControlMessage, RelayMessage};

// ============================================================================
// Attachment
// ============================================================================

/// The subscription a session currently holds and its bus feed.
///
/// The feed ends when the bus drops the subscription.
struct Attachment {
    subscription: Subscription,
    feed: mpsc::UnboundedReceiver<RelayMessage>,
}

impl Attachment {
    /// Moves queued bus messages to `channel`.
    ///
    /// Returns `false` once the feed has ended or `channel` is closed.
    fn flush(&mut self, channel: &ObserverSender) -> bool {
        loop {
            match self.feed.try_recv() {
                Ok(message) => {
                    if channel.send(message).is_err() {
                        return false;
                    }
                }
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => return false,
            }
        }
    }
}

/// Waits for the next bus message of the attachment, if any.
async fn next_feed(current: &mut Option<Attachment>) -> Option<RelayMessage> {
    match current {
        Some(attachment) => attachment.feed.recv().await,
        None => std::future::pending().await,
    }
}

// ============================================================================
// SubscriptionManager
// ============================================================================

/// Attaches observers to the [`RelayBus`].
#[derive(Clone)]
pub struct SubscriptionManager {
    bus: Arc<RelayBus>,
}

impl SubscriptionManager {
    /// Creates a manager over `bus`.
    #[inline]
    #[must_use]
    pub fn new(bus: Arc<RelayBus>) -> Self {
        Self { bus }
    }

    /// Returns the underlying bus.
    #[inline]
    #[must_use]
    pub fn bus(&self) -> &Arc<RelayBus> {
        &self.bus
    }

    /// Attaches `channel` to a source.
    ///
    /// `HISTORY` goes out first, then live `NEW_MESSAGE`s in publish order.
    ///
    /// # Errors
    ///
    /// See [`SubscriptionManager::attach_after`].
    pub fn attach(&self, source_id: SourceId, channel: ObserverSender) -> Result<Subscription> {
        self.attach_after(source_id, channel, None)
    }

    /// Attaches `channel`, skipping anything at or before `cleared_at`.
    ///
    /// # Errors
    ///
    /// - [`crate::Error::LinkLost`] if `channel` is closed
    /// - [`crate::Error::SourceNotFound`] if the source is being torn down
    pub fn attach_after(
        &self,
        source_id: SourceId,
        channel: ObserverSender,
        cleared_at: Option<i64>,
    ) -> Result<Subscription> {
        self.bus.subscribe(source_id, channel, cleared_at)
    }

    /// Removes a subscription. Safe to call more than once.
    pub fn detach(&self, subscription: &Subscription) -> bool {
        self.bus.unsubscribe(subscription)
    }

    /// Runs one observer session.
    ///
    /// Replies and live envelopes go to `channel`. The session ends when
    /// `control` closes, when the attached source is torn down, or when an
    /// `INIT` fails to attach.
    pub async fn serve(
        &self,
        mut control: mpsc::UnboundedReceiver<ControlMessage>,
        channel: ObserverSender,
    ) {
        let mut current: Option<Attachment> = None;

        loop {
            tokio::select! {
                message = control.recv() => {
                    let Some(message) = message else {
                        break;
                    };
                    if !self.handle_control(message, &channel, &mut current) {
                        break;
                    }
                }

                message = next_feed(&mut current) => match message {
                    Some(message) => {
                        if channel.send(message).is_err() {
                            break;
                        }
                    }
                    None => {
                        if let Some(attachment) = current.take() {
                            debug!(
                                source_id = %attachment.subscription.source_id,
                                "Source torn down, ending session"
                            );
                        }
                        break;
                    }
                },
            }
        }

        if let Some(attachment) = current.take() {
            self.detach(&attachment.subscription);
        }

        debug!("Observer session ended");
    }

    /// Applies one control message. Returns `false` to end the session.
    fn handle_control(
        &self,
        message: ControlMessage,
        channel: &ObserverSender,
        current: &mut Option<Attachment>,
    ) -> bool {
        // Bus traffic queued before this message goes out first.
        if let Some(attachment) = current.as_mut()
            && !attachment.flush(channel)
        {
            return false;
        }

        match message {
            ControlMessage::Init {
                source_id,
                cleared_at,
            } => {
                if let Some(existing) = current.as_ref() {
                    if existing.subscription.source_id == source_id {
                        debug!(source_id = %source_id, "Already attached, INIT ignored");
                        return true;
                    }
                    self.detach(&existing.subscription);
                    *current = None;
                }

                let (feed_tx, feed) = mpsc::unbounded_channel();
                match self.attach_after(source_id, feed_tx, cleared_at) {
                    Ok(subscription) => {
                        *current = Some(Attachment { subscription, feed });
                        true
                    }
                    Err(e) => {
                        warn!(source_id = %source_id, error = %e, "Attach failed, ending session");
                        false
                    }
                }
            }

            ControlMessage::Clear { source_id } => {
                if let Err(e) = self.bus.clear(source_id, now_ms()) {
                    warn!(source_id = %source_id, error = %e, "Clear failed");
                }

                // Attached observers hear CLEARED from the bus broadcast.
                let attached = current
                    .as_ref()
                    .is_some_and(|a| a.subscription.source_id == source_id);
                attached || channel.send(RelayMessage::Cleared { source_id }).is_ok()
            }

            ControlMessage::Status { source_id } => {
                let state = self.bus.status(source_id);
                channel
                    .send(RelayMessage::Status { source_id, state })
                    .is_ok()
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

    use crate::event::{ConnectionState, EVENT_CONNECTION_STATE, Envelope};

    fn source(id: u32) -> SourceId {
        SourceId::new(id).expect("non-zero")
    }

    fn manager() -> SubscriptionManager {
        SubscriptionManager::new(Arc::new(RelayBus::default()))
    }

    fn publish(manager: &SubscriptionManager, source_id: SourceId, timestamp_ms: i64) {
        let envelope = Envelope::new(source_id, "send", json!({ "method": "Ping" }), timestamp_ms);
        manager.bus().publish(source_id, envelope).expect("publish");
    }

    #[test]
    fn test_attach_replays_history_first() {
        let manager = manager();
        let id = source(1);
        publish(&manager, id, 1);
        publish(&manager, id, 2);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscription = tokio_test::assert_ok!(manager.attach(id, tx));
        publish(&manager, id, 3);

        assert!(matches!(
            rx.try_recv(),
            Ok(RelayMessage::History { ref envelopes, .. }) if envelopes.len() == 2
        ));
        assert!(matches!(
            rx.try_recv(),
            Ok(RelayMessage::NewMessage { ref envelope }) if envelope.monotonic_seq == 3
        ));

        assert!(manager.detach(&subscription));
        assert!(!manager.detach(&subscription));
    }

    #[tokio::test]
    async fn test_serve_init_clear_status() {
        let manager = manager();
        let id = source(7);
        publish(&manager, id, 1);
        let connected = Envelope::new(
            id,
            EVENT_CONNECTION_STATE,
            json!({ "state": "connected", "url": "ws://h/hub" }),
            2,
        );
        manager.bus().publish(id, connected).expect("publish");

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (relay_tx, mut relay_rx) = mpsc::unbounded_channel();
        let session = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.serve(control_rx, relay_tx).await })
        };

        control_tx
            .send(ControlMessage::Init {
                source_id: id,
                cleared_at: None,
            })
            .expect("send");
        match relay_rx.recv().await {
            Some(RelayMessage::History { envelopes, .. }) => assert_eq!(envelopes.len(), 2),
            other => panic!("expected HISTORY, got {other:?}"),
        }

        control_tx.send(ControlMessage::Status { source_id: id }).expect("send");
        assert_eq!(
            relay_rx.recv().await,
            Some(RelayMessage::Status {
                source_id: id,
                state: Some(ConnectionState::Connected)
            })
        );

        control_tx.send(ControlMessage::Clear { source_id: id }).expect("send");
        assert_eq!(relay_rx.recv().await, Some(RelayMessage::Cleared { source_id: id }));
        assert!(manager.bus().history(id).is_empty());

        drop(control_tx);
        session.await.expect("session task");
        assert_eq!(manager.bus().subscriber_count(id), 0);
    }

    #[tokio::test]
    async fn test_clear_unattached_source_replies_directly() {
        let manager = manager();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (relay_tx, mut relay_rx) = mpsc::unbounded_channel();
        let session = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.serve(control_rx, relay_tx).await })
        };

        control_tx
            .send(ControlMessage::Clear { source_id: source(9) })
            .expect("send");
        assert_eq!(
            relay_rx.recv().await,
            Some(RelayMessage::Cleared { source_id: source(9) })
        );

        drop(control_tx);
        session.await.expect("session task");
    }

    #[tokio::test]
    async fn test_repeated_init_keeps_single_attachment() {
        let manager = manager();
        let id = source(2);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (relay_tx, mut relay_rx) = mpsc::unbounded_channel();
        let session = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.serve(control_rx, relay_tx).await })
        };

        for _ in 0..2 {
            control_tx
                .send(ControlMessage::Init {
                    source_id: id,
                    cleared_at: None,
                })
                .expect("send");
        }
        control_tx.send(ControlMessage::Status { source_id: id }).expect("send");

        assert!(matches!(relay_rx.recv().await, Some(RelayMessage::History { .. })));
        assert!(matches!(relay_rx.recv().await, Some(RelayMessage::Status { .. })));
        assert_eq!(manager.bus().subscriber_count(id), 1);

        drop(control_tx);
        session.await.expect("session task");
    }

    #[tokio::test]
    async fn test_teardown_ends_session() {
        let manager = manager();
        let id = source(4);
        publish(&manager, id, 1);

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (relay_tx, mut relay_rx) = mpsc::unbounded_channel();
        let session = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.serve(control_rx, relay_tx).await })
        };

        control_tx
            .send(ControlMessage::Init {
                source_id: id,
                cleared_at: None,
            })
            .expect("send");
        assert!(matches!(relay_rx.recv().await, Some(RelayMessage::History { .. })));

        assert!(manager.bus().teardown(id));
        assert_eq!(relay_rx.recv().await, Some(RelayMessage::Cleared { source_id: id }));

        // Ends while the control channel is still open.
        session.await.expect("session task");
        assert_eq!(relay_rx.recv().await, None);
        drop(control_tx);
    }

    #[tokio::test]
    async fn test_init_on_retired_source_ends_session() {
        let manager = manager();
        let id = source(5);
        publish(&manager, id, 1);
        manager.bus().teardown(id);

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (relay_tx, mut relay_rx) = mpsc::unbounded_channel();
        let session = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.serve(control_rx, relay_tx).await })
        };

        control_tx
            .send(ControlMessage::Init {
                source_id: id,
                cleared_at: None,
            })
            .expect("send");

        session.await.expect("session task");
        assert_eq!(relay_rx.recv().await, None);
        assert_eq!(manager.bus().subscriber_count(id), 0);
    }
}
