//! Observer-side relay link supervision.
//!
//! A [`Watcher`] keeps one observer attached to a source. It opens a link,
//! sends `INIT`, and forwards everything the relay sends. When the link is
//! lost it waits a fixed delay and opens a new one; the fresh `INIT` brings a
//! fresh `HISTORY` replay. A link that is still up is never re-initialized.
//!
//! # Lifecycle
//!
//! ```text
//! open ──► INIT ──► HISTORY, NEW_MESSAGE... ──► lost
//!   ▲                                            │
//!   └────────────── sleep(delay) ◄───────────────┘
//! ```
//!
//! A link counts as attached once its `HISTORY` arrives. Consecutive links
//! that fail to open, or close before attaching (for example because the
//! source was torn down and not registered again), are bounded by
//! [`ReconnectPolicy::max_attempts`]; an attached link resets the count.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::event::now_ms;
use crate::identifiers::SourceId;

use super::link::{LinkChannel, RelayLink};
use super::message::{ControlMessage, RelayMessage};

// ============================================================================
// Constants
// ============================================================================

/// Default delay between reconnect attempts.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(500);

/// Default bound on consecutive failed attempts.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Marker for "never cleared".
const NOT_CLEARED: i64 = i64::MIN;

// ============================================================================
// ReconnectPolicy
// ============================================================================

/// Fixed-delay reconnect policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before each new attempt.
    pub delay: Duration,
    /// Consecutive links that fail to attach before giving up.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: DEFAULT_RECONNECT_DELAY,
            max_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
        }
    }
}

// ============================================================================
// Shared State
// ============================================================================

/// State shared between the watcher task and its handle.
struct WatcherShared {
    source_id: SourceId,
    cleared_at: AtomicI64,
    control: Mutex<Option<mpsc::UnboundedSender<ControlMessage>>>,
    attaches: AtomicU32,
}

impl WatcherShared {
    fn cleared_at(&self) -> Option<i64> {
        let value = self.cleared_at.load(Ordering::SeqCst);
        (value != NOT_CLEARED).then_some(value)
    }

    fn keeps(&self, timestamp_ms: i64) -> bool {
        timestamp_ms > self.cleared_at.load(Ordering::SeqCst)
    }
}

/// How a link session ended.
enum LinkEnd {
    /// Relay side went away, after `HISTORY` arrived or before.
    Lost { attached: bool },
    /// Our consumer dropped the receiver.
    SinkClosed,
}

// ============================================================================
// Watcher
// ============================================================================

/// Supervises the relay link of one observer.
///
/// # Example
///
/// ```ignore
/// let link = Arc::new(WsLink::new("ws://127.0.0.1:9000")?);
/// let (handle, mut messages) = Watcher::new(link, source_id).spawn();
///
/// while let Some(message) = messages.recv().await {
///     println!("{message:?}");
/// }
/// ```
pub struct Watcher {
    link: Arc<dyn RelayLink>,
    source_id: SourceId,
    policy: ReconnectPolicy,
}

impl Watcher {
    /// Creates a watcher with the default policy.
    #[must_use]
    pub fn new(link: Arc<dyn RelayLink>, source_id: SourceId) -> Self {
        Self {
            link,
            source_id,
            policy: ReconnectPolicy::default(),
        }
    }

    /// Sets the reconnect policy.
    #[inline]
    #[must_use]
    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Starts the watcher task.
    ///
    /// Returns the control handle and the stream of relay messages. The
    /// task ends when the stream is dropped, [`WatcherHandle::stop`] is
    /// called, or reconnecting is exhausted.
    #[must_use]
    pub fn spawn(self) -> (WatcherHandle, mpsc::UnboundedReceiver<RelayMessage>) {
        let (sink, messages) = mpsc::unbounded_channel();
        let shared = Arc::new(WatcherShared {
            source_id: self.source_id,
            cleared_at: AtomicI64::new(NOT_CLEARED),
            control: Mutex::new(None),
            attaches: AtomicU32::new(0),
        });

        let task = tokio::spawn(run(self.link, self.policy, Arc::clone(&shared), sink));

        let handle = WatcherHandle {
            shared,
            task: Some(task),
        };
        (handle, messages)
    }
}

// ============================================================================
// WatcherHandle
// ============================================================================

/// Control handle of a running [`Watcher`]. Dropping it stops the watcher.
pub struct WatcherHandle {
    shared: Arc<WatcherShared>,
    task: Option<JoinHandle<Result<()>>>,
}

impl WatcherHandle {
    /// Returns the watched source.
    #[inline]
    #[must_use]
    pub fn source_id(&self) -> SourceId {
        self.shared.source_id
    }

    /// Clears the view: hides everything up to now and asks the relay to clear.
    ///
    /// The local mark applies immediately and survives reconnects, even if
    /// the `CLEAR` is lost with the link. Returns the clear timestamp.
    pub fn clear(&self) -> i64 {
        let now = now_ms();
        self.shared.cleared_at.fetch_max(now, Ordering::SeqCst);

        let sent = self.send(ControlMessage::Clear {
            source_id: self.shared.source_id,
        });
        debug!(source_id = %self.shared.source_id, at_ms = now, sent, "View cleared");
        now
    }

    /// Asks the relay for the latest connection state.
    ///
    /// Returns `false` if no link is up.
    pub fn request_status(&self) -> bool {
        self.send(ControlMessage::Status {
            source_id: self.shared.source_id,
        })
    }

    /// Returns the local clear mark, if any.
    #[inline]
    #[must_use]
    pub fn cleared_at(&self) -> Option<i64> {
        self.shared.cleared_at()
    }

    /// Returns how many times a link attached and replayed history.
    #[inline]
    #[must_use]
    pub fn attach_count(&self) -> u32 {
        self.shared.attaches.load(Ordering::SeqCst)
    }

    /// Returns `true` while a link is up.
    #[inline]
    #[must_use]
    pub fn is_linked(&self) -> bool {
        self.shared.control.lock().is_some()
    }

    /// Stops the watcher.
    pub fn stop(&self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }

    /// Waits for the watcher to finish.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReconnectExhausted`] if the link could not be
    /// re-established.
    pub async fn join(mut self) -> Result<()> {
        let Some(task) = self.task.take() else {
            return Ok(());
        };

        match task.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(Error::link_lost(format!("watcher task failed: {e}"))),
        }
    }

    fn send(&self, message: ControlMessage) -> bool {
        self.shared
            .control
            .lock()
            .as_ref()
            .is_some_and(|control| control.send(message).is_ok())
    }
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ============================================================================
// Watcher Loop
// ============================================================================

/// Reconnect loop.
async fn run(
    link: Arc<dyn RelayLink>,
    policy: ReconnectPolicy,
    shared: Arc<WatcherShared>,
    sink: mpsc::UnboundedSender<RelayMessage>,
) -> Result<()> {
    let source_id = shared.source_id;
    let mut failures = 0u32;

    loop {
        let attached = match link.open().await {
            Ok(channel) => match session(channel, &shared, &sink).await {
                LinkEnd::SinkClosed => {
                    debug!(source_id = %source_id, "Consumer gone, watcher stopping");
                    return Ok(());
                }
                LinkEnd::Lost { attached } => attached,
            },
            Err(e) => {
                debug!(source_id = %source_id, error = %e, "Relay link open failed");
                false
            }
        };

        if attached {
            failures = 0;
            warn!(source_id = %source_id, "Relay link lost");
        } else {
            failures += 1;
            warn!(
                source_id = %source_id,
                attempt = failures,
                max_attempts = policy.max_attempts,
                "Relay link failed to attach"
            );

            if failures >= policy.max_attempts {
                return Err(Error::reconnect_exhausted(failures));
            }
        }

        if sink.is_closed() {
            return Ok(());
        }

        tokio::time::sleep(policy.delay).await;
    }
}

/// Initializes one open link and pumps it until it ends.
async fn session(
    channel: LinkChannel,
    shared: &WatcherShared,
    sink: &mpsc::UnboundedSender<RelayMessage>,
) -> LinkEnd {
    let init = ControlMessage::Init {
        source_id: shared.source_id,
        cleared_at: shared.cleared_at(),
    };
    if channel.control.send(init).is_err() {
        return LinkEnd::Lost { attached: false };
    }

    *shared.control.lock() = Some(channel.control.clone());
    debug!(source_id = %shared.source_id, "Relay link open, INIT sent");

    let end = pump(channel.messages, shared, sink).await;
    *shared.control.lock() = None;
    end
}

/// Forwards relay messages until the link or the consumer goes away.
async fn pump(
    mut messages: mpsc::UnboundedReceiver<RelayMessage>,
    shared: &WatcherShared,
    sink: &mpsc::UnboundedSender<RelayMessage>,
) -> LinkEnd {
    let mut attached = false;

    loop {
        let message = tokio::select! {
            message = messages.recv() => match message {
                Some(message) => message,
                None => return LinkEnd::Lost { attached },
            },
            () = sink.closed() => return LinkEnd::SinkClosed,
        };

        let message = match message {
            RelayMessage::NewMessage { envelope } => {
                if !shared.keeps(envelope.timestamp_ms) {
                    continue;
                }
                RelayMessage::NewMessage { envelope }
            }
            RelayMessage::History {
                source_id,
                mut envelopes,
            } => {
                if !attached {
                    attached = true;
                    let attaches = shared.attaches.fetch_add(1, Ordering::SeqCst) + 1;
                    info!(source_id = %source_id, attaches, "Relay link attached");
                }
                envelopes.retain(|envelope| shared.keeps(envelope.timestamp_ms));
                RelayMessage::History {
                    source_id,
                    envelopes,
                }
            }
            other => other,
        };

        if sink.send(message).is_err() {
            return LinkEnd::SinkClosed;
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use serde_json::Value;

    use crate::event::Envelope;
    use crate::relay::{LocalLink, RelayBus, SubscriptionManager};

    fn source() -> SourceId {
        SourceId::new(1).expect("non-zero")
    }

    struct RefusingLink;

    #[async_trait]
    impl RelayLink for RefusingLink {
        async fn open(&self) -> Result<LinkChannel> {
            Err(Error::connection("refused"))
        }
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let policy = ReconnectPolicy {
            delay: Duration::from_millis(1),
            max_attempts: 3,
        };
        let (handle, _messages) = Watcher::new(Arc::new(RefusingLink), source())
            .with_policy(policy)
            .spawn();

        let err = handle.join().await.unwrap_err();
        assert!(matches!(err, Error::ReconnectExhausted { attempts: 3 }));
    }

    #[tokio::test]
    async fn test_local_watch_and_clear() {
        let bus = Arc::new(RelayBus::default());
        let manager = Arc::new(SubscriptionManager::new(Arc::clone(&bus)));
        let link = Arc::new(LocalLink::new(manager));

        bus.publish(source(), Envelope::new(source(), "send", Value::Null, 1))
            .expect("publish");

        let (handle, mut messages) = Watcher::new(link, source()).spawn();
        match messages.recv().await {
            Some(RelayMessage::History { envelopes, .. }) => assert_eq!(envelopes.len(), 1),
            other => panic!("expected HISTORY, got {other:?}"),
        }
        assert_eq!(handle.attach_count(), 1);
        assert!(handle.is_linked());

        let at = handle.clear();
        assert_eq!(handle.cleared_at(), Some(at));
        assert_eq!(
            messages.recv().await,
            Some(RelayMessage::Cleared { source_id: source() })
        );
        assert!(bus.history(source()).is_empty());

        // Stale envelope never reaches the consumer; the fresh one does.
        bus.publish(source(), Envelope::new(source(), "send", Value::Null, at - 1))
            .expect("publish");
        let fresh = at + 60_000;
        bus.publish(source(), Envelope::new(source(), "send", Value::Null, fresh))
            .expect("publish");
        match messages.recv().await {
            Some(RelayMessage::NewMessage { envelope }) => assert_eq!(envelope.timestamp_ms, fresh),
            other => panic!("expected NEW_MESSAGE, got {other:?}"),
        }

        handle.stop();
    }

    #[tokio::test]
    async fn test_stops_when_consumer_drops() {
        let bus = Arc::new(RelayBus::default());
        let manager = Arc::new(SubscriptionManager::new(Arc::clone(&bus)));
        let (handle, mut messages) = Watcher::new(Arc::new(LocalLink::new(manager)), source()).spawn();

        assert!(matches!(messages.recv().await, Some(RelayMessage::History { .. })));
        drop(messages);

        // The watcher notices the dropped consumer and returns.
        bus.publish(source(), Envelope::new(source(), "send", Value::Null, 5))
            .expect("publish");
        assert!(handle.join().await.is_ok());
    }

    #[tokio::test]
    async fn test_relinks_after_source_teardown() {
        let bus = Arc::new(RelayBus::default());
        let manager = Arc::new(SubscriptionManager::new(Arc::clone(&bus)));
        let policy = ReconnectPolicy {
            delay: Duration::from_millis(10),
            max_attempts: 50,
        };
        let (handle, mut messages) = Watcher::new(Arc::new(LocalLink::new(manager)), source())
            .with_policy(policy)
            .spawn();
        assert!(matches!(messages.recv().await, Some(RelayMessage::History { .. })));

        assert!(bus.teardown(source()));
        assert_eq!(
            messages.recv().await,
            Some(RelayMessage::Cleared { source_id: source() })
        );

        // Source comes back: the watcher attaches again with a fresh replay.
        bus.register(source());
        match messages.recv().await {
            Some(RelayMessage::History { envelopes, .. }) => assert!(envelopes.is_empty()),
            other => panic!("expected HISTORY, got {other:?}"),
        }
        assert_eq!(handle.attach_count(), 2);
        assert!(handle.is_linked());

        bus.publish(source(), Envelope::new(source(), "send", Value::Null, 7))
            .expect("publish");
        match messages.recv().await {
            Some(RelayMessage::NewMessage { envelope }) => assert_eq!(envelope.monotonic_seq, 1),
            other => panic!("expected NEW_MESSAGE, got {other:?}"),
        }

        handle.stop();
    }

    #[tokio::test]
    async fn test_gives_up_on_retired_source() {
        let bus = Arc::new(RelayBus::default());
        bus.register(source());
        bus.teardown(source());
        let manager = Arc::new(SubscriptionManager::new(Arc::clone(&bus)));
        let policy = ReconnectPolicy {
            delay: Duration::from_millis(1),
            max_attempts: 3,
        };

        let (handle, _messages) = Watcher::new(Arc::new(LocalLink::new(manager)), source())
            .with_policy(policy)
            .spawn();

        let err = handle.join().await.unwrap_err();
        assert!(matches!(err, Error::ReconnectExhausted { attempts: 3 }));
    }
}
