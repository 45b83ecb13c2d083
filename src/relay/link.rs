//! Observer ↔ relay links.
//!
//! A [`RelayLink`] opens one channel pair to the relay: control messages go
//! out, relay messages come back. The link is lost when the inbound side
//! ends; the watcher then opens a new one.
//!
//! | Link | Transport |
//! |------|-----------|
//! | [`LocalLink`] | In-process, straight into a [`SubscriptionManager`] |
//! | [`WsLink`] | WebSocket to a [`crate::relay::RelayServer`] |

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{from_str, to_string};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace, warn};
use url::Url;

use crate::error::{Error, Result};

use super::message::{ControlMessage, RelayMessage};
use super::subscription::SubscriptionManager;

// ============================================================================
// Constants
// ============================================================================

/// Default timeout for opening a WebSocket link.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// LinkChannel
// ============================================================================

/// One open link.
#[derive(Debug)]
pub struct LinkChannel {
    /// Observer → relay.
    pub control: mpsc::UnboundedSender<ControlMessage>,
    /// Relay → observer. Ends when the link is lost.
    pub messages: mpsc::UnboundedReceiver<RelayMessage>,
}

// ============================================================================
// RelayLink
// ============================================================================

/// Opens channels to the relay.
#[async_trait]
pub trait RelayLink: Send + Sync {
    /// Opens a new link.
    ///
    /// # Errors
    ///
    /// Returns an error if the relay cannot be reached.
    async fn open(&self) -> Result<LinkChannel>;
}

// ============================================================================
// LocalLink
// ============================================================================

/// In-process link.
#[derive(Clone)]
pub struct LocalLink {
    manager: Arc<SubscriptionManager>,
}

impl LocalLink {
    /// Creates a link into `manager`.
    #[inline]
    #[must_use]
    pub fn new(manager: Arc<SubscriptionManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl RelayLink for LocalLink {
    async fn open(&self) -> Result<LinkChannel> {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (relay_tx, relay_rx) = mpsc::unbounded_channel();

        let manager = Arc::clone(&self.manager);
        tokio::spawn(async move {
            manager.serve(control_rx, relay_tx).await;
        });

        Ok(LinkChannel {
            control: control_tx,
            messages: relay_rx,
        })
    }
}

// ============================================================================
// WsLink
// ============================================================================

/// WebSocket link to a relay server.
#[derive(Debug, Clone)]
pub struct WsLink {
    url: Url,
    connect_timeout: Duration,
}

impl WsLink {
    /// Creates a link to `url`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidUrl`] if `url` does not parse
    /// - [`Error::Config`] if the scheme is not `ws` or `wss`
    pub fn new(url: &str) -> Result<Self> {
        let url = Url::parse(url)?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(Error::config(format!(
                "relay URL must use ws:// or wss://, got {}",
                url.scheme()
            )));
        }

        Ok(Self {
            url,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        })
    }

    /// Sets the connect timeout.
    #[inline]
    #[must_use]
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Returns the relay URL.
    #[inline]
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl RelayLink for WsLink {
    async fn open(&self) -> Result<LinkChannel> {
        let connect = connect_async(self.url.as_str());
        let (ws_stream, _) = timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| Error::connection_timeout(self.connect_timeout.as_millis() as u64))?
            .map_err(|e| Error::connection(format!("relay connect failed: {e}")))?;

        debug!(url = %self.url, "Relay WebSocket link open");

        let (mut ws_write, mut ws_read) = ws_stream.split();
        let (control_tx, mut control_rx) = mpsc::unbounded_channel::<ControlMessage>();
        let (relay_tx, relay_rx) = mpsc::unbounded_channel();

        // Writer: ends when the observer drops its control sender.
        tokio::spawn(async move {
            while let Some(message) = control_rx.recv().await {
                let json = match to_string(&message) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(error = %e, "Failed to serialize control message");
                        continue;
                    }
                };
                if let Err(e) = ws_write.send(Message::Text(json.into())).await {
                    debug!(error = %e, "Relay link write failed");
                    break;
                }
            }
            let _ = ws_write.close().await;
        });

        // Reader: dropping `relay_tx` signals link loss.
        tokio::spawn(async move {
            while let Some(message) = ws_read.next().await {
                match message {
                    Ok(Message::Text(text)) => match from_str::<RelayMessage>(&text) {
                        Ok(message) => {
                            if relay_tx.send(message).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(error = %e, "Malformed relay message"),
                    },
                    Ok(Message::Close(_)) => {
                        debug!("Relay closed the link");
                        break;
                    }
                    Ok(_) => trace!("Ignored non-text relay frame"),
                    Err(e) => {
                        debug!(error = %e, "Relay link read failed");
                        break;
                    }
                }
            }
        });

        Ok(LinkChannel {
            control: control_tx,
            messages: relay_rx,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use crate::identifiers::SourceId;
    use crate::relay::RelayBus;

    #[test]
    fn test_ws_link_rejects_http_scheme() {
        assert!(matches!(
            WsLink::new("http://127.0.0.1:9000"),
            Err(Error::Config { .. })
        ));
        assert!(matches!(WsLink::new("not a url"), Err(Error::InvalidUrl(_))));
        assert!(WsLink::new("ws://127.0.0.1:9000/relay").is_ok());
    }

    #[tokio::test]
    async fn test_local_link_attaches() {
        let manager = Arc::new(SubscriptionManager::new(Arc::new(RelayBus::default())));
        let link = LocalLink::new(Arc::clone(&manager));
        let source_id = SourceId::new(4).expect("non-zero");

        let mut channel = link.open().await.expect("open");
        channel
            .control
            .send(ControlMessage::Init {
                source_id,
                cleared_at: None,
            })
            .expect("send");

        assert!(matches!(
            channel.messages.recv().await,
            Some(RelayMessage::History { .. })
        ));
        assert_eq!(manager.bus().subscriber_count(source_id), 1);
    }

    #[tokio::test]
    async fn test_ws_link_unreachable() {
        let link = WsLink::new("ws://127.0.0.1:1")
            .expect("valid url")
            .with_connect_timeout(Duration::from_secs(2));
        let err = link.open().await.unwrap_err();
        assert!(err.is_connection_error() || err.is_timeout());
    }
}
