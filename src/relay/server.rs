//! WebSocket endpoint for remote observers.
//!
//! Each accepted connection is one observer session: text frames carry
//! JSON [`ControlMessage`]s in, [`RelayMessage`]s go back out. Closing the
//! socket ends the session and detaches its subscription.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │               RelayServer                │
//! │               (single port)              │
//! │  observer ws ─► ControlMessage ─┐        │
//! │                                 ▼        │
//! │                 SubscriptionManager::serve│
//! │                                 │        │
//! │  observer ws ◄─ RelayMessage ◄──┘        │
//! └──────────────────────────────────────────┘
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{from_str, to_string};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, trace, warn};

use crate::error::{Error, Result};

use super::message::{ControlMessage, RelayMessage};
use super::subscription::SubscriptionManager;

// ============================================================================
// Constants
// ============================================================================

/// Accept poll interval, bounds shutdown latency.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(100);

// ============================================================================
// RelayServer
// ============================================================================

/// Serves observer sessions over WebSocket.
///
/// # Example
///
/// ```ignore
/// let server = RelayServer::bind("127.0.0.1:0".parse()?, manager).await?;
/// println!("Relay URL: {}", server.ws_url());
/// ```
pub struct RelayServer {
    /// Bound address.
    local_addr: SocketAddr,

    /// Session handler.
    manager: Arc<SubscriptionManager>,

    /// Open observer sessions.
    sessions: AtomicUsize,

    /// Shutdown flag.
    shutdown: AtomicBool,
}

// ============================================================================
// RelayServer - Constructor
// ============================================================================

impl RelayServer {
    /// Binds and starts the accept loop.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if binding fails.
    pub async fn bind(addr: SocketAddr, manager: Arc<SubscriptionManager>) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        let server = Arc::new(Self {
            local_addr,
            manager,
            sessions: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
        });

        let server_clone = Arc::clone(&server);
        tokio::spawn(async move {
            server_clone.accept_loop(listener).await;
        });

        info!(addr = %local_addr, "Relay server started");
        Ok(server)
    }
}

// ============================================================================
// RelayServer - Public API
// ============================================================================

impl RelayServer {
    /// Returns the WebSocket URL observers connect to.
    #[inline]
    #[must_use]
    pub fn ws_url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    /// Returns the bound address.
    #[inline]
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns the bound port.
    #[inline]
    #[must_use]
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Returns the number of open observer sessions.
    #[inline]
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }

    /// Stops accepting observers. Open sessions run until their peers close.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        info!(addr = %self.local_addr, "Relay server shutting down");
    }
}

// ============================================================================
// RelayServer - Accept Loop
// ============================================================================

impl RelayServer {
    /// Background task that accepts observers.
    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        debug!("Relay accept loop started");

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            match timeout(ACCEPT_POLL_INTERVAL, listener.accept()).await {
                Ok(Ok((stream, addr))) => {
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        server.sessions.fetch_add(1, Ordering::SeqCst);
                        if let Err(e) = server.handle_session(stream, addr).await {
                            warn!(error = %e, ?addr, "Observer session failed");
                        }
                        server.sessions.fetch_sub(1, Ordering::SeqCst);
                    });
                }
                Ok(Err(e)) => {
                    error!(error = %e, "Relay accept failed");
                }
                Err(_) => continue,
            }
        }

        debug!("Relay accept loop terminated");
    }

    /// Bridges one observer socket to a subscription session.
    async fn handle_session(&self, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        let ws_stream = tokio_tungstenite::accept_async(stream)
            .await
            .map_err(|e| Error::connection(format!("WebSocket upgrade failed: {e}")))?;

        debug!(?addr, "Observer connected");

        let (mut ws_write, mut ws_read) = ws_stream.split();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (relay_tx, mut relay_rx) = mpsc::unbounded_channel::<RelayMessage>();

        let manager = Arc::clone(&self.manager);
        let session = tokio::spawn(async move {
            manager.serve(control_rx, relay_tx).await;
        });

        loop {
            tokio::select! {
                message = ws_read.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            match from_str::<ControlMessage>(&text) {
                                Ok(control) => {
                                    trace!(?addr, ?control, "Control message");
                                    if control_tx.send(control).is_err() {
                                        break;
                                    }
                                }
                                Err(e) => {
                                    let e = Error::protocol(format!("malformed control message: {e}"));
                                    warn!(?addr, error = %e, "Ignored control message");
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            debug!(?addr, "Observer closed");
                            break;
                        }
                        Some(Err(e)) => {
                            debug!(?addr, error = %e, "Observer socket error");
                            break;
                        }
                        Some(Ok(_)) => {}
                    }
                }

                outbound = relay_rx.recv() => {
                    let Some(outbound) = outbound else {
                        break;
                    };
                    let json = to_string(&outbound)?;
                    if let Err(e) = ws_write.send(Message::Text(json.into())).await {
                        debug!(?addr, error = %e, "Observer write failed");
                        break;
                    }
                }
            }
        }

        drop(control_tx);
        let _ = session.await;
        let _ = ws_write.close().await;

        debug!(?addr, "Observer session closed");
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use tokio_tungstenite::connect_async;

    use crate::identifiers::SourceId;
    use crate::relay::RelayBus;

    async fn server() -> Arc<RelayServer> {
        let manager = Arc::new(SubscriptionManager::new(Arc::new(RelayBus::default())));
        RelayServer::bind("127.0.0.1:0".parse().expect("addr"), manager)
            .await
            .expect("bind")
    }

    #[tokio::test]
    async fn test_server_creation() {
        let server = server().await;
        assert!(server.port() > 0);
        assert_eq!(server.ws_url(), format!("ws://127.0.0.1:{}", server.port()));
        assert_eq!(server.session_count(), 0);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_init_over_websocket() {
        let server = server().await;
        let (mut ws, _) = connect_async(server.ws_url()).await.expect("connect");

        let source_id = SourceId::new(2).expect("non-zero");
        let init = to_string(&ControlMessage::Init {
            source_id,
            cleared_at: None,
        })
        .expect("serialize");
        ws.send(Message::Text(init.into())).await.expect("send");

        let reply = loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => break text,
                Some(Ok(_)) => continue,
                other => panic!("unexpected frame: {other:?}"),
            }
        };
        let reply: RelayMessage = from_str(&reply).expect("parse");
        assert_eq!(
            reply,
            RelayMessage::History {
                source_id,
                envelopes: Vec::new()
            }
        );

        server.shutdown();
    }

    #[tokio::test]
    async fn test_malformed_control_is_ignored() {
        let server = server().await;
        let (mut ws, _) = connect_async(server.ws_url()).await.expect("connect");

        ws.send(Message::Text("{\"type\":\"PAUSE\"}".into()))
            .await
            .expect("send");
        let status = to_string(&ControlMessage::Status {
            source_id: SourceId::new(1).expect("non-zero"),
        })
        .expect("serialize");
        ws.send(Message::Text(status.into())).await.expect("send");

        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                let reply: RelayMessage = from_str(&text).expect("parse");
                assert!(matches!(reply, RelayMessage::Status { state: None, .. }));
            }
            other => panic!("unexpected frame: {other:?}"),
        }

        server.shutdown();
    }
}
