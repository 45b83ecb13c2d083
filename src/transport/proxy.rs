//! Transparent WebSocket proxy feeding the interceptor.
//!
//! Clients connect to the proxy instead of the hub. Each client connection
//! is paired with an upstream connection to the same path and query, and
//! frames are pumped both ways unchanged. Text frames are handed to the
//! [`Interceptor`] after they were forwarded.
//!
//! # Architecture
//!
//! ```text
//! ┌────────┐        ┌──────────────────────┐        ┌──────────┐
//! │ client │◄──────►│     MonitorProxy     │◄──────►│ upstream │
//! └────────┘   ws   │  forward, then       │   ws   │   hub    │
//!                   │  Interceptor::observe│        └──────────┘
//!                   └──────────┬───────────┘
//!                              ▼
//!                           RelayBus
//! ```
//!
//! All connections through one proxy belong to one source.

// ============================================================================
// Imports
// ============================================================================

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::{HeaderMap, HeaderValue, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::{accept_hdr_async, connect_async};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::identifiers::{SourceId, TransportId};
use crate::protocol::Direction;
use crate::relay::RelayBus;

use super::interceptor::{CloseInfo, Interceptor};

// ============================================================================
// Constants
// ============================================================================

/// Default timeout for the upstream connection.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Accept poll interval, bounds shutdown latency.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Client headers that belong to one hop's handshake and are not forwarded.
const HOP_HEADERS: &[&str] = &[
    "host",
    "connection",
    "upgrade",
    "sec-websocket-key",
    "sec-websocket-version",
    "sec-websocket-extensions",
    "content-length",
    "transfer-encoding",
    "keep-alive",
    "te",
    "trailer",
    "proxy-authorization",
    "proxy-connection",
];

// ============================================================================
// ProxyConfig
// ============================================================================

/// Configuration of one [`MonitorProxy`].
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    source_id: SourceId,
    listen: SocketAddr,
    upstream: Url,
    connect_timeout: Duration,
}

impl ProxyConfig {
    /// Creates a proxy configuration.
    ///
    /// # Arguments
    ///
    /// * `source_id` - Source every proxied connection publishes as
    /// * `listen` - Address clients connect to (port 0 for random)
    /// * `upstream` - Base `ws://` or `wss://` URL of the hub server
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidUrl`] if `upstream` does not parse
    /// - [`Error::Config`] if the scheme is not `ws` or `wss`
    pub fn new(source_id: SourceId, listen: SocketAddr, upstream: &str) -> Result<Self> {
        let upstream = Url::parse(upstream)?;
        if !matches!(upstream.scheme(), "ws" | "wss") {
            return Err(Error::config(format!(
                "upstream URL must use ws:// or wss://, got {}",
                upstream.scheme()
            )));
        }

        Ok(Self {
            source_id,
            listen,
            upstream,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        })
    }

    /// Sets the upstream connect timeout.
    #[inline]
    #[must_use]
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Returns the source ID.
    #[inline]
    #[must_use]
    pub fn source_id(&self) -> SourceId {
        self.source_id
    }

    /// Returns the listen address.
    #[inline]
    #[must_use]
    pub fn listen(&self) -> SocketAddr {
        self.listen
    }

    /// Returns the upstream base URL.
    #[inline]
    #[must_use]
    pub fn upstream(&self) -> &Url {
        &self.upstream
    }

    /// Resolves the upstream URL for a client request path.
    ///
    /// `/` keeps the base URL; any other path and query replace the base's.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidUrl`] if the path cannot be joined.
    pub fn upstream_for(&self, path_and_query: &str) -> Result<Url> {
        if path_and_query.is_empty() || path_and_query == "/" {
            return Ok(self.upstream.clone());
        }
        Ok(self.upstream.join(path_and_query)?)
    }
}

// ============================================================================
// Pump Outcome
// ============================================================================

/// Result of relaying one frame.
enum Flow {
    Continue,
    Closed(Option<CloseInfo>),
    Failed,
}

// ============================================================================
// MonitorProxy
// ============================================================================

/// Man-in-the-middle WebSocket proxy for one source.
///
/// # Example
///
/// ```ignore
/// let config = ProxyConfig::new(source_id, "127.0.0.1:0".parse()?, "ws://hub:5000")?;
/// let proxy = MonitorProxy::bind(config, bus).await?;
/// println!("Point clients at {}", proxy.ws_url());
/// ```
pub struct MonitorProxy {
    config: ProxyConfig,
    local_addr: SocketAddr,
    interceptor: Interceptor,
    bus: Arc<RelayBus>,
    connections: AtomicUsize,
    shutdown: AtomicBool,
}

impl std::fmt::Debug for MonitorProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorProxy")
            .field("config", &self.config)
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// MonitorProxy - Constructor
// ============================================================================

impl MonitorProxy {
    /// Binds the listen address and starts the accept loop.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if binding fails.
    pub async fn bind(config: ProxyConfig, bus: Arc<RelayBus>) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(config.listen).await?;
        let local_addr = listener.local_addr()?;

        let proxy = Arc::new(Self {
            interceptor: Interceptor::new(config.source_id, Arc::clone(&bus)),
            config,
            local_addr,
            bus,
            connections: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
        });

        let proxy_clone = Arc::clone(&proxy);
        tokio::spawn(async move {
            proxy_clone.accept_loop(listener).await;
        });

        info!(
            source_id = %proxy.config.source_id,
            addr = %local_addr,
            upstream = %proxy.config.upstream,
            "Monitor proxy started"
        );
        Ok(proxy)
    }
}

// ============================================================================
// MonitorProxy - Public API
// ============================================================================

impl MonitorProxy {
    /// Returns the URL clients connect to.
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

    /// Returns the source ID.
    #[inline]
    #[must_use]
    pub fn source_id(&self) -> SourceId {
        self.config.source_id
    }

    /// Returns the interceptor.
    #[inline]
    #[must_use]
    pub fn interceptor(&self) -> &Interceptor {
        &self.interceptor
    }

    /// Returns the number of proxied connections.
    #[inline]
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Stops accepting clients and tears the source down.
    ///
    /// Open connections keep pumping; their later events are dropped.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.interceptor.retire();
        self.bus.teardown(self.config.source_id);
        info!(source_id = %self.config.source_id, "Monitor proxy shut down");
    }
}

// ============================================================================
// MonitorProxy - Accept Loop
// ============================================================================

impl MonitorProxy {
    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        debug!("Proxy accept loop started");

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            match timeout(ACCEPT_POLL_INTERVAL, listener.accept()).await {
                Ok(Ok((stream, addr))) => {
                    let proxy = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = proxy.handle_connection(stream, addr).await {
                            warn!(error = %e, ?addr, "Proxied connection failed");
                        }
                    });
                }
                Ok(Err(e)) => {
                    error!(error = %e, "Proxy accept failed");
                }
                Err(_) => continue,
            }
        }

        debug!("Proxy accept loop terminated");
    }

    /// Upgrades a client, dials upstream and pumps until either side closes.
    ///
    /// The upstream sees the client's path, query and end-to-end headers.
    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        let mut path = String::new();
        let mut headers = HeaderMap::new();
        let capture = |request: &Request, mut response: Response| -> std::result::Result<Response, ErrorResponse> {
            path = request
                .uri()
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_default();
            headers = request.headers().clone();

            if let Some(protocol) = offered_protocol(request.headers()) {
                response.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, protocol);
            }
            Ok(response)
        };

        let client = accept_hdr_async(stream, capture)
            .await
            .map_err(|e| Error::connection(format!("WebSocket upgrade failed: {e}")))?;

        let target = self.config.upstream_for(&path)?;
        let request = upstream_request(&target, &headers)?;
        let connect = connect_async(request);
        let (upstream, _) = timeout(self.config.connect_timeout, connect)
            .await
            .map_err(|_| Error::connection_timeout(self.config.connect_timeout.as_millis() as u64))?
            .map_err(|e| Error::connection(format!("upstream connect failed: {e}")))?;

        let id = self.interceptor.open(target.as_str());
        self.connections.fetch_add(1, Ordering::SeqCst);
        debug!(?addr, transport_id = %id, upstream = %target, "Proxying connection");

        let (mut client_tx, mut client_rx) = client.split();
        let (mut upstream_tx, mut upstream_rx) = upstream.split();

        let close = loop {
            let flow = tokio::select! {
                message = client_rx.next() => match message {
                    Some(Ok(message)) => self.relay(id, Direction::Send, message, &mut upstream_tx).await,
                    Some(Err(e)) => {
                        debug!(transport_id = %id, error = %e, "Client socket error");
                        Flow::Failed
                    }
                    None => Flow::Closed(None),
                },
                message = upstream_rx.next() => match message {
                    Some(Ok(message)) => self.relay(id, Direction::Receive, message, &mut client_tx).await,
                    Some(Err(e)) => {
                        debug!(transport_id = %id, error = %e, "Upstream socket error");
                        Flow::Failed
                    }
                    None => Flow::Closed(None),
                },
            };

            match flow {
                Flow::Continue => continue,
                Flow::Closed(close) => break close,
                Flow::Failed => {
                    self.interceptor.on_error(id);
                    break None;
                }
            }
        };

        let _ = client_tx.close().await;
        let _ = upstream_tx.close().await;

        self.interceptor.on_close(id, close);
        self.connections.fetch_sub(1, Ordering::SeqCst);
        debug!(?addr, transport_id = %id, "Proxied connection closed");
        Ok(())
    }

    /// Forwards one frame unchanged, then lets the interceptor see it.
    async fn relay<S>(&self, id: TransportId, direction: Direction, message: Message, sink: &mut S) -> Flow
    where
        S: Sink<Message, Error = WsError> + Unpin,
    {
        match message {
            Message::Text(text) => {
                let forwarded = sink.send(Message::Text(text.clone())).await;
                self.interceptor.observe(id, direction, text.as_str());

                match forwarded {
                    Ok(()) => Flow::Continue,
                    Err(e) => {
                        debug!(transport_id = %id, %direction, error = %e, "Forward failed");
                        Flow::Failed
                    }
                }
            }

            Message::Binary(data) => match sink.send(Message::Binary(data)).await {
                Ok(()) => Flow::Continue,
                Err(e) => {
                    debug!(transport_id = %id, %direction, error = %e, "Forward failed");
                    Flow::Failed
                }
            },

            Message::Close(frame) => {
                let close = frame
                    .as_ref()
                    .map(|frame| CloseInfo::new(u16::from(frame.code), frame.reason.as_str()));
                let _ = sink.send(Message::Close(frame)).await;
                Flow::Closed(close)
            }

            // Keep-alives are answered per hop by tungstenite.
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => Flow::Continue,
        }
    }
}

// ============================================================================
// Handshake Helpers
// ============================================================================

/// Builds the upstream handshake request carrying the client's headers.
///
/// # Errors
///
/// Returns [`Error::WebSocket`] if `target` is not a valid request URI.
fn upstream_request(target: &Url, client_headers: &HeaderMap) -> Result<Request> {
    let mut request = target.as_str().into_client_request()?;

    let forwarded = request.headers_mut();
    for (name, value) in client_headers {
        if HOP_HEADERS.contains(&name.as_str()) {
            continue;
        }
        forwarded.append(name.clone(), value.clone());
    }

    Ok(request)
}

/// First subprotocol the client offered, echoed back to complete its handshake.
fn offered_protocol(headers: &HeaderMap) -> Option<HeaderValue> {
    headers
        .get(SEC_WEBSOCKET_PROTOCOL)
        .and_then(|value| value.to_str().ok())
        .and_then(|offered| offered.split(',').map(str::trim).find(|p| !p.is_empty()))
        .and_then(|protocol| HeaderValue::from_str(protocol).ok())
}

// ============================================================================
// Tests
// ============================================================================
