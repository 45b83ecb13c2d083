//! Monitor coordinator.
//!
//! Ties the relay bus, subscription manager, proxies and relay servers of
//! one monitoring session together.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::identifiers::SourceId;
use crate::relay::{
    LocalLink, RelayBus, RelayMessage, RelayServer, SubscriptionManager, Watcher, WatcherHandle,
    WsLink,
};
use crate::transport::{Interceptor, MonitorProxy, ProxyConfig};

use super::builder::MonitorBuilder;
use super::options::MonitorOptions;

// ============================================================================
// Types
// ============================================================================

/// Internal shared state.
pub(crate) struct MonitorInner {
    /// Validated options.
    pub options: MonitorOptions,

    /// Relay bus all sources publish to.
    pub bus: Arc<RelayBus>,

    /// Observer attachment.
    pub manager: Arc<SubscriptionManager>,

    /// Running proxies by source.
    pub proxies: Mutex<FxHashMap<SourceId, Arc<MonitorProxy>>>,

    /// Running relay servers.
    pub servers: Mutex<Vec<Arc<RelayServer>>>,
}

// ============================================================================
// Monitor
// ============================================================================

/// SignalR traffic monitor.
///
/// The monitor is responsible for:
/// - Running proxies that observe hub connections, one source each
/// - Serving remote observers over a relay WebSocket
/// - Attaching local and remote observers with automatic reconnect
///
/// # Examples
///
/// ```no_run
/// use signalr_monitor::{Monitor, SourceId};
///
/// # async fn example() -> signalr_monitor::Result<()> {
/// let monitor = Monitor::builder().build()?;
/// let source = SourceId::new(1).expect("non-zero");
///
/// let proxy = monitor
///     .proxy(source, "127.0.0.1:0".parse().expect("addr"), "ws://localhost:5000")
///     .await?;
/// let (_watcher, mut messages) = monitor.watch(source);
///
/// while let Some(message) = messages.recv().await {
///     println!("{message:?}");
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Monitor {
    /// Shared inner state.
    pub(crate) inner: Arc<MonitorInner>,
}

// ============================================================================
// Monitor - Display
// ============================================================================

impl fmt::Debug for Monitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Monitor")
            .field("options", &self.inner.options)
            .field("source_count", &self.inner.bus.source_count())
            .field("proxy_count", &self.proxy_count())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Monitor - Constructor
// ============================================================================

impl Monitor {
    /// Creates a configuration builder.
    #[inline]
    #[must_use]
    pub fn builder() -> MonitorBuilder {
        MonitorBuilder::new()
    }

    /// Creates a monitor from validated options.
    pub(crate) fn new(options: MonitorOptions, global: bool) -> Result<Self> {
        let bus = if global {
            RelayBus::global()
        } else {
            Arc::new(RelayBus::new(options.history_limits()?))
        };
        let manager = Arc::new(SubscriptionManager::new(Arc::clone(&bus)));

        Ok(Self {
            inner: Arc::new(MonitorInner {
                options,
                bus,
                manager,
                proxies: Mutex::new(FxHashMap::default()),
                servers: Mutex::new(Vec::new()),
            }),
        })
    }
}

// ============================================================================
// Monitor - Accessors
// ============================================================================

impl Monitor {
    /// Returns the options.
    #[inline]
    #[must_use]
    pub fn options(&self) -> &MonitorOptions {
        &self.inner.options
    }

    /// Returns the relay bus.
    #[inline]
    #[must_use]
    pub fn bus(&self) -> &Arc<RelayBus> {
        &self.inner.bus
    }

    /// Returns the subscription manager.
    #[inline]
    #[must_use]
    pub fn subscriptions(&self) -> &Arc<SubscriptionManager> {
        &self.inner.manager
    }

    /// Returns the number of running proxies.
    #[inline]
    #[must_use]
    pub fn proxy_count(&self) -> usize {
        self.inner.proxies.lock().len()
    }
}

// ============================================================================
// Monitor - Sources
// ============================================================================

impl Monitor {
    /// Creates an interceptor for embedding in a custom transport.
    ///
    /// Registers `source_id` on the bus, lifting an earlier teardown.
    #[must_use]
    pub fn interceptor(&self, source_id: SourceId) -> Interceptor {
        Interceptor::new(source_id, Arc::clone(&self.inner.bus))
    }

    /// Starts a proxy that observes connections to `upstream` as `source_id`.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if a proxy already runs for `source_id`, or the
    ///   upstream scheme is not `ws`/`wss`
    /// - [`Error::InvalidUrl`] if `upstream` does not parse
    /// - [`Error::Io`] if `listen` cannot be bound
    pub async fn proxy(
        &self,
        source_id: SourceId,
        listen: SocketAddr,
        upstream: &str,
    ) -> Result<Arc<MonitorProxy>> {
        if self.inner.proxies.lock().contains_key(&source_id) {
            return Err(Error::config(format!("a proxy already runs for source {source_id}")));
        }

        let config = ProxyConfig::new(source_id, listen, upstream)?
            .with_connect_timeout(self.inner.options.connect_timeout);
        let proxy = MonitorProxy::bind(config, Arc::clone(&self.inner.bus)).await?;

        self.inner.proxies.lock().insert(source_id, Arc::clone(&proxy));
        Ok(proxy)
    }

    /// Stops the proxy of a source and discards the source's state.
    ///
    /// Attached observers get `CLEARED` and relink; they attach again once
    /// a proxy for the same source is started. Returns `false` if no proxy
    /// ran for it.
    pub fn stop_proxy(&self, source_id: SourceId) -> bool {
        let removed = self.inner.proxies.lock().remove(&source_id);
        match removed {
            Some(proxy) => {
                proxy.shutdown();
                true
            }
            None => false,
        }
    }
}

// ============================================================================
// Monitor - Observers
// ============================================================================

impl Monitor {
    /// Starts a relay server for remote observers.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if `listen` cannot be bound.
    pub async fn relay_server(&self, listen: SocketAddr) -> Result<Arc<RelayServer>> {
        let server = RelayServer::bind(listen, Arc::clone(&self.inner.manager)).await?;
        self.inner.servers.lock().push(Arc::clone(&server));
        Ok(server)
    }

    /// Watches a source in-process.
    #[must_use]
    pub fn watch(&self, source_id: SourceId) -> (WatcherHandle, mpsc::UnboundedReceiver<RelayMessage>) {
        let link = Arc::new(LocalLink::new(Arc::clone(&self.inner.manager)));
        Watcher::new(link, source_id)
            .with_policy(self.inner.options.reconnect_policy())
            .spawn()
    }

    /// Watches a source through a remote relay server.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidUrl`] if `relay_url` does not parse
    /// - [`Error::Config`] if the scheme is not `ws`/`wss`
    pub fn watch_remote(
        &self,
        relay_url: &str,
        source_id: SourceId,
    ) -> Result<(WatcherHandle, mpsc::UnboundedReceiver<RelayMessage>)> {
        let link = WsLink::new(relay_url)?.with_connect_timeout(self.inner.options.connect_timeout);
        Ok(Watcher::new(Arc::new(link), source_id)
            .with_policy(self.inner.options.reconnect_policy())
            .spawn())
    }
}

// ============================================================================
// Monitor - Lifecycle
// ============================================================================

impl Monitor {
    /// Stops every proxy and relay server.
    pub fn close(&self) {
        let proxies: Vec<_> = self.inner.proxies.lock().drain().collect();
        let servers: Vec<_> = self.inner.servers.lock().drain(..).collect();

        info!(proxies = proxies.len(), servers = servers.len(), "Monitor shutting down");

        for (source_id, proxy) in proxies {
            proxy.shutdown();
            debug!(source_id = %source_id, "Proxy stopped");
        }
        for server in servers {
            server.shutdown();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
