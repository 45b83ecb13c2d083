//! SignalR monitor - Passive wire-traffic inspection for SignalR hubs.
//!
//! This library observes SignalR JSON-protocol traffic on WebSocket
//! connections, normalizes it into structured events, and relays those
//! events to any number of observers with bounded replay history.
//!
//! # Architecture
//!
//! The monitor follows a source/observer model:
//!
//! - **Source**: A monitored context (one proxy listener). Its transports are
//!   hooked by an [`Interceptor`] that detects SignalR and publishes events
//! - **Observer**: A consumer attached to one source, in-process or over the
//!   relay WebSocket, kept attached by a [`Watcher`]
//!
//! Key design principles:
//!
//! - Observation never alters or delays monitored traffic
//! - Per-source ordering: envelopes carry a gap-free `monotonicSeq`
//! - Bounded history: trimmed to 500 once it passes 1000 entries
//! - Attach replays history first, then streams live envelopes
//!
//! # Quick Start
//!
//! ```no_run
//! use signalr_monitor::{Monitor, RelayMessage, Result, SourceId};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let monitor = Monitor::builder().build()?;
//!     let source = SourceId::new(1).expect("non-zero");
//!
//!     // Point hub clients at the proxy instead of the server
//!     let proxy = monitor
//!         .proxy(source, "127.0.0.1:8080".parse().expect("addr"), "ws://localhost:5000")
//!         .await?;
//!     println!("Proxy listening on {}", proxy.ws_url());
//!
//!     // Observe the traffic
//!     let (_watcher, mut messages) = monitor.watch(source);
//!     while let Some(message) = messages.recv().await {
//!         if let RelayMessage::NewMessage { envelope } = message {
//!             println!("#{} {} {}", envelope.monotonic_seq, envelope.event_type, envelope.data);
//!         }
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`error`] | Error types and [`Result`] alias |
//! | [`event`] | Normalized events and the relay [`Envelope`] |
//! | [`identifiers`] | Type-safe ID wrappers |
//! | [`monitor`] | [`Monitor`] facade and configuration |
//! | [`protocol`] | SignalR record decoding and detection |
//! | [`relay`] | Bus, history, subscriptions, observer links |
//! | [`transport`] | Interceptor and WebSocket proxy |

// ============================================================================
// Modules
// ============================================================================

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Normalized events and envelopes.
pub mod event;

/// Type-safe identifiers.
///
/// Newtype wrappers prevent mixing incompatible IDs at compile time.
pub mod identifiers;

/// Monitor facade.
///
/// Use [`Monitor::builder()`] to create a configured monitor.
pub mod monitor;

/// SignalR JSON protocol decoding.
pub mod protocol;

/// Relay between sources and observers.
pub mod relay;

/// Transport observation.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Error types
pub use error::{Error, Result};

// Event types
pub use event::{CallEvent, ConnectionState, Envelope, MonitorEvent, StateChange, normalize};

// Identifier types
pub use identifiers::{SourceId, SubscriptionId, TransportId};

// Monitor types
pub use monitor::{Monitor, MonitorBuilder, MonitorOptions};

// Protocol types
pub use protocol::{Direction, FrameKind, ProtocolFrame, decode, detect_protocol};

// Relay types
pub use relay::{
    ControlMessage, HistoryLimits, LocalLink, ReconnectPolicy, RelayBus, RelayLink, RelayMessage,
    RelayServer, Subscription, SubscriptionManager, Watcher, WatcherHandle, WsLink,
};

// Transport types
pub use transport::{CloseInfo, Interceptor, MonitorProxy, ProxyConfig};
