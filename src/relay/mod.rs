//! Relay between monitored sources and observers.
//!
//! Sources publish envelopes into the [`RelayBus`]. Observers attach through
//! the [`SubscriptionManager`], either in-process or over the
//! [`RelayServer`], and a [`Watcher`] keeps each observer attached across
//! link loss.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `bus` | [`RelayBus`]: sequencing, history, fan-out |
//! | `history` | [`HistoryBuffer`] with high/low marks |
//! | `link` | [`RelayLink`], [`LocalLink`], [`WsLink`] |
//! | `message` | [`ControlMessage`], [`RelayMessage`] |
//! | `server` | [`RelayServer`] WebSocket endpoint |
//! | `subscription` | [`SubscriptionManager`] |
//! | `watcher` | [`Watcher`] reconnect loop |

// ============================================================================
// Submodules
// ============================================================================

/// Per-source sequencing, history and fan-out.
pub mod bus;

/// Bounded envelope history.
pub mod history;

/// Observer ↔ relay links.
pub mod link;

/// Relay boundary messages.
pub mod message;

/// WebSocket endpoint for observers.
pub mod server;

/// Observer attachment and control sessions.
pub mod subscription;

/// Observer-side reconnect loop.
pub mod watcher;

// ============================================================================
// Re-exports
// ============================================================================

pub use bus::{ObserverSender, RelayBus, Subscription};
pub use history::{DEFAULT_HIGH_MARK, DEFAULT_LOW_MARK, HistoryBuffer, HistoryLimits};
pub use link::{LinkChannel, LocalLink, RelayLink, WsLink};
pub use message::{ControlMessage, RelayMessage};
pub use server::RelayServer;
pub use subscription::SubscriptionManager;
pub use watcher::{
    DEFAULT_MAX_RECONNECT_ATTEMPTS, DEFAULT_RECONNECT_DELAY, ReconnectPolicy, Watcher,
    WatcherHandle,
};
