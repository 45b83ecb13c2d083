//! WebSocket observation layer.
//!
//! This module hooks monitored WebSocket transports and feeds what it sees
//! into the relay.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐      ┌──────────────────┐      ┌─────────────┐
//! │   client    │◄────►│   MonitorProxy   │◄────►│  hub server │
//! └─────────────┘  ws  │   Interceptor    │  ws  └─────────────┘
//!                      └────────┬─────────┘
//!                               │ envelopes
//!                               ▼
//!                            RelayBus
//! ```
//!
//! # Transport Lifecycle
//!
//! 1. `Interceptor::open` - Register the transport, unclassified
//! 2. `Interceptor::observe` - Detect SignalR, then normalize and publish
//! 3. `Interceptor::on_error` - Publish an `error` state if classified
//! 4. `Interceptor::on_close` - Publish `disconnected` with code and reason
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `interceptor` | Transport hooks, classification, fault isolation |
//! | `proxy` | Man-in-the-middle WebSocket proxy |

// ============================================================================
// Submodules
// ============================================================================

/// Transport hooks.
pub mod interceptor;

/// WebSocket proxy.
pub mod proxy;

// ============================================================================
// Re-exports
// ============================================================================

pub use interceptor::{CloseInfo, Interceptor, TransportHandle};
pub use proxy::{MonitorProxy, ProxyConfig};
