//! Monitor entry point.
//!
//! # Components
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Monitor`] | Owns the bus, proxies, relay servers and observers |
//! | [`MonitorBuilder`] | Fluent configuration builder |
//! | [`MonitorOptions`] | History, reconnect and timeout settings |
//!
//! # Example
//!
//! ```no_run
//! use signalr_monitor::{Monitor, Result};
//!
//! # async fn example() -> Result<()> {
//! let monitor = Monitor::builder().build()?;
//! let server = monitor.relay_server("127.0.0.1:9000".parse().expect("addr")).await?;
//! println!("Observers connect to {}", server.ws_url());
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Submodules
// ============================================================================

/// Fluent builder pattern for monitor configuration.
pub mod builder;

/// Core monitor implementation.
pub mod core;

/// Monitor options.
pub mod options;

// ============================================================================
// Re-exports
// ============================================================================

pub use builder::MonitorBuilder;
pub use core::Monitor;
pub use options::{DEFAULT_CONNECT_TIMEOUT, MonitorOptions};
