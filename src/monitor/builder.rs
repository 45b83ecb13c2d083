//! Builder pattern for monitor configuration.
//!
//! # Example
//!
//! ```no_run
//! use signalr_monitor::Monitor;
//!
//! # fn example() -> signalr_monitor::Result<()> {
//! let monitor = Monitor::builder()
//!     .history_limits(2000, 1000)
//!     .max_reconnect_attempts(20)
//!     .build()?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use crate::error::Result;

use super::core::Monitor;
use super::options::MonitorOptions;

// ============================================================================
// MonitorBuilder
// ============================================================================

/// Builder for configuring a [`Monitor`].
///
/// Use [`Monitor::builder()`] to create a new builder.
#[derive(Debug, Default, Clone)]
pub struct MonitorBuilder {
    /// Options being assembled.
    options: MonitorOptions,
    /// Use the process-wide relay bus.
    global: bool,
}

// ============================================================================
// MonitorBuilder Implementation
// ============================================================================

impl MonitorBuilder {
    /// Creates a builder with default options.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces all options.
    #[inline]
    #[must_use]
    pub fn options(mut self, options: MonitorOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the history trim marks.
    ///
    /// # Arguments
    ///
    /// * `high` - Length that triggers a trim
    /// * `low` - Length kept after the trim
    #[inline]
    #[must_use]
    pub fn history_limits(mut self, high: usize, low: usize) -> Self {
        self.options = self.options.with_history_limits(high, low);
        self
    }

    /// Sets the observer reconnect delay.
    #[inline]
    #[must_use]
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.options = self.options.with_reconnect_delay(delay);
        self
    }

    /// Sets the observer reconnect attempt bound.
    #[inline]
    #[must_use]
    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.options = self.options.with_max_reconnect_attempts(attempts);
        self
    }

    /// Sets the connect timeout for upstream and relay sockets.
    #[inline]
    #[must_use]
    pub fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.options = self.options.with_connect_timeout(connect_timeout);
        self
    }

    /// Shares the process-wide relay bus instead of a private one.
    ///
    /// The global bus always uses the default history limits.
    #[inline]
    #[must_use]
    pub fn global(mut self) -> Self {
        self.global = true;
        self
    }

    /// Builds the monitor with validation.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Config`] if any option is invalid.
    pub fn build(self) -> Result<Monitor> {
        self.options.validate()?;
        Monitor::new(self.options, self.global)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use crate::relay::RelayBus;

    #[test]
    fn test_default_builds() {
        let monitor = MonitorBuilder::new().build().expect("build");
        assert_eq!(monitor.options(), &MonitorOptions::default());
    }

    #[test]
    fn test_invalid_history_rejected() {
        let err = MonitorBuilder::new().history_limits(1, 5).build().unwrap_err();
        assert!(err.to_string().contains("history"));
    }

    #[test]
    fn test_settings_flow_into_options() {
        let monitor = MonitorBuilder::new()
            .history_limits(10, 4)
            .reconnect_delay(Duration::from_millis(20))
            .max_reconnect_attempts(2)
            .connect_timeout(Duration::from_secs(3))
            .build()
            .expect("build");

        let options = monitor.options();
        assert_eq!(options.history_high_mark, 10);
        assert_eq!(options.reconnect_delay, Duration::from_millis(20));
        assert_eq!(options.max_reconnect_attempts, 2);
        assert_eq!(monitor.bus().limits().low(), 4);
    }

    #[test]
    fn test_global_shares_bus() {
        let monitor = MonitorBuilder::new().global().build().expect("build");
        assert!(Arc::ptr_eq(monitor.bus(), &RelayBus::global()));
    }
}
