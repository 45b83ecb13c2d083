//! Monitor configuration.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use signalr_monitor::MonitorOptions;
//!
//! let options = MonitorOptions::new()
//!     .with_history_limits(200, 100)
//!     .with_reconnect_delay(Duration::from_millis(250))
//!     .with_max_reconnect_attempts(20);
//!
//! options.validate()?;
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use crate::error::{Error, Result};
use crate::relay::{
    DEFAULT_HIGH_MARK, DEFAULT_LOW_MARK, DEFAULT_MAX_RECONNECT_ATTEMPTS, DEFAULT_RECONNECT_DELAY,
    HistoryLimits, ReconnectPolicy,
};

// ============================================================================
// Constants
// ============================================================================

/// Default timeout for upstream and relay connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// MonitorOptions
// ============================================================================

/// Tunables of a [`crate::Monitor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorOptions {
    /// History length that triggers a trim.
    pub history_high_mark: usize,

    /// History length kept after a trim.
    pub history_low_mark: usize,

    /// Delay between observer reconnect attempts.
    pub reconnect_delay: Duration,

    /// Consecutive failed reconnects before an observer gives up.
    pub max_reconnect_attempts: u32,

    /// Timeout for opening upstream and relay WebSockets.
    pub connect_timeout: Duration,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl MonitorOptions {
    /// Creates options with default settings.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            history_high_mark: DEFAULT_HIGH_MARK,
            history_low_mark: DEFAULT_LOW_MARK,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

// ============================================================================
// Builder Methods
// ============================================================================

impl MonitorOptions {
    /// Sets the history trim marks.
    #[inline]
    #[must_use]
    pub fn with_history_limits(mut self, high: usize, low: usize) -> Self {
        self.history_high_mark = high;
        self.history_low_mark = low;
        self
    }

    /// Sets the reconnect delay.
    #[inline]
    #[must_use]
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Sets the reconnect attempt bound.
    #[inline]
    #[must_use]
    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    /// Sets the connect timeout.
    #[inline]
    #[must_use]
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
}

// ============================================================================
// Conversion Methods
// ============================================================================

impl MonitorOptions {
    /// Returns validated history limits.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the marks are zero or inverted.
    pub fn history_limits(&self) -> Result<HistoryLimits> {
        HistoryLimits::new(self.history_high_mark, self.history_low_mark)
    }

    /// Returns the observer reconnect policy.
    #[inline]
    #[must_use]
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            delay: self.reconnect_delay,
            max_attempts: self.max_reconnect_attempts,
        }
    }

    /// Validates the options.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        self.history_limits()?;

        if self.max_reconnect_attempts == 0 {
            return Err(Error::config("max_reconnect_attempts must be at least 1"));
        }
        if self.connect_timeout.is_zero() {
            return Err(Error::config("connect_timeout must be greater than zero"));
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = MonitorOptions::new();
        assert_eq!(options, MonitorOptions::default());
        assert_eq!(options.history_high_mark, 1000);
        assert_eq!(options.history_low_mark, 500);
        assert_eq!(options.reconnect_delay, Duration::from_millis(500));
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_builder_methods() {
        let options = MonitorOptions::new()
            .with_history_limits(20, 10)
            .with_reconnect_delay(Duration::from_millis(5))
            .with_max_reconnect_attempts(3)
            .with_connect_timeout(Duration::from_secs(1));

        let policy = options.reconnect_policy();
        assert_eq!(policy.delay, Duration::from_millis(5));
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(options.history_limits().expect("limits").high(), 20);
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        assert!(MonitorOptions::new().with_history_limits(10, 20).validate().is_err());
        assert!(MonitorOptions::new().with_max_reconnect_attempts(0).validate().is_err());
        assert!(
            MonitorOptions::new()
                .with_connect_timeout(Duration::ZERO)
                .validate()
                .is_err()
        );
    }
}
