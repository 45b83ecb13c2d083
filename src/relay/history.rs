//! Bounded per-source envelope history.
//!
//! Soft-capped buffer: once the length exceeds the high mark, the oldest
//! entries are dropped until only the low mark remains. Survivors keep their
//! order.

// ============================================================================
// Imports
// ============================================================================

use crate::error::{Error, Result};
use crate::event::Envelope;

// ============================================================================
// Constants
// ============================================================================

/// Default soft cap.
pub const DEFAULT_HIGH_MARK: usize = 1000;

/// Default length after a trim.
pub const DEFAULT_LOW_MARK: usize = 500;

// ============================================================================
// HistoryLimits
// ============================================================================

/// Cap and trim target of a [`HistoryBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryLimits {
    high: usize,
    low: usize,
}

impl HistoryLimits {
    /// Creates validated limits.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if either mark is zero or `low > high`.
    pub fn new(high: usize, low: usize) -> Result<Self> {
        if high == 0 || low == 0 {
            return Err(Error::config("history marks must be greater than zero"));
        }
        if low > high {
            return Err(Error::config(format!(
                "history low mark ({low}) exceeds high mark ({high})"
            )));
        }
        Ok(Self { high, low })
    }

    /// Returns the soft cap.
    #[inline]
    #[must_use]
    pub const fn high(&self) -> usize {
        self.high
    }

    /// Returns the trim target.
    #[inline]
    #[must_use]
    pub const fn low(&self) -> usize {
        self.low
    }
}

impl Default for HistoryLimits {
    fn default() -> Self {
        Self {
            high: DEFAULT_HIGH_MARK,
            low: DEFAULT_LOW_MARK,
        }
    }
}

// ============================================================================
// HistoryBuffer
// ============================================================================

/// Ordered envelope history of one source.
#[derive(Debug, Clone, Default)]
pub struct HistoryBuffer {
    entries: Vec<Envelope>,
    limits: HistoryLimits,
}

impl HistoryBuffer {
    /// Creates an empty buffer.
    #[inline]
    #[must_use]
    pub fn new(limits: HistoryLimits) -> Self {
        Self {
            entries: Vec::new(),
            limits,
        }
    }

    /// Appends an envelope, trimming if the cap is exceeded.
    ///
    /// Returns the number of entries dropped.
    pub fn push(&mut self, envelope: Envelope) -> usize {
        self.entries.push(envelope);

        if self.entries.len() > self.limits.high {
            let excess = self.entries.len() - self.limits.low;
            self.entries.drain(..excess);
            return excess;
        }

        0
    }

    /// Drops every entry.
    #[inline]
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Returns entries newer than `cleared_at`, oldest first.
    #[must_use]
    pub fn snapshot_after(&self, cleared_at: i64) -> Vec<Envelope> {
        self.entries
            .iter()
            .filter(|envelope| envelope.is_after(cleared_at))
            .cloned()
            .collect()
    }

    /// Returns all entries, oldest first.
    #[inline]
    #[must_use]
    pub fn entries(&self) -> &[Envelope] {
        &self.entries
    }

    /// Returns the number of entries.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if empty.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::Value;

    use crate::identifiers::SourceId;

    fn envelope(seq: u64, timestamp_ms: i64) -> Envelope {
        let source_id = SourceId::new(1).expect("non-zero");
        let mut envelope = Envelope::new(source_id, "receive", Value::Null, timestamp_ms);
        envelope.monotonic_seq = seq;
        envelope
    }

    #[test]
    fn test_limits_validation() {
        assert!(HistoryLimits::new(10, 5).is_ok());
        assert!(HistoryLimits::new(10, 10).is_ok());
        assert!(HistoryLimits::new(5, 10).is_err());
        assert!(HistoryLimits::new(0, 0).is_err());

        let defaults = HistoryLimits::default();
        assert_eq!(defaults.high(), 1000);
        assert_eq!(defaults.low(), 500);
    }

    #[test]
    fn test_exactly_high_mark_keeps_everything() {
        let mut buffer = HistoryBuffer::default();
        for seq in 1..=1000 {
            assert_eq!(buffer.push(envelope(seq, seq as i64)), 0);
        }
        assert_eq!(buffer.len(), 1000);
    }

    #[test]
    fn test_one_past_high_mark_trims_to_low() {
        let mut buffer = HistoryBuffer::default();
        for seq in 1..=1001 {
            buffer.push(envelope(seq, seq as i64));
        }

        assert_eq!(buffer.len(), 500);
        let seqs: Vec<u64> = buffer.entries().iter().map(|e| e.monotonic_seq).collect();
        let expected: Vec<u64> = (502..=1001).collect();
        assert_eq!(seqs, expected);
    }

    #[test]
    fn test_never_exceeds_high_mark() {
        let limits = HistoryLimits::new(8, 3).expect("valid limits");
        let mut buffer = HistoryBuffer::new(limits);
        for seq in 1..=100 {
            buffer.push(envelope(seq, 0));
            assert!(buffer.len() <= 8);
        }
    }

    #[test]
    fn test_snapshot_after_filters_by_timestamp() {
        let mut buffer = HistoryBuffer::default();
        buffer.push(envelope(1, 100));
        buffer.push(envelope(2, 200));
        buffer.push(envelope(3, 300));

        let seqs: Vec<u64> = buffer
            .snapshot_after(200)
            .iter()
            .map(|e| e.monotonic_seq)
            .collect();
        assert_eq!(seqs, vec![3]);

        buffer.clear();
        assert!(buffer.is_empty());
    }
}
