//! Event normalization and the relay envelope.
//!
//! | Module | Description |
//! |--------|-------------|
//! | `envelope` | [`Envelope`] wire type, event type names, clock |
//! | `normalizer` | [`normalize`]: frame → event |
//! | `types` | [`MonitorEvent`] and its payload shapes |

// ============================================================================
// Submodules
// ============================================================================

/// Relay envelope.
pub mod envelope;

/// Frame to event normalization.
pub mod normalizer;

/// Normalized event shapes.
pub mod types;

// ============================================================================
// Re-exports
// ============================================================================

pub use envelope::{
    EVENT_CONNECTION_CREATED, EVENT_CONNECTION_STATE, EVENT_RECEIVE, EVENT_SEND,
    EVENT_UNCLASSIFIED, Envelope, now_ms,
};
pub use normalizer::normalize;
pub use types::{CallEvent, ConnectionState, MonitorEvent, StateChange};
