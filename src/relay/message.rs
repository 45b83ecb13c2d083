//! Relay boundary messages.
//!
//! Typed messages exchanged between the relay and an observer channel.
//!
//! | Message | Direction | Purpose |
//! |---------|-----------|---------|
//! | `INIT` | Observer → Relay | Attach to a source, replay history |
//! | `CLEAR` | Observer → Relay | Empty the source history |
//! | `STATUS` | Observer → Relay | Ask for the latest connection state |
//! | `HISTORY` | Relay → Observer | Replay after `INIT` |
//! | `CLEARED` | Relay → Observer | History was cleared |
//! | `NEW_MESSAGE` | Relay → Observer | One live envelope |
//! | `STATUS` | Relay → Observer | Latest connection state |
//!
//! # Format
//!
//! ```json
//! { "type": "INIT", "sourceId": 3, "clearedAt": 1760601600000 }
//! { "type": "NEW_MESSAGE", "envelope": { "sourceId": 3, ... } }
//! ```

// ============================================================================
// Imports
// ============================================================================

use serde::{Deserialize, Serialize};

use crate::event::{ConnectionState, Envelope};
use crate::identifiers::SourceId;

// ============================================================================
// ControlMessage
// ============================================================================

/// Observer → relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
    /// Attach to a source.
    Init {
        /// Source to attach to.
        #[serde(rename = "sourceId")]
        source_id: SourceId,

        /// Observer-side clear time; older envelopes are not replayed.
        #[serde(rename = "clearedAt", default, skip_serializing_if = "Option::is_none")]
        cleared_at: Option<i64>,
    },

    /// Clear the source history.
    Clear {
        /// Source to clear.
        #[serde(rename = "sourceId")]
        source_id: SourceId,
    },

    /// Query the latest connection state.
    Status {
        /// Source to query.
        #[serde(rename = "sourceId")]
        source_id: SourceId,
    },
}

// ============================================================================
// RelayMessage
// ============================================================================

/// Relay → observer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelayMessage {
    /// History replay.
    History {
        /// Replayed source.
        #[serde(rename = "sourceId")]
        source_id: SourceId,
        /// Envelopes, oldest first.
        envelopes: Vec<Envelope>,
    },

    /// History was cleared.
    Cleared {
        /// Cleared source.
        #[serde(rename = "sourceId")]
        source_id: SourceId,
    },

    /// One live envelope.
    NewMessage {
        /// The envelope.
        envelope: Envelope,
    },

    /// Latest connection state.
    Status {
        /// Queried source.
        #[serde(rename = "sourceId")]
        source_id: SourceId,
        /// State, if any connection-state event was seen.
        state: Option<ConnectionState>,
    },
}

// ============================================================================
// Tests
// ============================================================================
