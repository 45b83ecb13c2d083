//! SignalR JSON hub protocol.
//!
//! This module decodes the text frames of a SignalR WebSocket connection.
//!
//! # Framing
//!
//! Every record is a JSON object terminated by the ASCII record separator
//! `0x1E`. One WebSocket message may carry several records.
//!
//! ```text
//! {"protocol":"json","version":1}\x1e
//! {"type":1,"target":"Foo","arguments":[1,2]}\x1e{"type":6}\x1e
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `decoder` | Record splitting, classification, protocol detection |
//! | `frame` | [`ProtocolFrame`], [`FrameKind`], [`Direction`] |

// ============================================================================
// Submodules
// ============================================================================

/// Record splitting and classification.
pub mod decoder;

/// Decoded frame types.
pub mod frame;

// ============================================================================
// Re-exports
// ============================================================================

pub use decoder::{classify, decode, decode_records, detect_protocol};
pub use frame::{Direction, FrameKind, ProtocolFrame, RECORD_SEPARATOR};
