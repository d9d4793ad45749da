//! Wire frames for the hub channel.
//!
//! Endpoints exchange JSON text frames of the shape `{"type": "<kind>", ...}`
//! over the WebSocket. This module defines the strongly-typed [`Frame`] enum
//! and a tolerant parser; unknown kinds and malformed JSON surface as `Err`
//! so the read loop can log and skip them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// All frame kinds spoken on a hub channel.
///
/// Tagged via the `"type"` field; payload fields are inlined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// A named operation call. The hub answers with exactly one
    /// [`Frame::Completion`] carrying the same `id`.
    Invocation {
        id: String,
        target: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        arguments: Vec<Value>,
    },

    /// The hub's single response to an invocation.
    ///
    /// A non-null `error` means the target is unknown on the hub or its
    /// handler failed, i.e. the rejected case.
    Completion {
        id: String,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<String>,
    },

    /// An unsolicited hub-initiated event.
    Event {
        target: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        arguments: Vec<Value>,
    },
}

/// Parse one text frame into a typed [`Frame`].
///
/// Returns `Err` for malformed JSON or unknown `type` values. Callers
/// should log and continue; a bad frame never tears down the connection.
pub fn parse_frame(text: &str) -> Result<Frame, serde_json::Error> {
    serde_json::from_str(text)
}
