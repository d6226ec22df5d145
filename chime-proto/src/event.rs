//! Push event envelope.
//!
//! The juggernaut feed multiplexes every subscribed channel over one
//! connection; each frame names the channel it belongs to, the event kind
//! (`Room`, `RoomMessage`, `RoomMembership`, ...), and carries the full
//! record payload.

use serde_json::Value;

use crate::record::ParseError;

/// One event from the push feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushEvent {
    /// Channel the event was published on.
    pub channel: String,
    /// Event kind, e.g. `Room` or `RoomMessage`.
    pub kind: String,
    /// The record payload, in the same shape as the REST endpoints return.
    pub record: Value,
}

impl PushEvent {
    /// Builds an event from a decoded push frame, which must carry its
    /// payload under a `record` member.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::MissingField`] when the frame has no `record`.
    pub fn from_frame(channel: &str, kind: &str, frame: &Value) -> Result<Self, ParseError> {
        let record = frame.get("record").ok_or(ParseError::MissingField {
            record: "PushFrame",
            field: "record",
        })?;
        Ok(Self {
            channel: channel.to_string(),
            kind: kind.to_string(),
            record: record.clone(),
        })
    }
}
