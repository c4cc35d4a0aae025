//! Decoded SSE frames.

use std::time::Duration;

/// A dispatched SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// The event type field (defaults to `"message"` when unspecified).
    pub event: String,
    /// The data payload, `data` lines joined with `\n`.
    pub data: String,
    /// The last event ID in effect when this event was dispatched.
    pub id: String,
}

/// One unit of output from the decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseFrame {
    /// A complete event.
    Event(SseEvent),
    /// A comment line (`: ping`), text after the colon.
    Comment(String),
    /// A `retry:` directive from the server.
    Retry(Duration),
}
