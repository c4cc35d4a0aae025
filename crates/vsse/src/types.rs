//! Core type definitions shared by the correlator, driver and facade.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Phase markers the client itself produces or recognises.
///
/// Servers are free to use any phase strings; the correlator only routes
/// them. The constants below are the ones synthesized by the client
/// (`cancelled`, `error`) and the default terminal set.
pub mod phase {
    /// Conventional first event of a request.
    pub const START: &str = "start";
    /// Conventional incremental event.
    pub const DELTA: &str = "delta";
    /// Conventional successful terminal event.
    pub const END: &str = "end";
    /// Terminal failure, also synthesized when reconnection gives up.
    pub const ERROR: &str = "error";
    /// Synthesized on client teardown for requests still pending.
    pub const CANCELLED: &str = "cancelled";
}

/// Event `type` values synthesized by the client.
pub mod event_type {
    /// Delivered with [`super::phase::CANCELLED`] on `close()`.
    pub const CLOSED: &str = "closed";
    /// Delivered with [`super::phase::ERROR`] when reconnects are exhausted.
    pub const TRANSPORT_ERROR: &str = "transport_error";
}

/// Unique identifier correlating a trigger request with streamed events.
/// Uses ULID: 80 bits of CSPRNG output behind a millisecond timestamp.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Generate a new unique request ID using ULID.
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// The JSON body carried by a correlated SSE event.
///
/// ```text
/// event: notify
/// data: {"requestId":"01J…","phase":"delta","type":"chunk","payload":"x"}
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamFrame {
    #[serde(rename = "requestId", alias = "request_id")]
    pub request_id: RequestId,
    pub phase: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl StreamFrame {
    /// Parse a frame from an event's data field.
    pub fn from_data(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }
}

/// What a listener callback receives.
#[derive(Clone, Debug, PartialEq)]
pub struct ListenEvent {
    pub request_id: RequestId,
    pub phase: String,
    pub event_type: String,
    pub payload: serde_json::Value,
}

impl ListenEvent {
    /// Build a client-synthesized event.
    pub fn synthesized(
        request_id: RequestId,
        phase: &str,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            request_id,
            phase: phase.to_string(),
            event_type: event_type.to_string(),
            payload,
        }
    }
}

impl From<StreamFrame> for ListenEvent {
    fn from(frame: StreamFrame) -> Self {
        Self {
            request_id: frame.request_id,
            phase: frame.phase,
            event_type: frame.event_type,
            payload: frame.payload,
        }
    }
}

/// Classification of an incoming SSE event by the connection driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum EventKind {
    /// Named with the configured event name; carries a [`StreamFrame`].
    Correlated,
    /// A liveness ping.
    Heartbeat,
    /// Anything else. Counts as activity but is not dispatched.
    Other,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Correlated => write!(f, "Correlated"),
            Self::Heartbeat => write!(f, "Heartbeat"),
            Self::Other => write!(f, "Other"),
        }
    }
}
